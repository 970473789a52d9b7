pub mod console {
    /// Opens a debug shell session.
    pub const LOGIN_COMMAND: &str = "login debug";
    /// Authorization command, followed by a space and the BMS barcode.
    pub const AUTHORIZE_COMMAND: &str = "tbar";
    /// Requests the power/cell telemetry block.
    pub const DATA_COMMAND: &str = "getpwr";
    /// Requests the logical module map.
    pub const INFO_COMMAND: &str = "info";
    /// Prompt printed by the debug shell once it is ready for the next command.
    pub const SESSION_PROMPT: &str = "pylon_debug>";
    /// Marker some firmware revisions print after a command's output.
    pub const COMMAND_COMPLETED: &str = "Command completed successfully";
    /// Substring the shell prints when the barcode was accepted.
    pub const AUTHORIZATION_ACCEPTED: &str = "pass";
    /// Every command sent to the console is terminated with this.
    pub const LINE_TERMINATOR: &str = "\n";
}

pub mod frame {
    /// Separates fields on a data line.
    pub const FIELD_DELIMITER: char = '#';
    /// Marks the start of a command's output block.
    pub const BLOCK_START_MARKER: char = '@';
    /// Scaled values are sent as thousandths of the engineering unit.
    pub const THOUSANDTHS: f64 = 1000.0;
    /// A frame needs at least a header and the two footer lines.
    pub const MIN_QUALIFYING_LINES: usize = 3;
    /// Number of footer lines at the end of a frame.
    pub const FOOTER_LINES: usize = 2;
    /// Minimum field count for the header to be read as a summary.
    pub const SUMMARY_MIN_FIELDS: usize = 8;
    /// Minimum field count for a cell line in the basic layout.
    pub const BASIC_CELL_MIN_FIELDS: usize = 2;
    /// Minimum field count for a cell line in the extended layout.
    pub const EXTENDED_CELL_MIN_FIELDS: usize = 4;
}

pub mod topics {
    /// Default topic prefix used by Home Assistant style discovery.
    pub const DEFAULT_PREFIX: &str = "homeassistant";
    pub const COMPONENT: &str = "sensor";
    pub const STATE_SUFFIX: &str = "state";
    pub const CONFIG_SUFFIX: &str = "config";
}
