use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use pylon_core::classifier::DelimiterClassifier;
use pylon_core::constants::console::{COMMAND_COMPLETED, SESSION_PROMPT};
use pylon_core::constants::frame::{BLOCK_START_MARKER, FIELD_DELIMITER};
use pylon_core::constants::topics::DEFAULT_PREFIX;
use pylon_core::discovery::{DeviceMetadata, TopicScheme};
use pylon_core::frame_parser::{CellLayout, FrameParser};
use serde::Deserialize;

/// Runtime configuration, resolved once at startup and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub device: DeviceConfig,
    pub protocol: ProtocolConfig,
    pub poll: PollConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound for a single command's response.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 5_000,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Barcode of the master module, sent with the authorization command.
    pub barcode: String,
    /// Identifier used in topics and unique ids.
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            barcode: String::new(),
            device_id: "pylontech_bms".to_string(),
            name: "Pylontech BMS".to_string(),
            manufacturer: "Pylontech".to_string(),
            model: "US5000".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn metadata(&self) -> DeviceMetadata {
        DeviceMetadata {
            identifiers: vec![self.device_id.clone()],
            name: self.name.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
        }
    }
}

/// Which token ends the response to the data command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataTerminator {
    /// The session prompt.
    Prompt,
    /// The "command completed" marker, after which the rest of the output is
    /// drained up to the prompt.
    #[default]
    Completed,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub delimiter: char,
    /// Output before the last occurrence of this marker is ignored. `None` disables it.
    pub block_start: Option<char>,
    pub prompt: String,
    pub completion_marker: String,
    pub data_terminator: DataTerminator,
    pub cell_layout: CellLayout,
    /// Pause after each handshake step before the next command.
    pub settle_delay_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            delimiter: FIELD_DELIMITER,
            block_start: Some(BLOCK_START_MARKER),
            prompt: SESSION_PROMPT.to_string(),
            completion_marker: COMMAND_COMPLETED.to_string(),
            data_terminator: DataTerminator::default(),
            cell_layout: CellLayout::default(),
            settle_delay_ms: 500,
        }
    }
}

impl ProtocolConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// The literal token that ends a data response.
    pub fn data_terminator_token(&self) -> &str {
        match self.data_terminator {
            DataTerminator::Prompt => &self.prompt,
            DataTerminator::Completed => &self.completion_marker,
        }
    }

    pub fn frame_parser(&self) -> FrameParser<DelimiterClassifier> {
        FrameParser::with_classifier(
            DelimiterClassifier::new(self.delimiter, self.block_start),
            self.cell_layout,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    /// Consecutive timed out cycles before the session is re-established.
    pub max_consecutive_timeouts: u32,
    /// Handshake attempts per reconnect before giving up.
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_consecutive_timeouts: 3,
            max_reconnect_attempts: 5,
            reconnect_backoff_secs: 5,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

/// Where published messages go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkOutput {
    /// One JSON object per message on stdout.
    #[default]
    Stdout,
    /// Messages are written to the log at info level.
    Log,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub topic_prefix: String,
    pub connect_timeout_secs: u64,
    pub output: SinkOutput,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_PREFIX.to_string(),
            connect_timeout_secs: 10,
            output: SinkOutput::default(),
        }
    }
}

impl SinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl BridgeConfig {
    /// Reads a TOML file. Missing sections and keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Rejects values the poll loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.device.barcode.trim().is_empty() {
            bail!("device barcode is required for the authorization handshake");
        }
        if self.device.barcode.contains(char::is_whitespace) {
            bail!("device barcode must not contain whitespace");
        }
        if self.device.device_id.is_empty()
            || !self
                .device
                .device_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!(
                "device id `{}` must be non-empty and use only [A-Za-z0-9_-]",
                self.device.device_id
            );
        }
        if self.serial.baud_rate == 0 {
            bail!("baud rate must be greater than zero");
        }
        if self.serial.read_timeout_ms == 0 {
            bail!("read timeout must be greater than zero");
        }
        if self.poll.interval_secs == 0 {
            bail!("poll interval must be greater than zero");
        }
        if self.poll.max_consecutive_timeouts == 0 || self.poll.max_reconnect_attempts == 0 {
            bail!("timeout threshold and reconnect attempts must be at least 1");
        }
        if self.protocol.prompt.is_empty() || self.protocol.completion_marker.is_empty() {
            bail!("prompt and completion marker must not be empty");
        }
        if self.protocol.block_start == Some(self.protocol.delimiter) {
            bail!(
                "block start marker `{}` must differ from the field delimiter",
                self.protocol.delimiter
            );
        }
        Ok(())
    }

    pub fn topic_scheme(&self) -> TopicScheme {
        TopicScheme::new(&self.sink.topic_prefix, &self.device.device_id)
    }
}
