use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use pylon_rust::config::{BridgeConfig, DataTerminator, SinkOutput};

#[derive(Parser, Debug)]
#[command(
    name = "pylon-bridge",
    version,
    about = "Polls a Pylontech BMS over its debug console and publishes the readings"
)]
pub struct Cli {
    /// TOML configuration file. Flags and environment variables override it.
    #[arg(short, long, env = "PYLON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Serial device, e.g. /dev/ttyUSB0 or COM3.
    #[arg(short, long, env = "PYLON_SERIAL_PORT")]
    pub port: Option<String>,

    #[arg(short, long, env = "PYLON_BAUD")]
    pub baud: Option<u32>,

    /// Barcode of the master module, used to authorize the console.
    #[arg(long, env = "PYLON_BARCODE")]
    pub barcode: Option<String>,

    /// Identifier used in topics.
    #[arg(long, env = "PYLON_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Seconds between polls.
    #[arg(short, long, env = "PYLON_INTERVAL")]
    pub interval: Option<u64>,

    #[arg(long, env = "PYLON_TOPIC_PREFIX")]
    pub topic_prefix: Option<String>,

    #[arg(long, env = "PYLON_OUTPUT", value_enum)]
    pub output: Option<OutputArg>,

    /// Token that ends a `getpwr` response.
    #[arg(long, env = "PYLON_TERMINATOR", value_enum)]
    pub terminator: Option<TerminatorArg>,

    /// Run against a simulated BMS instead of a serial port.
    #[arg(long, env = "PYLON_SIMULATE")]
    pub simulate: bool,

    /// Default to debug logging when neither PYLON_LOG nor RUST_LOG is set.
    #[arg(short, long, env = "PYLON_DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON.
    #[arg(long, env = "PYLON_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputArg {
    Stdout,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TerminatorArg {
    Prompt,
    Completed,
}

impl Cli {
    /// Builds the runtime configuration: defaults, then the file, then flags.
    pub fn resolve_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)?,
            None => BridgeConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        if let Some(barcode) = &self.barcode {
            config.device.barcode = barcode.clone();
        }
        if let Some(device_id) = &self.device_id {
            config.device.device_id = device_id.clone();
        }
        if let Some(interval) = self.interval {
            config.poll.interval_secs = interval;
        }
        if let Some(prefix) = &self.topic_prefix {
            config.sink.topic_prefix = prefix.clone();
        }
        if let Some(output) = self.output {
            config.sink.output = match output {
                OutputArg::Stdout => SinkOutput::Stdout,
                OutputArg::Log => SinkOutput::Log,
            };
        }
        if let Some(terminator) = self.terminator {
            config.protocol.data_terminator = match terminator {
                TerminatorArg::Prompt => DataTerminator::Prompt,
                TerminatorArg::Completed => DataTerminator::Completed,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "pylon-bridge",
            "--port",
            "/dev/ttyS3",
            "--barcode",
            "PPTAP01419B15082",
            "--interval",
            "30",
            "--output",
            "log",
            "--terminator",
            "prompt",
        ])
        .unwrap();

        let config = cli.resolve_config().unwrap();
        assert_eq!(config.serial.port, "/dev/ttyS3");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.device.barcode, "PPTAP01419B15082");
        assert_eq!(config.poll.interval_secs, 30);
        assert_eq!(config.sink.output, SinkOutput::Log);
        assert_eq!(config.protocol.data_terminator, DataTerminator::Prompt);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::try_parse_from(["pylon-bridge", "--config", "/nonexistent/pylon.toml"])
            .unwrap();
        assert!(cli.resolve_config().is_err());
    }
}
