mod cli;
mod logging;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use pylon_rust::config::{BridgeConfig, SinkOutput};
use pylon_rust::link::SerialLink;
use pylon_rust::mock_serial::MockSerialPort;
use pylon_rust::poll_loop::PollLoop;
use pylon_rust::session::PylonSession;
use pylon_rust::sink::{JsonLinesSink, LogSink, TelemetrySink};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info};

use crate::cli::Cli;

/// Cells reported by the simulated pack, as on a US5000 module.
const SIMULATED_CELLS: usize = 15;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init_tracing(cli.debug, cli.log_json) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.resolve_config()?;
    config.validate().context("invalid configuration")?;

    let sink: Box<dyn TelemetrySink> = match config.sink.output {
        SinkOutput::Stdout => Box::new(JsonLinesSink::stdout()),
        SinkOutput::Log => Box::new(LogSink::new()),
    };

    if cli.simulate {
        info!(barcode = %config.device.barcode, "running against a simulated BMS");
        let (port, device) = MockSerialPort::pair(config.serial.read_timeout());
        device.script_pylontech(&config.device.barcode, SIMULATED_CELLS);
        let session = PylonSession::from_link(
            port,
            "simulated",
            config.serial.read_timeout(),
            &config.protocol,
        )?;
        return poll(session, sink, &config);
    }

    let session = PylonSession::open(&config.serial, &config.protocol)
        .with_context(|| format!("opening {}", config.serial.port))?;
    poll(session, sink, &config)
}

fn poll<L: SerialLink>(
    session: PylonSession<L>,
    sink: Box<dyn TelemetrySink>,
    config: &BridgeConfig,
) -> Result<()> {
    let mut poll_loop = PollLoop::new(session, sink, config);

    // SIGINT and SIGTERM only raise the flag. The loop stops at the next cycle
    // boundary and releases the port and the sink on its way out.
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, poll_loop.stop_flag())
            .with_context(|| format!("installing handler for signal {signal}"))?;
    }

    poll_loop.run().context("poll loop failed")
}
