use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pylon_core::error::BmsError;
use pylon_core::frame_parser::FrameParser;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, PollConfig};
use crate::link::SerialLink;
use crate::publisher::{PublishReport, TelemetryPublisher};
use crate::session::PylonSession;
use crate::sink::TelemetrySink;

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Connecting,
    Authenticating,
    Polling,
    Terminated,
}

/// Why a cycle published nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The console did not answer in time. Carries the current run length.
    Timeout { consecutive: u32 },
    /// The frame was missing its summary, cells or footer.
    Incomplete,
    /// A stop was requested while the session was being re-established.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published(PublishReport),
    Skipped(SkipReason),
    /// Too many timeouts in a row; the session was re-established.
    Reconnected,
}

/// Periodic request, parse and publish cycle over one console session.
///
/// Recoverable errors are absorbed inside `cycle`. Anything `run` returns is
/// fatal, and the session and sink are released before it does.
pub struct PollLoop<L: SerialLink, S: TelemetrySink> {
    session: PylonSession<L>,
    parser: FrameParser,
    publisher: TelemetryPublisher<S>,
    barcode: String,
    poll: PollConfig,
    sink_timeout: Duration,
    state: PollState,
    consecutive_timeouts: u32,
    stop: Arc<AtomicBool>,
}

impl<L: SerialLink, S: TelemetrySink> PollLoop<L, S> {
    /// Creates a new loop around an open session and a sink.
    ///
    /// # Arguments
    ///
    /// - `session` (`PylonSession<L>`) - Session on an open link, not yet logged in.
    /// - `sink` (`S`) - Destination for discovery and state messages.
    /// - `config` (`&BridgeConfig`) - Validated runtime configuration.
    pub fn new(session: PylonSession<L>, sink: S, config: &BridgeConfig) -> Self {
        let publisher = TelemetryPublisher::new(
            sink,
            config.topic_scheme(),
            config.device.metadata(),
            config.protocol.cell_layout,
        );

        Self {
            session,
            parser: config.protocol.frame_parser(),
            publisher,
            barcode: config.device.barcode.clone(),
            poll: config.poll.clone(),
            sink_timeout: config.sink.connect_timeout(),
            state: PollState::Connecting,
            consecutive_timeouts: 0,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting this flag, from another thread or a signal handler, stops the
    /// loop at the next cycle boundary and cuts short any pending sleep.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn publisher(&self) -> &TelemetryPublisher<S> {
        &self.publisher
    }

    /// Runs until stopped or until a fatal error.
    ///
    /// # Returns
    ///
    /// - `Result<(), BmsError>` - `Ok` after an orderly stop. Otherwise the error that
    ///   ended the loop: a connection failure, an unreachable sink, a rejected
    ///   startup handshake, or a reconnect that ran out of attempts.
    pub fn run(&mut self) -> Result<(), BmsError> {
        let result = self.run_until_stopped();
        if let Err(e) = &result {
            error!(error = %e, state = ?self.state, "poll loop terminated");
        }
        self.stop();
        result
    }

    fn run_until_stopped(&mut self) -> Result<(), BmsError> {
        self.state = PollState::Connecting;
        info!(timeout = ?self.sink_timeout, "waiting for telemetry sink");
        self.publisher
            .sink()
            .status()
            .wait_connected(self.sink_timeout)?;
        if self.stop_requested() {
            return Ok(());
        }

        self.state = PollState::Authenticating;
        self.session.handshake(&self.barcode)?;
        self.log_module_map()?;
        if self.stop_requested() {
            return Ok(());
        }

        let failed = self.publisher.publish_pack_discovery();
        if failed > 0 {
            warn!(failed, "some discovery documents were not published");
        }

        self.state = PollState::Polling;
        info!(interval = ?self.poll.interval(), "polling started");

        while !self.stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            let outcome = self.cycle()?;
            debug!(?outcome, elapsed = ?started.elapsed(), "cycle finished");

            let remaining = self.poll.interval().saturating_sub(started.elapsed());
            sleep_interruptible(remaining, &self.stop);
        }

        info!("poll loop stopped");
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        let stop = self.stop.load(Ordering::Relaxed);
        if stop {
            info!(state = ?self.state, "stop requested before polling started");
        }
        stop
    }

    /// Runs one request, parse and publish cycle.
    ///
    /// Timeouts and incomplete frames skip the cycle. After
    /// `max_consecutive_timeouts` timeouts in a row the session is
    /// re-established with a fresh handshake.
    pub fn cycle(&mut self) -> Result<CycleOutcome, BmsError> {
        let raw = match self.session.request_telemetry() {
            Ok(raw) => {
                self.consecutive_timeouts = 0;
                raw
            }
            Err(e) if e.is_timeout() => {
                self.consecutive_timeouts += 1;
                warn!(
                    consecutive = self.consecutive_timeouts,
                    threshold = self.poll.max_consecutive_timeouts,
                    error = %e,
                    "skipping cycle"
                );

                if self.consecutive_timeouts < self.poll.max_consecutive_timeouts {
                    return Ok(CycleOutcome::Skipped(SkipReason::Timeout {
                        consecutive: self.consecutive_timeouts,
                    }));
                }
                if self.reconnect()? {
                    return Ok(CycleOutcome::Reconnected);
                }
                return Ok(CycleOutcome::Skipped(SkipReason::Stopped));
            }
            Err(e) => return Err(e),
        };

        match self.parser.parse(&raw).into_complete() {
            Ok(snapshot) => {
                let report = self.publisher.publish(&snapshot);
                if report.failed > 0 {
                    warn!(
                        published = report.published,
                        failed = report.failed,
                        "snapshot partially published"
                    );
                }
                Ok(CycleOutcome::Published(report))
            }
            Err(e) => {
                warn!(error = %e, "skipping cycle");
                Ok(CycleOutcome::Skipped(SkipReason::Incomplete))
            }
        }
    }

    /// Logs in and authorizes again, up to `max_reconnect_attempts` times.
    ///
    /// Returns `Ok(false)` when a stop request interrupted the attempts.
    fn reconnect(&mut self) -> Result<bool, BmsError> {
        self.state = PollState::Authenticating;
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(
                attempt,
                max = self.poll.max_reconnect_attempts,
                "re-establishing console session"
            );

            match self.session.handshake(&self.barcode) {
                Ok(()) => break,
                Err(e) if e.is_fatal() || attempt >= self.poll.max_reconnect_attempts => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    sleep_interruptible(self.poll.reconnect_backoff(), &self.stop);
                    if self.stop.load(Ordering::Relaxed) {
                        return Ok(false);
                    }
                }
            }
        }

        self.consecutive_timeouts = 0;
        self.state = PollState::Polling;
        self.log_module_map()?;
        Ok(true)
    }

    /// Logs which module barcode sits behind each BMU index.
    fn log_module_map(&mut self) -> Result<(), BmsError> {
        match self.session.module_info() {
            Ok(modules) if modules.is_empty() => debug!("module map is empty"),
            Ok(modules) => {
                for module in modules {
                    info!(index = module.index, barcode = %module.barcode, "module");
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "module map unavailable"),
        }
        Ok(())
    }

    /// Stops the loop, disconnects the sink and closes the session.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.state == PollState::Terminated {
            return;
        }
        self.publisher.disconnect();
        self.session.close();
        self.state = PollState::Terminated;
    }
}

impl<L: SerialLink, S: TelemetrySink> Drop for PollLoop<L, S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleeps for `total`, waking early once `stop` is set.
fn sleep_interruptible(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(10);
    let mut remaining = total;
    while remaining > Duration::ZERO && !stop.load(Ordering::Relaxed) {
        let s = remaining.min(step);
        thread::sleep(s);
        remaining = remaining.saturating_sub(s);
    }
}
