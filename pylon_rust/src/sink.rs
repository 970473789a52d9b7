use std::io::Write;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use pylon_core::error::BmsError;
use serde::Serialize;
use tracing::{debug, info};

/// Connection state of a telemetry sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkConnection {
    Connecting,
    Connected,
    Disconnected,
}

/// Observable connection state, shared between a sink's I/O and the poll thread.
#[derive(Debug)]
pub struct SinkStatus {
    state: Mutex<SinkConnection>,
    changed: Condvar,
}

impl SinkStatus {
    pub fn new(initial: SinkConnection) -> Self {
        Self {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> SinkConnection {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, state: SinkConnection) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *guard != state {
            debug!(from = ?*guard, to = ?state, "sink connection changed");
            *guard = state;
            self.changed.notify_all();
        }
    }

    /// Blocks until the sink reports `Connected`, for at most `timeout`.
    pub fn wait_connected(&self, timeout: Duration) -> Result<(), BmsError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while *guard != SinkConnection::Connected {
            let now = Instant::now();
            if now >= deadline {
                return Err(BmsError::SinkUnavailable(timeout));
            }
            guard = match self.changed.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Ok(())
    }
}

/// Destination for published telemetry.
///
/// Implementations may do their I/O in the background; `publish` only has to
/// accept or reject the message.
pub trait TelemetrySink: Send {
    fn status(&self) -> &SinkStatus;

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BmsError>;

    /// Releases the connection. Called once on shutdown.
    fn disconnect(&mut self) {
        self.status().set(SinkConnection::Disconnected);
    }
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for Box<T> {
    fn status(&self) -> &SinkStatus {
        (**self).status()
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BmsError> {
        (**self).publish(topic, payload, retain)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    topic: &'a str,
    payload: &'a str,
    retain: bool,
}

/// Writes one JSON object per message to any writer, stdout by default.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    status: SinkStatus,
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            status: SinkStatus::new(SinkConnection::Connected),
        }
    }

    /// Every publish is flushed, so the writer is returned as is.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TelemetrySink for JsonLinesSink<W> {
    fn status(&self) -> &SinkStatus {
        &self.status
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BmsError> {
        let publish_error = |reason: String| BmsError::Publish {
            topic: topic.to_string(),
            reason,
        };

        if self.status.get() != SinkConnection::Connected {
            return Err(publish_error("sink is not connected".to_string()));
        }

        let envelope = Envelope {
            topic,
            payload,
            retain,
        };
        let line = serde_json::to_string(&envelope).map_err(|e| publish_error(e.to_string()))?;
        writeln!(self.writer, "{line}")
            .and_then(|_| self.writer.flush())
            .map_err(|e| publish_error(e.to_string()))
    }

    fn disconnect(&mut self) {
        let _ = self.writer.flush();
        self.status.set(SinkConnection::Disconnected);
    }
}

/// Sends every message to the log instead of a broker.
pub struct LogSink {
    status: SinkStatus,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            status: SinkStatus::new(SinkConnection::Connected),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for LogSink {
    fn status(&self) -> &SinkStatus {
        &self.status
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BmsError> {
        if self.status.get() != SinkConnection::Connected {
            return Err(BmsError::Publish {
                topic: topic.to_string(),
                reason: "sink is not connected".to_string(),
            });
        }
        info!(topic, payload, retain, "publish");
        Ok(())
    }
}
