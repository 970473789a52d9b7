//! In-memory stand-in for the BMS console.
//!
//! `MockSerialPort::pair` returns the host side, which implements
//! `SerialLink`, and a `MockDeviceHandle` that plays the device: it answers
//! command lines from a script and can inject arbitrary bytes.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pylon_core::constants::console::*;

use crate::link::SerialLink;

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Silent,
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    once: VecDeque<Reply>,
    sticky: Option<Reply>,
}

#[derive(Debug, Default)]
struct DeviceState {
    to_host: VecDeque<u8>,
    from_host: Vec<u8>,
    partial_line: Vec<u8>,
    rules: Vec<Rule>,
    disconnected: bool,
}

impl DeviceState {
    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        let Some(rule) = self
            .rules
            .iter_mut()
            .filter(|rule| line.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
        else {
            return;
        };

        let reply = match rule.once.pop_front() {
            Some(reply) => Some(reply),
            None => rule.sticky.clone(),
        };

        if let Some(Reply::Text(text)) = reply {
            self.to_host.extend(text.as_bytes());
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<DeviceState>,
    readable: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not wedge the other side.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Host side of the mock link.
pub struct MockSerialPort {
    shared: Arc<Shared>,
    timeout: Duration,
}

impl MockSerialPort {
    /// Creates a connected host/device pair.
    pub fn pair(timeout: Duration) -> (Self, MockDeviceHandle) {
        let shared = Arc::new(Shared::default());
        let port = Self {
            shared: shared.clone(),
            timeout,
        };
        (port, MockDeviceHandle { shared })
    }
}

impl Read for MockSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.lock();

        loop {
            if state.disconnected {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "mock device disconnected",
                ));
            }

            if !state.to_host.is_empty() {
                let n = buf.len().min(state.to_host.len());
                for (slot, byte) in buf.iter_mut().zip(state.to_host.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timed out"));
            }

            state = match self.shared.readable.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl Write for MockSerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        if state.disconnected {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ));
        }

        state.from_host.extend_from_slice(buf);
        for &byte in buf {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&state.partial_line).into_owned();
                state.partial_line.clear();
                state.handle_line(&line);
            } else {
                state.partial_line.push(byte);
            }
        }
        drop(state);

        self.shared.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MockSerialPort {
    fn discard_input(&mut self) -> io::Result<()> {
        self.shared.lock().to_host.clear();
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}

/// Device side of the mock link.
#[derive(Clone)]
pub struct MockDeviceHandle {
    shared: Arc<Shared>,
}

impl MockDeviceHandle {
    fn with_rule(&self, prefix: &str, apply: impl FnOnce(&mut Rule)) {
        let mut state = self.shared.lock();
        let index = match state.rules.iter().position(|rule| rule.prefix == prefix) {
            Some(index) => index,
            None => {
                state.rules.push(Rule {
                    prefix: prefix.to_string(),
                    once: VecDeque::new(),
                    sticky: None,
                });
                state.rules.len() - 1
            }
        };
        apply(&mut state.rules[index]);
    }

    /// Answers every command line starting with `prefix` with `reply`.
    ///
    /// The longest matching prefix wins when several rules apply.
    pub fn respond(&self, prefix: &str, reply: impl Into<String>) {
        let reply = Reply::Text(reply.into());
        self.with_rule(prefix, |rule| rule.sticky = Some(reply));
    }

    /// Answers the next matching command once, ahead of any sticky reply.
    pub fn respond_once(&self, prefix: &str, reply: impl Into<String>) {
        let reply = Reply::Text(reply.into());
        self.with_rule(prefix, |rule| rule.once.push_back(reply));
    }

    /// Stays silent for the next matching command.
    pub fn ignore_once(&self, prefix: &str) {
        self.with_rule(prefix, |rule| rule.once.push_back(Reply::Silent));
    }

    /// Pushes raw bytes towards the host as if the device had printed them.
    pub fn inject(&self, bytes: impl AsRef<[u8]>) {
        self.shared.lock().to_host.extend(bytes.as_ref());
        self.shared.readable.notify_all();
    }

    /// Everything the host has written so far, lossily decoded.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.shared.lock().from_host).into_owned()
    }

    /// Number of complete command lines starting with `prefix` the host has sent.
    pub fn command_count(&self, prefix: &str) -> usize {
        self.written()
            .lines()
            .filter(|line| line.trim().starts_with(prefix))
            .count()
    }

    /// Makes every further read and write on the host side fail.
    pub fn disconnect(&self) {
        self.shared.lock().disconnected = true;
        self.shared.readable.notify_all();
    }

    /// Scripts a healthy Pylontech console that accepts `barcode`.
    ///
    /// `getpwr` reports `cells` cells and ends with the completion marker and
    /// the prompt, the way current firmware prints it.
    pub fn script_pylontech(&self, barcode: &str, cells: usize) {
        self.respond(
            LOGIN_COMMAND,
            format!("{LOGIN_COMMAND}\r\nWelcome to debug mode\r\n{SESSION_PROMPT}"),
        );
        self.respond(
            AUTHORIZE_COMMAND,
            format!("{AUTHORIZE_COMMAND}\r\nfail\r\n{SESSION_PROMPT}"),
        );
        self.respond(
            &format!("{AUTHORIZE_COMMAND} {barcode}"),
            format!("{AUTHORIZE_COMMAND} {barcode}\r\npass\r\n{SESSION_PROMPT}"),
        );
        self.respond(DATA_COMMAND, sample_data_response(cells));
        self.respond(
            INFO_COMMAND,
            format!(
                "{INFO_COMMAND}\r\n@\r\nBMU 1\r\nDevice: US5000\r\nModule: {barcode}\r\n$$\r\n{SESSION_PROMPT}"
            ),
        );
    }
}

/// A plausible `getpwr` response with `cells` cell lines.
pub fn sample_data_response(cells: usize) -> String {
    let mut out = format!("{DATA_COMMAND}\r\n@\r\n");
    out.push_str("51200#-10500#25000#1000#Dischg#Normal#Normal#Normal\r\n");
    for index in 0..cells {
        let millivolts = 3300 + (index % 7) * 5;
        out.push_str(&format!("{millivolts}#24000#Normal#Normal\r\n"));
    }
    out.push_str("0#\r\n150#\r\n$$\r\n");
    out.push_str(&format!("{COMMAND_COMPLETED}\r\n$$\r\n{SESSION_PROMPT}"));
    out
}
