use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use pylon_core::constants::console::*;
use pylon_core::error::{AuthFailure, BmsError};
use pylon_core::module_info::{ModuleInfo, parse_module_info};
use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::config::{ProtocolConfig, SerialConfig};
use crate::link::SerialLink;

/// How long a single `read` call blocks. The response timeout is enforced on
/// top of this, so it only bounds how quickly a deadline is noticed.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Lifecycle of the console session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    LoggingIn,
    Authorizing,
    Ready,
    Faulted,
}

/// Half-duplex command session on the BMS debug console.
///
/// Owns the link exclusively. Every method writes at most one command and
/// reads its response before returning, so a command is never issued while
/// another one is still outstanding.
pub struct PylonSession<L: SerialLink> {
    link: L,
    port_name: String,
    protocol: ProtocolConfig,
    read_timeout: Duration,
    state: SessionState,
    /// Bytes read past the terminator of the current response.
    pending: Vec<u8>,
}

impl PylonSession<Box<dyn SerialPort>> {
    /// Opens the serial port described by `serial`.
    ///
    /// # Arguments
    ///
    /// - `serial` (`&SerialConfig`) - Port path, baud rate and response timeout.
    /// - `protocol` (`&ProtocolConfig`) - Prompt and marker tokens of the console.
    pub fn open(serial: &SerialConfig, protocol: &ProtocolConfig) -> Result<Self, BmsError> {
        let connection_error = |source: io::Error| BmsError::Connection {
            port: serial.port.clone(),
            source,
        };

        let mut port: Box<dyn SerialPort> = serialport::new(&serial.port, serial.baud_rate)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| connection_error(io::Error::from(e)))?;

        // Sets DTR so adapters that gate the line on it behave the same everywhere
        port.write_data_terminal_ready(true)
            .map_err(|e| connection_error(io::Error::from(e)))?;
        // Give the adapter a moment to settle after opening the port
        std::thread::sleep(Duration::from_millis(50));

        info!(port = %serial.port, baud = serial.baud_rate, "serial port opened");
        Self::from_link(port, &serial.port, serial.read_timeout(), protocol)
    }
}

impl<L: SerialLink> PylonSession<L> {
    /// Wraps an already open link.
    pub fn from_link(
        mut link: L,
        port_name: &str,
        read_timeout: Duration,
        protocol: &ProtocolConfig,
    ) -> Result<Self, BmsError> {
        link.set_read_timeout(READ_SLICE.min(read_timeout))
            .map_err(|source| BmsError::Connection {
                port: port_name.to_string(),
                source,
            })?;

        Ok(Self {
            link,
            port_name: port_name.to_string(),
            protocol: protocol.clone(),
            read_timeout,
            state: SessionState::Disconnected,
            pending: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Opens a debug shell session.
    ///
    /// Output left over from an earlier session is discarded by `execute`, so
    /// it cannot be mistaken for the prompt.
    pub fn login(&mut self) -> Result<(), BmsError> {
        self.state = SessionState::LoggingIn;

        let prompt = self.protocol.prompt.clone();
        match self.execute(LOGIN_COMMAND, &prompt, self.read_timeout) {
            Ok(_) => {}
            Err(BmsError::Timeout { .. }) => return Err(self.fault(AuthFailure::LoginFailed)),
            Err(e) => return Err(self.fail(e)),
        }

        debug!("login accepted");
        std::thread::sleep(self.protocol.settle_delay());
        Ok(())
    }

    /// Authorizes the session with the BMS barcode.
    pub fn authorize(&mut self, barcode: &str) -> Result<(), BmsError> {
        self.state = SessionState::Authorizing;

        let command = format!("{AUTHORIZE_COMMAND} {barcode}");
        let prompt = self.protocol.prompt.clone();
        let response = match self.execute(&command, &prompt, self.read_timeout) {
            Ok(response) => response,
            Err(BmsError::Timeout { .. }) => {
                return Err(self.fault(AuthFailure::AuthorizationFailed));
            }
            Err(e) => return Err(self.fail(e)),
        };

        if !response.contains(AUTHORIZATION_ACCEPTED) {
            debug!(response = %response.trim(), "authorization rejected");
            return Err(self.fault(AuthFailure::AuthorizationFailed));
        }

        debug!("authorization accepted");
        std::thread::sleep(self.protocol.settle_delay());
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Runs the full login and authorization sequence.
    ///
    /// The device cannot resume a session, so reconnecting always goes through here.
    pub fn handshake(&mut self, barcode: &str) -> Result<(), BmsError> {
        self.login()?;
        self.authorize(barcode)?;
        info!(port = %self.port_name, "console session ready");
        Ok(())
    }

    /// Writes `command` and reads until `terminator` shows up.
    ///
    /// Input received before the command is written is discarded, so a late or
    /// unsolicited line is never taken as this command's response.
    ///
    /// # Arguments
    ///
    /// - `command` (`&str`) - Command line without the trailing newline.
    /// - `terminator` (`&str`) - Token that ends the response.
    /// - `timeout` (`Duration`) - Upper bound for the whole response.
    ///
    /// # Returns
    ///
    /// - `Result<String, BmsError>` - The response up to and including the terminator,
    ///   with non-ASCII bytes dropped. `BmsError::Timeout` if the terminator did not
    ///   arrive in time, `BmsError::Connection` if the link failed.
    pub fn execute(
        &mut self,
        command: &str,
        terminator: &str,
        timeout: Duration,
    ) -> Result<String, BmsError> {
        // No command is outstanding, so anything already received is stale.
        self.discard_input()?;

        debug!(command, "sending command");
        let line = format!("{command}{LINE_TERMINATOR}");
        self.link
            .write_all(line.as_bytes())
            .and_then(|_| self.link.flush())
            .map_err(|source| self.connection_error(source))?;

        match self.read_until(terminator.as_bytes(), timeout) {
            Some(Ok(bytes)) => Ok(decode_ascii(&bytes)),
            Some(Err(source)) => Err(self.connection_error(source)),
            None => Err(BmsError::Timeout {
                command: command.to_string(),
                terminator: terminator.to_string(),
                timeout,
            }),
        }
    }

    /// Requests one telemetry frame with the data command.
    ///
    /// When the response is cut at the completion marker, the trailing output
    /// is read up to the prompt so the next command starts aligned.
    pub fn request_telemetry(&mut self) -> Result<String, BmsError> {
        let terminator = self.protocol.data_terminator_token().to_string();
        let response = self.execute(DATA_COMMAND, &terminator, self.read_timeout)?;

        if terminator != self.protocol.prompt {
            let prompt = self.protocol.prompt.clone();
            match self.read_until(prompt.as_bytes(), self.read_timeout) {
                Some(Ok(_)) => {}
                Some(Err(source)) => return Err(self.connection_error(source)),
                None => {
                    warn!("prompt did not follow the data response, resyncing on next command");
                }
            }
        }

        Ok(response)
    }

    /// Reads the logical module map with the info command.
    pub fn module_info(&mut self) -> Result<Vec<ModuleInfo>, BmsError> {
        let prompt = self.protocol.prompt.clone();
        let response = self.execute(INFO_COMMAND, &prompt, self.read_timeout)?;
        Ok(parse_module_info(&response))
    }

    /// Marks the session as closed. The link itself is released on drop.
    pub fn close(&mut self) {
        if self.state != SessionState::Disconnected {
            info!(port = %self.port_name, "closing console session");
        }
        self.pending.clear();
        self.state = SessionState::Disconnected;
    }

    fn discard_input(&mut self) -> Result<(), BmsError> {
        if !self.pending.is_empty() {
            debug!(bytes = self.pending.len(), "discarding stale output");
        }
        self.pending.clear();
        self.link
            .discard_input()
            .map_err(|source| self.connection_error(source))
    }

    /// Reads until `terminator`, keeping anything past it for the next call.
    ///
    /// Returns `None` on timeout.
    fn read_until(&mut self, terminator: &[u8], timeout: Duration) -> Option<io::Result<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; 256];
        let mut scanned = 0usize;

        loop {
            if let Some(end) = find(&self.pending, terminator, scanned) {
                let rest = self.pending.split_off(end + terminator.len());
                let response = std::mem::replace(&mut self.pending, rest);
                return Some(Ok(response));
            }
            // The terminator may straddle two reads.
            scanned = self.pending.len().saturating_sub(terminator.len().saturating_sub(1));

            if Instant::now() >= deadline {
                return None;
            }

            match self.link.read(&mut buffer) {
                Ok(n @ 1..) => self.pending.extend_from_slice(&buffer[..n]),
                Ok(0) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn connection_error(&mut self, source: io::Error) -> BmsError {
        self.state = SessionState::Faulted;
        BmsError::Connection {
            port: self.port_name.clone(),
            source,
        }
    }

    fn fault(&mut self, failure: AuthFailure) -> BmsError {
        warn!(%failure, "console handshake failed");
        self.state = SessionState::Faulted;
        BmsError::Auth(failure)
    }

    fn fail(&mut self, error: BmsError) -> BmsError {
        self.state = SessionState::Faulted;
        error
    }
}

impl<L: SerialLink> Drop for PylonSession<L> {
    fn drop(&mut self) {
        self.close();
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (from.min(haystack.len())..=haystack.len() - needle.len())
        .find(|&start| &haystack[start..start + needle.len()] == needle)
}

/// Decodes console output, dropping anything that is not ASCII.
fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataTerminator;
    use crate::mock_serial::{MockDeviceHandle, MockSerialPort, sample_data_response};

    const BARCODE: &str = "PPTAP01419B15082";

    fn protocol() -> ProtocolConfig {
        ProtocolConfig {
            settle_delay_ms: 0,
            ..ProtocolConfig::default()
        }
    }

    fn session_with(protocol: ProtocolConfig) -> (PylonSession<MockSerialPort>, MockDeviceHandle) {
        let (port, device) = MockSerialPort::pair(Duration::from_millis(10));
        let session =
            PylonSession::from_link(port, "mock", Duration::from_millis(200), &protocol).unwrap();
        (session, device)
    }

    fn session() -> (PylonSession<MockSerialPort>, MockDeviceHandle) {
        session_with(protocol())
    }

    #[test]
    fn test_open_invalid_port_is_connection_error() {
        let serial = SerialConfig {
            port: "invalid_port_name".to_string(),
            ..SerialConfig::default()
        };
        let result = PylonSession::open(&serial, &protocol());
        assert!(matches!(result, Err(BmsError::Connection { .. })));
    }

    #[test]
    fn test_handshake_reaches_ready() {
        let (mut session, device) = session();
        device.script_pylontech(BARCODE, 2);

        assert_eq!(session.state(), SessionState::Disconnected);
        session.handshake(BARCODE).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            device.written(),
            format!("login debug\ntbar {BARCODE}\n")
        );
    }

    #[test]
    fn test_login_without_prompt_fails() {
        let (mut session, device) = session();
        device.respond(LOGIN_COMMAND, "login debug\r\nERROR\r\n");

        let err = session.login().unwrap_err();
        assert!(matches!(err, BmsError::Auth(AuthFailure::LoginFailed)));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_authorize_without_acceptance_fails() {
        let (mut session, device) = session();
        device.script_pylontech(BARCODE, 2);

        session.login().unwrap();
        let err = session.authorize("WRONGBARCODE").unwrap_err();
        assert!(matches!(err, BmsError::Auth(AuthFailure::AuthorizationFailed)));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_login_discards_stale_output() {
        let (mut session, device) = session();
        device.script_pylontech(BARCODE, 2);
        device.inject("3300#0#OK#OK\r\npylon_debug>");

        session.login().unwrap();
        let response = session.execute("tbar SN", "pylon_debug>", Duration::from_millis(200)).unwrap();
        assert!(!response.contains("3300"));
    }

    #[test]
    fn test_execute_times_out() {
        let (mut session, _device) = session();
        let err = session
            .execute(DATA_COMMAND, SESSION_PROMPT, Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_late_output_is_discarded_after_timeout() {
        let (mut session, device) = session();
        device.script_pylontech(BARCODE, 1);
        session.handshake(BARCODE).unwrap();

        device.ignore_once(DATA_COMMAND);
        assert!(session.request_telemetry().unwrap_err().is_timeout());

        // The late answer to the timed out request must not satisfy the next one.
        device.inject("LATE#1\r\nCommand completed successfully\r\npylon_debug>");
        let response = session.request_telemetry().unwrap();
        assert!(!response.contains("LATE"));
        assert!(response.contains("51200#"));
    }

    #[test]
    fn test_stray_prompt_between_commands_is_not_a_response() {
        let (mut session, device) = session_with(ProtocolConfig {
            data_terminator: DataTerminator::Prompt,
            ..protocol()
        });
        device.script_pylontech(BARCODE, 2);
        session.handshake(BARCODE).unwrap();

        device.inject(format!("\r\n{SESSION_PROMPT}"));
        for _ in 0..3 {
            let response = session.request_telemetry().unwrap();
            assert_eq!(response, sample_data_response(2));
        }
    }

    #[test]
    fn test_bytes_past_terminator_do_not_leak_into_next_response() {
        let (mut session, device) = session();
        device.respond_once("first", format!("one\r\n{SESSION_PROMPT}trailing{SESSION_PROMPT}"));
        device.respond_once("second", format!("two\r\n{SESSION_PROMPT}"));

        let first = session
            .execute("first", SESSION_PROMPT, Duration::from_millis(200))
            .unwrap();
        assert_eq!(first, format!("one\r\n{SESSION_PROMPT}"));

        let second = session
            .execute("second", SESSION_PROMPT, Duration::from_millis(200))
            .unwrap();
        assert_eq!(second, format!("two\r\n{SESSION_PROMPT}"));
    }

    #[test]
    fn test_request_telemetry_drains_to_prompt() {
        let (mut session, device) = session();
        device.script_pylontech(BARCODE, 3);
        session.handshake(BARCODE).unwrap();

        let first = session.request_telemetry().unwrap();
        assert!(first.ends_with(COMMAND_COMPLETED));
        let second = session.request_telemetry().unwrap();
        assert!(second.starts_with(DATA_COMMAND));
        assert_eq!(device.command_count(DATA_COMMAND), 2);
    }

    #[test]
    fn test_prompt_terminated_data_response() {
        let (mut session, device) = session_with(ProtocolConfig {
            data_terminator: DataTerminator::Prompt,
            ..protocol()
        });
        device.script_pylontech(BARCODE, 1);
        session.handshake(BARCODE).unwrap();

        let response = session.request_telemetry().unwrap();
        assert_eq!(response, sample_data_response(1));
    }

    #[test]
    fn test_terminator_split_across_reads() {
        let (mut session, device) = session();
        device.respond_once("cmd", "partial pylon_");
        let handle = device.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            handle.inject("debug>");
        });

        let response = session
            .execute("cmd", SESSION_PROMPT, Duration::from_millis(500))
            .unwrap();
        writer.join().unwrap();
        assert_eq!(response, "partial pylon_debug>");
    }

    #[test]
    fn test_module_info() {
        let (mut session, device) = session();
        device.script_pylontech(BARCODE, 1);
        session.handshake(BARCODE).unwrap();

        let modules = session.module_info().unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].barcode, BARCODE);
    }

    #[test]
    fn test_disconnect_is_connection_error() {
        let (mut session, device) = session();
        device.disconnect();
        let err = session
            .execute(DATA_COMMAND, SESSION_PROMPT, Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_non_ascii_bytes_are_dropped() {
        assert_eq!(decode_ascii(b"a\xffb\xc3\xa9c"), "abc");
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abcabc", b"bc", 0), Some(1));
        assert_eq!(find(b"abcabc", b"bc", 2), Some(4));
        assert_eq!(find(b"ab", b"abc", 0), None);
        assert_eq!(find(b"abc", b"", 0), None);
    }
}
