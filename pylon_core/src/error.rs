use std::time::Duration;

use thiserror::Error;

/// Which half of the console handshake failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The prompt never appeared after `login debug`.
    LoginFailed,
    /// The shell did not accept the barcode sent with `tbar`.
    AuthorizationFailed,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::LoginFailed => f.write_str("login failed"),
            AuthFailure::AuthorizationFailed => f.write_str("authorization failed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BmsError {
    #[error("serial connection error on {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Auth(AuthFailure),

    #[error("no `{terminator}` from the console within {timeout:?} after `{command}`")]
    Timeout {
        command: String,
        terminator: String,
        timeout: Duration,
    },

    #[error("incomplete frame (summary: {summary}, cells: {cells}, footer: {footer})")]
    Incomplete {
        summary: bool,
        cells: usize,
        footer: bool,
    },

    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("telemetry sink not connected within {0:?}")]
    SinkUnavailable(Duration),
}

impl BmsError {
    /// Fatal errors end the poll loop, everything else only costs a cycle.
    ///
    /// Authentication failures are not fatal here: at runtime they are retried
    /// through a reconnect and only become fatal once the retry budget is spent,
    /// or when they happen during the first handshake.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BmsError::Connection { .. } | BmsError::SinkUnavailable(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BmsError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let connection = BmsError::Connection {
            port: "/dev/ttyUSB0".to_string(),
            source: std::io::Error::other("gone"),
        };
        assert!(connection.is_fatal());
        assert!(BmsError::SinkUnavailable(Duration::from_secs(10)).is_fatal());
        assert!(!BmsError::Auth(AuthFailure::LoginFailed).is_fatal());
        assert!(
            !BmsError::Publish {
                topic: "t".to_string(),
                reason: "r".to_string()
            }
            .is_fatal()
        );

        let timeout = BmsError::Timeout {
            command: "getpwr".to_string(),
            terminator: "pylon_debug>".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn test_auth_display() {
        assert_eq!(
            BmsError::Auth(AuthFailure::AuthorizationFailed).to_string(),
            "authorization failed"
        );
    }
}
