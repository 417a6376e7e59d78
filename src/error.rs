use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Matches every wording adb servers use to report a missing device.
/// Old servers send "device not found", newer ones "device 'serial' not found".
static DEVICE_NOT_FOUND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"device( '.*')? not found").expect("device-not-found pattern"));

/// Coarse error classification, stable across the wrapping that
/// [`AdbError::context`] adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller violated an API precondition.
    Assertion,
    /// The server produced output we could not make sense of.
    Parse,
    /// Writing to the transport failed.
    Network,
    /// The peer closed the connection mid-message.
    ConnectionReset,
    /// The ADB server socket could not be reached.
    ServerNotAvailable,
    /// The server answered a request with FAIL.
    Adb,
    /// A FAIL whose message says the requested device does not exist.
    DeviceNotFound,
}

#[derive(Error, Debug, Clone)]
pub enum AdbError {
    #[error("assertion violated: {0}")]
    Assertion(String),

    #[error("failed to parse server output: {0}")]
    Parse(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("cannot connect to ADB server: {0}")]
    ServerNotAvailable(String),

    #[error("server error for {request} request: {message}")]
    Server { request: String, message: String },

    #[error("server error for {request} request: {message}")]
    DeviceNotFound { request: String, message: String },

    /// A failure wrapped with the operation and device it belongs to.
    #[error("error in {operation} on device {device}: {source}")]
    Command {
        operation: String,
        device: String,
        #[source]
        source: Box<AdbError>,
    },
}

pub type AdbResult<T> = Result<T, AdbError>;

impl AdbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdbError::Assertion(_) => ErrorKind::Assertion,
            AdbError::Parse(_) => ErrorKind::Parse,
            AdbError::Network(_) => ErrorKind::Network,
            AdbError::ConnectionReset(_) => ErrorKind::ConnectionReset,
            AdbError::ServerNotAvailable(_) => ErrorKind::ServerNotAvailable,
            AdbError::Server { .. } => ErrorKind::Adb,
            AdbError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            AdbError::Command { source, .. } => source.kind(),
        }
    }

    /// Builds the error for a FAIL response, promoting device-not-found
    /// messages to their own kind. The raw server text is preserved.
    pub(crate) fn server_error(request: impl Into<String>, message: impl Into<String>) -> AdbError {
        let request = request.into();
        let message = message.into();
        if DEVICE_NOT_FOUND.is_match(&message) {
            AdbError::DeviceNotFound { request, message }
        } else {
            AdbError::Server { request, message }
        }
    }

    /// The raw FAIL message, if this error (or the one it wraps) came from
    /// a server FAIL response.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            AdbError::Server { message, .. } | AdbError::DeviceNotFound { message, .. } => {
                Some(message)
            }
            AdbError::Command { source, .. } => source.server_message(),
            _ => None,
        }
    }

    pub(crate) fn context(self, operation: impl Into<String>, device: impl fmt::Display) -> AdbError {
        AdbError::Command {
            operation: operation.into(),
            device: device.to_string(),
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_classification_with_serial() {
        let err = AdbError::server_error("host:transport:xyz", "device 'xyz' not found");
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert_eq!(err.server_message(), Some("device 'xyz' not found"));
    }

    #[test]
    fn test_fail_classification_old_server_wording() {
        let err = AdbError::server_error("host:transport-any", "device not found");
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    }

    #[test]
    fn test_fail_classification_other_message() {
        let err = AdbError::server_error("host:version", "unknown host service");
        assert_eq!(err.kind(), ErrorKind::Adb);
        assert_eq!(err.server_message(), Some("unknown host service"));
    }

    #[test]
    fn test_context_preserves_kind_and_message() {
        let err = AdbError::server_error("shell", "device not found").context("RunCommand", "emulator-5554");
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert_eq!(err.server_message(), Some("device not found"));
        assert_eq!(
            err.to_string(),
            "error in RunCommand on device emulator-5554: \
             server error for shell request: device not found"
        );
    }

    #[test]
    fn test_error_display() {
        let err = AdbError::ConnectionReset("incomplete message: read 2 bytes, expecting 4".into());
        assert!(err.to_string().starts_with("connection reset"));

        let err = AdbError::ServerNotAvailable("127.0.0.1:5037: connection refused".into());
        assert!(err.to_string().contains("cannot connect"));
    }
}
