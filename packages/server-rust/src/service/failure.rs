//! Failures caught at the request panic boundary and their classification.

use std::any::Any;
use std::io;

/// How a caught failure is handled by the panic guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The peer closed or reset the connection; no response can be written.
    Transport,
    /// Any other failure in handler code; answered with a 500.
    Handler,
}

impl FailureKind {
    /// Lowercase name used in structured log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Handler => "handler",
        }
    }
}

/// A panic payload reduced to a classification and a printable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaughtFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CaughtFailure {
    /// Classifies a payload recovered from `catch_unwind`.
    ///
    /// Only `std::io::Error` payloads count as originating from the
    /// transport; string payloads are always handler failures.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        if let Some(err) = payload.downcast_ref::<io::Error>() {
            let message = err.to_string();
            let kind = if matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ) {
                FailureKind::Transport
            } else {
                classify(true, &message)
            };
            return Self { kind, message };
        }

        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self {
            kind: FailureKind::Handler,
            message,
        }
    }
}

/// Classifies a failure from where it came from and how it describes itself.
#[must_use]
pub fn classify(from_transport: bool, description: &str) -> FailureKind {
    if from_transport && is_broken_connection(description) {
        FailureKind::Transport
    } else {
        FailureKind::Handler
    }
}

/// Case-insensitive check for a closed or reset peer connection.
#[must_use]
pub fn is_broken_connection(description: &str) -> bool {
    let lower = description.to_ascii_lowercase();
    lower.contains("broken pipe") || lower.contains("connection reset by peer")
}

/// Error surfaced by the pipeline when a request must be aborted without a
/// response. The HTTP connection is closed instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestFailure {
    #[error("transport failure: {message}")]
    Transport { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_connection_matches_case_insensitively() {
        assert!(is_broken_connection("write tcp 10.0.0.1:80: Broken Pipe"));
        assert!(is_broken_connection("read: CONNECTION RESET BY PEER"));
        assert!(!is_broken_connection("connection refused"));
        assert!(!is_broken_connection("index out of bounds"));
    }

    #[test]
    fn classify_requires_transport_origin() {
        assert_eq!(classify(true, "broken pipe"), FailureKind::Transport);
        assert_eq!(classify(false, "broken pipe"), FailureKind::Handler);
        assert_eq!(classify(true, "permission denied"), FailureKind::Handler);
    }

    #[test]
    fn io_error_with_broken_pipe_message_is_transport() {
        let err = io::Error::other("write: broken pipe");
        let payload: Box<dyn Any + Send> = Box::new(err);
        let caught = CaughtFailure::from_panic(payload.as_ref());
        assert_eq!(caught.kind, FailureKind::Transport);
        assert_eq!(caught.message, "write: broken pipe");
    }

    #[test]
    fn io_error_kind_connection_reset_is_transport() {
        let payload: Box<dyn Any + Send> =
            Box::new(io::Error::from(io::ErrorKind::ConnectionReset));
        let caught = CaughtFailure::from_panic(payload.as_ref());
        assert_eq!(caught.kind, FailureKind::Transport);
    }

    #[test]
    fn other_io_error_is_handler_failure() {
        let payload: Box<dyn Any + Send> =
            Box::new(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        let caught = CaughtFailure::from_panic(payload.as_ref());
        assert_eq!(caught.kind, FailureKind::Handler);
    }

    #[test]
    fn string_payloads_are_handler_failures() {
        let payload: Box<dyn Any + Send> = Box::new("connection reset by peer");
        let caught = CaughtFailure::from_panic(payload.as_ref());
        assert_eq!(caught.kind, FailureKind::Handler);
        assert_eq!(caught.message, "connection reset by peer");

        let payload: Box<dyn Any + Send> = Box::new(String::from("boom"));
        assert_eq!(CaughtFailure::from_panic(payload.as_ref()).message, "boom");
    }

    #[test]
    fn unknown_payload_has_placeholder_message() {
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        let caught = CaughtFailure::from_panic(payload.as_ref());
        assert_eq!(caught.kind, FailureKind::Handler);
        assert_eq!(caught.message, "unknown panic payload");
    }
}
