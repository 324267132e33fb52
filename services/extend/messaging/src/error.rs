//! Messaging error types.

use std::time::Duration;

use extend_wire::{RemoteError, WireError};
use thiserror::Error;

/// Errors raised by channels, statuses and connections
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtendError {
    /// Channel or connection closed or closing
    #[error("connection error: {0}")]
    Connection(String),

    /// No response arrived before the deadline; the request stays pending
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The request was cancelled without a more specific cause
    #[error("request cancelled: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Cancelled {
        /// Optional explanation
        reason: Option<String>,
    },

    /// Malformed frame, unknown type id or decode failure
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Buffer overflow or underflow
    #[error("bounds error: {0}")]
    Bounds(WireError),

    /// Error raised by the peer that has no local equivalent
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Operation not valid in the current state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not supported
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl ExtendError {
    /// Cancellation without a reason
    pub fn cancelled() -> Self {
        ExtendError::Cancelled { reason: None }
    }

    /// Whether this is a connection error
    pub fn is_connection(&self) -> bool {
        matches!(self, ExtendError::Connection(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            ExtendError::Connection(_) => "Connection",
            ExtendError::RequestTimeout(_) => "RequestTimeout",
            ExtendError::Cancelled { .. } => "Cancelled",
            ExtendError::Protocol(_) => "Protocol",
            ExtendError::Bounds(_) => "Bounds",
            ExtendError::Remote(_) => "Remote",
            ExtendError::IllegalState(_) => "IllegalState",
            ExtendError::InvalidArgument(_) => "InvalidArgument",
            ExtendError::Unsupported(_) => "Unsupported",
        }
    }

    fn detail(&self) -> String {
        match self {
            ExtendError::Connection(s)
            | ExtendError::Protocol(s)
            | ExtendError::IllegalState(s)
            | ExtendError::InvalidArgument(s)
            | ExtendError::Unsupported(s) => s.clone(),
            ExtendError::Cancelled { reason } => reason.clone().unwrap_or_default(),
            ExtendError::RequestTimeout(d) => format!("{}", d.as_millis()),
            ExtendError::Bounds(e) => e.to_string(),
            ExtendError::Remote(r) => r.message.clone(),
        }
    }

    /// Carried form of this error, suitable for a failed response
    pub fn to_remote(&self) -> RemoteError {
        match self {
            ExtendError::Remote(r) => r.clone(),
            other => RemoteError::new(other.kind(), other.detail()),
        }
    }

    /// Restore an error carried by the peer, keeping its variant when known
    pub fn from_remote(remote: RemoteError) -> Self {
        let message = remote.message.clone();
        match remote.kind.as_str() {
            "Connection" => ExtendError::Connection(message),
            "Cancelled" => ExtendError::Cancelled {
                reason: (!message.is_empty()).then_some(message),
            },
            "Protocol" => ExtendError::Protocol(message),
            "IllegalState" => ExtendError::IllegalState(message),
            "InvalidArgument" => ExtendError::InvalidArgument(message),
            "Unsupported" => ExtendError::Unsupported(message),
            "RequestTimeout" => match message.parse::<u64>() {
                Ok(ms) => ExtendError::RequestTimeout(Duration::from_millis(ms)),
                Err(_) => ExtendError::Remote(remote),
            },
            _ => ExtendError::Remote(remote),
        }
    }
}

impl From<WireError> for ExtendError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::OutOfBounds { .. } | WireError::Eof => ExtendError::Bounds(e),
            other => ExtendError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_round_trip_keeps_variant() {
        for e in [
            ExtendError::Connection("gone".into()),
            ExtendError::cancelled(),
            ExtendError::Cancelled {
                reason: Some("shutdown".into()),
            },
            ExtendError::Protocol("bad".into()),
            ExtendError::IllegalState("x".into()),
            ExtendError::InvalidArgument("y".into()),
            ExtendError::Unsupported("z".into()),
            ExtendError::RequestTimeout(Duration::from_millis(250)),
        ] {
            assert_eq!(ExtendError::from_remote(e.to_remote()), e);
        }
    }

    #[test]
    fn test_unknown_kind_stays_remote() {
        let remote = RemoteError::new("NullPointerException", "boom");
        assert_eq!(
            ExtendError::from_remote(remote.clone()),
            ExtendError::Remote(remote)
        );
    }

    #[test]
    fn test_wire_error_mapping() {
        assert!(matches!(
            ExtendError::from(WireError::Eof),
            ExtendError::Bounds(WireError::Eof)
        ));
        assert!(matches!(
            ExtendError::from(WireError::Type(-99)),
            ExtendError::Protocol(_)
        ));
    }
}
