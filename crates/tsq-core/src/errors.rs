//! Error taxonomy for the ServerQuery client.
//!
//! Every failure a caller can observe is a [`QueryError`]. The type is
//! `Clone` because one outcome may be handed to several waiters (a shared
//! subscribe operation, the cached result of a closed session).

use std::fmt::Write as _;

use thiserror::Error;

/// Maximum number of characters of an upstream cause kept in
/// [`QueryError::ChannelClosed`].
pub const CLOSE_CAUSE_MAX_CHARS: usize = 64;

/// Errors produced while connecting, talking to, or closing a session.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Every candidate address failed to connect.
    #[error("{}", connect_failure_message(.attempts, .causes))]
    ConnectFailure {
        /// Number of addresses that were dialed.
        attempts: usize,
        /// One entry per failed attempt, in the order the failures arrived.
        causes: Vec<String>,
    },

    /// The server did not send the expected banner.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// The server answered with a non-zero status.
    #[error("{}", protocol_error_message(.command, .code, .message, .extra_message))]
    ProtocolError {
        /// Command name of the failed request.
        command: String,
        /// Status code from the `error` line.
        code: u32,
        /// Status message from the `error` line.
        message: String,
        /// Optional `extra_msg` from the `error` line.
        extra_message: Option<String>,
    },

    /// The session ended while the request was outstanding.
    #[error("{}", channel_closed_message(.cause))]
    ChannelClosed {
        /// Truncated message of the failure that closed the transport.
        cause: Option<String>,
    },

    /// Writing the request to the transport failed.
    #[error("send failed: {0}")]
    SendFailure(String),

    /// Malformed escape sequence, line, or banner bytes.
    #[error("decode failed: {0}")]
    DecodeFailure(String),
}

impl QueryError {
    /// Build a [`QueryError::ChannelClosed`], keeping at most
    /// [`CLOSE_CAUSE_MAX_CHARS`] characters of the cause.
    pub fn channel_closed(cause: Option<&str>) -> Self {
        Self::ChannelClosed {
            cause: cause
                .filter(|c| !c.is_empty())
                .map(|c| c.chars().take(CLOSE_CAUSE_MAX_CHARS).collect()),
        }
    }

    /// Whether this is a server-reported status error.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::ProtocolError { .. })
    }

    /// Whether the session was closed under the request.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed { .. })
    }

    /// Server status code, for protocol errors.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::ProtocolError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type for ServerQuery operations.
pub type Result<T> = std::result::Result<T, QueryError>;

#[allow(clippy::trivially_copy_pass_by_ref)]
fn connect_failure_message(attempts: &usize, causes: &[String]) -> String {
    // Only the first cause is surfaced; the rest stay on the value.
    match causes.first() {
        Some(first) => format!("connect failed after {attempts} attempt(s): {first}"),
        None => "connect failed: no candidate addresses".to_string(),
    }
}

#[allow(clippy::ref_option)]
fn channel_closed_message(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!("Channel closed ({cause})"),
        None => "Channel closed".to_string(),
    }
}

#[allow(clippy::trivially_copy_pass_by_ref, clippy::ref_option)]
fn protocol_error_message(
    command: &str,
    code: &u32,
    message: &str,
    extra_message: &Option<String>,
) -> String {
    let mut out = format!("'{command}' failed with id={code} msg={message}");
    if let Some(extra) = extra_message {
        let _ = write!(out, " ({extra})");
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
