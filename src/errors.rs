use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// One of the two sockets the bridge keeps open to the terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Main channel: plain request/response traffic.
    Mn,
    /// Callback channel: request/response traffic plus pushed callbacks.
    Cb,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Mn => f.write_str("MN"),
            Channel::Cb => f.write_str("CB"),
        }
    }
}

/// Errors produced by the bridge.
///
/// Transport failures reach the listener through
/// [`on_exception_mn`](crate::listener::QuikListener::on_exception_mn) /
/// [`on_exception_cb`](crate::listener::QuikListener::on_exception_cb);
/// request failures reach the caller through its
/// [`ResponseFuture`](crate::response::ResponseFuture).
#[derive(Error, Debug)]
pub enum QuikError {
    /// Socket open, send or receive failed. Both channels are closed and
    /// the transport waits for its error timeout before reconnecting.
    #[error("{channel} socket failure: {source}")]
    Io {
        /// Channel that failed.
        channel: Channel,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// An inbound line is not valid JSON. The channel stays healthy.
    #[error("{channel} sent a malformed line {line:?}: {source}")]
    Parse {
        /// Channel that delivered the line.
        channel: Channel,
        /// The offending line.
        line: String,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// An inbound line parsed but is not a frame the bridge understands.
    #[error("{channel} sent an unexpected frame: {reason}")]
    UnexpectedFrame {
        /// Channel that delivered the frame.
        channel: Channel,
        /// What was wrong with it.
        reason: String,
    },

    /// No response arrived before the caller's deadline.
    #[error("request {id} timed out after {timeout:?}")]
    ResponseTimeout {
        /// Id of the outbound request.
        id: u64,
        /// Deadline given by the caller.
        timeout: Duration,
    },

    /// The terminal rejected one step of a subscription round.
    #[error("subscription failed: {0}")]
    Subscription(String),

    /// The transport was shut down while the operation was in flight.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Bridge configuration is missing or malformed.
    #[error("invalid bridge config: {0}")]
    InvalidConfig(String),

    /// The session manager has no transport to send requests through.
    #[error("session manager has no transport attached")]
    NotStarted,
}

impl QuikError {
    pub(crate) fn io(channel: Channel, source: std::io::Error) -> Self {
        QuikError::Io { channel, source }
    }

    /// Returns `true` for [`QuikError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QuikError::Cancelled(_))
    }
}

/// High-level errors returned by the binaries.
#[derive(Error, Debug)]
pub enum CliError {
    /// General wrapper around any textual failure.
    #[error("Cli failed with error: {0}")]
    GeneralError(String),
}

impl From<QuikError> for CliError {
    fn from(err: QuikError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}
