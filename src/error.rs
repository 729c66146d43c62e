//! Error types for the manager client and the AGI server

use crate::response::ResponseEvents;
use thiserror::Error;

/// Errors produced by the manager connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Transport-level failure while connecting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is not logged in (or is reconnecting).
    #[error("not connected")]
    NotConnected,

    /// `login()` was called on a connection that is already active.
    #[error("connection already established")]
    AlreadyConnected,

    /// The connection was torn down while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response arrived before the deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// An event-generating action did not complete in time.
    ///
    /// Carries whatever the action collected before the deadline.
    #[error("event-generating action timed out after {timeout_ms}ms")]
    EventsTimeout {
        timeout_ms: u64,
        partial: Box<ResponseEvents>,
    },

    /// The caller cancelled a pending request.
    #[error("request cancelled")]
    Cancelled,

    /// Login was rejected by the server.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Malformed wire data or an unexpected packet.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// Two pending requests hashed to the same correlation key.
    #[error("duplicate handler registered for action id {action_id}")]
    DuplicateHandler { action_id: String },

    /// `send_event_generating_action` was called with an action that has no
    /// completion event kind.
    #[error("action {action} does not declare a completion event")]
    MissingCompletionEvent { action: String },

    /// A field name or value would break line framing.
    #[error("invalid field: {field}")]
    InvalidField { field: String },

    /// The server answered with `Response: Error`.
    #[error("action failed: {message}")]
    ActionFailed { message: String },

    /// Reconnection was abandoned.
    #[error("reconnection abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: usize },

    /// The unhandled-event queue overflowed and events were dropped.
    #[error("event queue full, events dropped")]
    QueueFull,
}

impl AmiError {
    /// Build a [`AmiError::ProtocolError`].
    pub fn protocol_error(message: impl Into<String>) -> Self {
        AmiError::ProtocolError {
            message: message.into(),
        }
    }

    /// Build a [`AmiError::AuthenticationFailed`].
    pub fn auth_failed(message: impl Into<String>) -> Self {
        AmiError::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// `true` for both plain and event-collection timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AmiError::Timeout { .. } | AmiError::EventsTimeout { .. }
        )
    }

    /// `true` when the error means the session is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::Io(_) | AmiError::NotConnected | AmiError::ConnectionClosed
        )
    }
}

/// Result alias for manager operations.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors produced while serving an AGI session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgiError {
    /// The channel hung up (Asterisk sent `HANGUP` or closed the socket).
    #[error("channel hung up")]
    Hangup,

    /// Status 511: the command was sent to a dead channel.
    #[error("command sent on a dead channel")]
    DeadChannel,

    /// Status 510: Asterisk did not recognize the command.
    #[error("invalid or unknown command")]
    InvalidOrUnknownCommand,

    /// Status 520: wrong command syntax. Carries the usage text Asterisk sent.
    #[error("invalid command syntax: {usage}")]
    InvalidCommandSyntax { usage: String },

    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request or reply.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// No script is mapped to the requested path.
    #[error("no script mapped for {script}")]
    NoScript { script: String },
}

impl AgiError {
    /// Build a [`AgiError::ProtocolError`].
    pub fn protocol_error(message: impl Into<String>) -> Self {
        AgiError::ProtocolError {
            message: message.into(),
        }
    }
}

/// Result alias for AGI operations.
pub type AgiResult<T> = Result<T, AgiError>;
