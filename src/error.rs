use rmpv::Value;
use std::{io, sync::Arc};
use thiserror::Error;

/// Errors surfaced by calls, notifications and the dispatch loop.
///
/// Cloneable so that the terminal error of an endpoint can be handed to every
/// call still waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The endpoint was closed locally.
    #[error("connection is shut down")]
    Closed,

    /// The peer closed its side of the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The peer answered with a non-nil error field.
    #[error("remote error: {0}")]
    Remote(Value),

    /// The msgid counter wrapped around onto a call that is still pending.
    #[error("msgid {0} is still pending")]
    MsgIdCollision(u32),

    #[error("encoding params: {0}")]
    Encode(String),

    #[error("decoding result: {0}")]
    Decode(String),

    #[error("call timed out")]
    Timeout,

    /// The dispatch loop for this endpoint is already running (or has run).
    #[error("dispatch loop already started")]
    AlreadyServing,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Errors returned synchronously by service registration.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("no service name for type {type_name}")]
    NoServiceName { type_name: &'static str },

    #[error("type {0} is not exported")]
    Unexported(String),

    #[error("service already defined: {0}")]
    DuplicateService(String),

    #[error("method {method} of service {service} is already provided by service {existing}")]
    DuplicateMethod {
        method: String,
        service: String,
        existing: String,
    },

    #[error(
        "type {service} has no exported methods of suitable type{}",
        .hint.map(|hint| format!(" (hint: {hint})")).unwrap_or_default()
    )]
    NoSuitableMethods {
        service: String,
        hint: Option<&'static str>,
    },
}
