//! The msgpack-rpc envelopes and the connection wrappers built on them.
//!
//! ```text
//! Request:      [0, msgid, method, params]
//! Response:     [1, msgid, error, result]
//! Notification: [2, method, params]
//! ```

pub mod client;
pub mod server;

use rmpv::Value;
use thiserror::Error;

pub const REQUEST: u64 = 0;
pub const RESPONSE: u64 = 1;
pub const NOTIFICATION: u64 = 2;

/// One msgpack-rpc envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        msgid: u32,
        method: String,
        params: Vec<Value>,
    },
    Response {
        msgid: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

/// A msgpack value that is not a well-formed envelope.
#[derive(Debug, Error, PartialEq)]
pub enum MessageError {
    #[error("expected an array, got {0}")]
    NotAnArray(Value),

    #[error("unknown message type {0}")]
    UnknownType(Value),

    #[error("message type {kind} expects {expected} elements, got {actual}")]
    WrongLength {
        kind: u64,
        expected: usize,
        actual: usize,
    },

    #[error("invalid msgid {0}")]
    InvalidMsgId(Value),

    #[error("invalid method name {0}")]
    InvalidMethod(Value),
}

impl Message {
    pub fn into_value(self) -> Value {
        match self {
            Message::Request {
                msgid,
                method,
                params,
            } => Value::Array(vec![
                Value::from(REQUEST),
                Value::from(msgid),
                Value::from(method),
                Value::Array(params),
            ]),
            Message::Response {
                msgid,
                error,
                result,
            } => Value::Array(vec![Value::from(RESPONSE), Value::from(msgid), error, result]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(NOTIFICATION),
                Value::from(method),
                Value::Array(params),
            ]),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let fields = match value {
            Value::Array(fields) => fields,
            other => return Err(MessageError::NotAnArray(other)),
        };
        let kind = match fields.first().and_then(Value::as_u64) {
            Some(kind @ (REQUEST | RESPONSE | NOTIFICATION)) => kind,
            _ => {
                let tag = fields.into_iter().next().unwrap_or(Value::Nil);
                return Err(MessageError::UnknownType(tag));
            }
        };
        let expected = if kind == NOTIFICATION { 3 } else { 4 };
        if fields.len() != expected {
            return Err(MessageError::WrongLength {
                kind,
                expected,
                actual: fields.len(),
            });
        }

        let mut fields = fields.into_iter().skip(1);
        let mut next = move || fields.next().unwrap_or(Value::Nil);
        Ok(match kind {
            REQUEST => Message::Request {
                msgid: msgid(next())?,
                method: method(next())?,
                params: params(next()),
            },
            RESPONSE => Message::Response {
                msgid: msgid(next())?,
                error: next(),
                result: next(),
            },
            _ => Message::Notification {
                method: method(next())?,
                params: params(next()),
            },
        })
    }
}

fn msgid(value: Value) -> Result<u32, MessageError> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(MessageError::InvalidMsgId(value))
}

fn method(value: Value) -> Result<String, MessageError> {
    match value {
        Value::String(s) if s.is_str() => Ok(s.into_str().unwrap_or_default()),
        Value::Binary(bytes) => String::from_utf8(bytes)
            .map_err(|err| MessageError::InvalidMethod(Value::Binary(err.into_bytes()))),
        other => Err(MessageError::InvalidMethod(other)),
    }
}

// Some peers send a bare value instead of a one-element array.
fn params(value: Value) -> Vec<Value> {
    match value {
        Value::Array(params) => params,
        Value::Nil => Vec::new(),
        other => vec![other],
    }
}
