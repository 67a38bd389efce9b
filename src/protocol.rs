//! Wire frame model for CDP pipe mode.
//!
//! Chromium's `--remote-debugging-pipe` transport exchanges JSON objects
//! separated by a single NUL byte in both directions. The driver treats
//! method names and payloads as opaque [`Value`]s so the transport never
//! depends on a particular protocol version.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Frame separator mandated by pipe mode. Not a newline.
pub const FRAME_DELIMITER: u8 = 0;

/// An outbound command frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Command {
    pub fn new(id: u64, method: impl Into<String>, params: Value, session_id: Option<String>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            session_id,
        }
    }

    /// Serialize into frame text, without the trailing delimiter. The
    /// writer appends exactly one NUL per frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| {
            Error::protocol(0, format!("unencodable command {}: {err}", self.method), None)
        })
    }
}

/// The `error` member of a response frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        Error::Protocol {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// A parsed inbound frame: a response correlated by id, or an event.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<CommandError>,
        session_id: Option<String>,
    },
    Event {
        method: String,
        params: Value,
        session_id: Option<String>,
    },
}

impl Incoming {
    /// Classify a raw frame. Presence of `id` makes it a response; otherwise
    /// `method` makes it an event. Anything else is rejected.
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        let raw: RawFrame = serde_json::from_slice(bytes)?;
        match raw {
            RawFrame {
                id: Some(id),
                result,
                error,
                session_id,
                ..
            } => Ok(Incoming::Response {
                id,
                result,
                error,
                session_id,
            }),
            RawFrame {
                method: Some(method),
                params,
                session_id,
                ..
            } => Ok(Incoming::Event {
                method,
                params: params.unwrap_or(Value::Null),
                session_id,
            }),
            _ => Err(serde::de::Error::custom("frame has neither id nor method")),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Incoming::Response { session_id, .. } | Incoming::Event { session_id, .. } => {
                session_id.as_deref()
            }
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<CommandError>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}
