//! Error taxonomy surfaced by the driver.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Errors observable through the public API.
///
/// Four kinds cover the steady state; [`Error::Launch`] can only come out of
/// [`Browser::start`](crate::Browser::start).
#[derive(Debug, Error)]
pub enum Error {
    /// The tab's session has been torn down; the operation was never sent.
    #[error("tab is no longer attached")]
    DetachedTab,

    /// The browser answered with a CDP `error` object, or a
    /// `Runtime.evaluate` result carried `exceptionDetails`.
    #[error("CDP error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The pipe closed, the child exited, or a write failed. Every
    /// outstanding command and waiter resolves with this exactly once.
    #[error("connection to the browser lost")]
    ConnectionLost,

    /// A deadline fired. Local to the waiting operation.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The browser process could not be launched.
    #[error("failed to launch browser: {0}")]
    Launch(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn protocol(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
            data,
        }
    }

    /// Whether this error means the whole connection is gone, as opposed to
    /// a single failed operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConnectionLost | Error::Launch(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
