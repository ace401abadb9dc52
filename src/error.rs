use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Tephra errors.
///
/// Insert and erase signal failure through their return value rather than
/// through this type: a full buffer is a transient condition the caller
/// retries, and a missed tagged delete is a terminal "not found". Errors are
/// reserved for construction-time contract failures and abandoned jobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A job was abandoned before producing a result, typically because the
    /// scheduler shut down while the job was still queued.
    Abort,
    /// Invalid configuration or user input, detected at construction time.
    InvalidInput(String),
    /// The operation is not legal in the current state.
    InvalidState(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "job abandoned before completion"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)) };
}

/// A tephra Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
