//! Error type shared by the whole crate
//!
//! Most failures in the request core are not recoverable in place: they either
//! latch a filter pipeline, push an FSM into one of its error states, or close
//! the connection with a specific reason. `VclError` is the common currency
//! those paths use before the failure is converted into a synthetic response
//! or a close reason.

use thiserror::Error;

/// Failure currency of the request core
#[derive(Error, Debug)]
pub enum VclError {
    #[error("{0}")]
    Msg(String),
    #[error("workspace allocation ({0} bytes) failed")]
    WsOutOfMemory(usize),
    #[error("could not get storage")]
    NoStorage,
    #[error("protocol error: {0}")]
    Proto(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<String> for VclError {
    fn from(s: String) -> Self {
        Self::Msg(s)
    }
}

impl From<&str> for VclError {
    fn from(s: &str) -> Self {
        Self::Msg(s.into())
    }
}

/// Shorthand to [`Result<T, VclError>`]
pub type VclResult<T> = Result<T, VclError>;
