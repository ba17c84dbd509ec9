//! Crate-wide error types, following `services/comsrv/src/error.rs`'s shape:
//! one `thiserror` enum per module family, aggregated into a single `Error`
//! via `#[from]`.

use thiserror::Error;

/// Errors surfaced by a [`crate::backend::Backend`] implementation.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    RequestFailed(String),

    #[error("backend returned an empty response")]
    EmptyResponse,

    #[error("asynchronous receive timed out")]
    Timeout,

    #[error("socket I/O error: {0}")]
    Io(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("operation not supported by this backend")]
    Unsupported,
}

/// Errors surfaced by the DCS scheduler and scoring algorithms.
#[derive(Error, Debug, Clone)]
pub enum DcsError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("AP did not reach ENABLED state after retrying")]
    ApNotReady,

    #[error("current operating channel does not match any permitted channel")]
    NoMatchingChannel,

    #[error("scan list is empty after filtering")]
    EmptyScanList,

    #[error("unknown scoring algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("fatal invariant violation at {0}")]
    FatalInvariant(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Aggregated crate error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Dcs(#[from] DcsError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Log a fatal invariant violation and terminate the process. Used so any
/// unreachable branch terminates the process after logging the condition
/// site rather than unwinding or panicking silently.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!(target: "dcssrv::fatal", $($arg)*);
        std::process::exit(70);
    }};
}
