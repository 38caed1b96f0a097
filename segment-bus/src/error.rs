use std::sync::{Mutex, MutexGuard};

/// Errors surfaced by pipeline components.
///
/// Configuration and protocol errors are fatal to the operation that raised
/// them. Transient failures inside a running stage are logged where they happen
/// and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing settings or library misuse (subscribing a started muxer,
    /// a video stream that does not start on a key frame, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// A source, codec or output could not be opened or allocated.
    #[error("resource error: {0}")]
    Resource(String),

    /// Malformed or unsupported wire payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failure reported by the codec/container backend.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error("component is closed")]
    Closed,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Converts a backend error, recovering pipeline errors that travelled
    /// through a backend callback.
    pub fn from_backend(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Self::Backend(err),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// A panicking sink callback must not wedge every other thread touching the
/// same component.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
