use std::io;

use thiserror::Error;

/// An error returned synchronously from `find_or_create`.
///
/// These only happen on the miss path, before an entry is installed in the index.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No backing file could be allocated in the cache directory.
    #[error("failed to create cache file")]
    Create(#[source] io::Error),
    /// The backing file was created, but could not be opened for reading.
    #[error("failed to open cache file for reading")]
    Open(#[source] io::Error),
}

/// The outcome of a failed production, as observed through [`Waiter`](crate::Waiter).
///
/// All variants carry plain strings so that the very same error can be handed out to any
/// number of waiting streams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProductionError {
    /// The producer returned an error.
    ///
    /// The attached string contains the full context chain of that error.
    #[error("producer failed: {0}")]
    Failed(String),
    /// The producer panicked.
    ///
    /// The attached string contains the panic message, if there was one.
    #[error("producer panicked: {0}")]
    Panicked(String),
    /// Writing into the backing storage failed.
    #[error("write to cache file failed: {0}")]
    Write(String),
    /// Closing the backing storage after production failed.
    #[error("close of cache file failed: {0}")]
    Close(String),
    /// The production task was dropped before it could finish, for example because the
    /// runtime is shutting down.
    #[error("production aborted before completion")]
    Aborted,
}

/// An error returned by the various `wait` methods.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// Production finished with an error.
    #[error(transparent)]
    Production(#[from] ProductionError),
    /// The wait was canceled before production finished.
    #[error("canceled")]
    Canceled,
    /// The wait timed out before production finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}
