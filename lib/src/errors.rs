// Typed pipeline errors. These travel inside `anyhow::Error` and are recovered
// with `downcast_ref` where a caller needs to branch on them.

use std::error::Error;
use std::fmt;

/// A queue item has been retried more often than the configured limit allows.
#[derive(Debug)]
pub struct RetryExhaustedError {
    pub iri: String,
    pub max_retry_count: u32,
}

impl fmt::Display for RetryExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Cannot retry \"{}\": max retry count of {} reached",
            self.iri, self.max_retry_count
        )
    }
}

impl Error for RetryExhaustedError {}

/// Fetching a resource failed on every attempt.
#[derive(Debug)]
pub struct FetchFailedError {
    pub iri: String,
    pub cause: anyhow::Error,
}

impl fmt::Display for FetchFailedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Failed to fetch \"{}\": {:#}", self.iri, self.cause)
    }
}

impl Error for FetchFailedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.cause)
    }
}

/// Invalid configuration: missing template placeholders, bad URLs, zero sizes.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid configuration: {}", self.message)
    }
}

impl Error for ConfigError {}

/// The remote store refused a publish, usually because another one is running.
#[derive(Debug)]
pub struct PublishConflictError {
    pub target: String,
    pub status: u16,
    pub message: String,
}

impl fmt::Display for PublishConflictError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Publish to {} was rejected (HTTP {}): {}",
            self.target, self.status, self.message
        )
    }
}

impl Error for PublishConflictError {}

/// Writing to or deleting from the content store failed.
#[derive(Debug)]
pub struct StorageError {
    pub path: String,
    pub cause: std::io::Error,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Storage error at {}: {}", self.path, self.cause)
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

/// Returns true if `err` (or anything in its chain) is a [`RetryExhaustedError`].
pub fn is_retry_exhausted(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<RetryExhaustedError>().is_some())
}

/// Returns true if `err` (or anything in its chain) is a [`PublishConflictError`].
pub fn is_publish_conflict(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<PublishConflictError>().is_some())
}

/// Returns true if `err` (or anything in its chain) is a [`StorageError`].
pub fn is_storage_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<StorageError>().is_some())
}
