use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Navigation timed out: {0}")]
    NavigationTimeout(String),

    #[error("Browser instance crashed: {0}")]
    BrowserCrash(String),

    #[error("Browser pool closed")]
    PoolClosed,

    #[error("Audit timed out after {0:?}")]
    AuditTimeout(Duration),

    #[error("Audit failed: {0}")]
    Audit(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Transient failures the pipeline retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanError::NavigationTimeout(_)
                | ScanError::BrowserCrash(_)
                | ScanError::AuditTimeout(_)
        )
    }

    /// Failures that mean the borrowed browser instance must not go back
    /// to the idle set.
    pub fn poisons_instance(&self) -> bool {
        matches!(self, ScanError::BrowserCrash(_) | ScanError::AuditTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
