//! Error types for pageio
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for pageio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for pageio
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying file driver or OS failure, propagated with context
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid sizes, percentages out of range, page-strategy mismatch
    #[error("configuration error: {0}")]
    Config(String),

    /// Magic or checksum mismatch, impossible tick skew, or structurally
    /// invalid on-disk state
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Internal accounting violated; the file is no longer trustworthy
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A bounded retry loop never observed a stable state
    #[error("retries exhausted: {0}")]
    RetryExhausted(String),

    /// An eviction would violate the minimum-class reservation
    #[error("capacity constraint: {0}")]
    Capacity(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create an invariant-violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create a retry-exhausted error
    pub fn retry_exhausted(msg: impl Into<String>) -> Self {
        Self::RetryExhausted(msg.into())
    }

    /// Create a capacity error
    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    /// Check if this error indicates on-disk corruption
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }

    /// Check if this error may clear up on retry
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryExhausted(_))
    }
}
