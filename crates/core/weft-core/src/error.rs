//! Error handling types and utilities for the Weft platform.
//!
//! This module provides the standardized error type used throughout all
//! Weft crates so that errors compose across crate boundaries without
//! lossy string conversions at every seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for the Weft platform.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeftError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network related errors
    #[error("Network error: {0}")]
    Network(String),

    /// Storage/persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic application errors with context
    #[error("Application error: {message} (context: {context})")]
    Application {
        /// Error message
        message: String,
        /// Error context
        context: String,
    },
}

impl WeftError {
    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Self::Configuration(msg.to_string())
    }

    /// Create a new network error
    pub fn network<T: fmt::Display>(msg: T) -> Self {
        Self::Network(msg.to_string())
    }

    /// Create a new storage error
    pub fn storage<T: fmt::Display>(msg: T) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Create a new invalid input error
    pub fn invalid_input<T: fmt::Display>(msg: T) -> Self {
        Self::InvalidInput(msg.to_string())
    }

    /// Create a new not found error
    pub fn not_found<T: fmt::Display>(msg: T) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create a new timeout error
    pub fn timeout<T: fmt::Display>(msg: T) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create a new serialization error
    pub fn serialization<T: fmt::Display>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a new internal error
    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Create an application error with context
    pub fn application<M: fmt::Display, C: fmt::Display>(message: M, context: C) -> Self {
        Self::Application {
            message: message.to_string(),
            context: context.to_string(),
        }
    }

    /// Whether the operation that produced this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for WeftError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for WeftError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for WeftError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Result type alias used across the Weft platform
pub type WeftResult<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_helpers() {
        assert!(matches!(WeftError::config("x"), WeftError::Configuration(_)));
        assert!(matches!(WeftError::network("x"), WeftError::Network(_)));
        assert!(matches!(WeftError::not_found("x"), WeftError::NotFound(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(WeftError::network("connection reset").is_retryable());
        assert!(WeftError::timeout("sync round").is_retryable());
        assert!(!WeftError::invalid_input("bad payload").is_retryable());
    }

    #[test]
    fn test_display_formatting() {
        let err = WeftError::application("merge failed", "instance gcounter/visits");
        let text = err.to_string();
        assert!(text.contains("merge failed"));
        assert!(text.contains("gcounter/visits"));
    }

    #[test]
    fn test_serde_round_trip() {
        let err = WeftError::storage("disk full");
        let json = serde_json::to_string(&err).unwrap();
        let back: WeftError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
