//! Core traits for the Weft platform.
//!
//! These traits define the contracts shared by Weft components: health and
//! status reporting for long-lived services, validation for configuration
//! and wire payloads, and identity for addressable objects.

use crate::{WeftError, WeftResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Trait for objects that can be observed and monitored
#[async_trait]
pub trait Observable {
    /// Get the current status of this object
    async fn status(&self) -> WeftResult<ObservableStatus>;

    /// Get health information about this object
    async fn health(&self) -> WeftResult<HealthStatus>;

    /// Get a snapshot of numeric metrics keyed by name
    async fn metrics(&self) -> WeftResult<HashMap<String, f64>>;

    /// Get a human-readable description of the current state
    fn describe(&self) -> String;
}

/// Status information for observable objects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservableStatus {
    /// Current state
    pub state: ObservableState,
    /// Last updated timestamp
    pub last_updated: chrono::DateTime<chrono::Utc>,
    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

/// Possible states for observable objects
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ObservableState {
    /// Object is initializing
    Initializing,
    /// Object is running normally
    Running,
    /// Object is degraded but functional
    Degraded,
    /// Object has failed
    Failed,
    /// Object is shutting down
    ShuttingDown,
    /// Object is stopped
    Stopped,
}

/// Health status information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    /// Overall health
    pub overall: HealthLevel,
    /// Health checks by component
    pub checks: HashMap<String, HealthCheck>,
    /// Last health check timestamp
    pub last_check: chrono::DateTime<chrono::Utc>,
}

impl HealthStatus {
    /// Build a health status from individual checks; overall health is the
    /// worst level among them.
    pub fn from_checks(checks: HashMap<String, HealthCheck>) -> Self {
        let overall = checks
            .values()
            .map(|c| c.level)
            .max_by_key(|level| match level {
                HealthLevel::Healthy => 0,
                HealthLevel::Unknown => 1,
                HealthLevel::Warning => 2,
                HealthLevel::Critical => 3,
            })
            .unwrap_or(HealthLevel::Unknown);
        Self {
            overall,
            checks,
            last_check: chrono::Utc::now(),
        }
    }
}

/// Health levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthLevel {
    /// Healthy
    Healthy,
    /// Warning condition
    Warning,
    /// Critical condition
    Critical,
    /// Unknown health status
    Unknown,
}

/// Individual health check result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    /// Health level
    pub level: HealthLevel,
    /// Description of the check
    pub message: String,
    /// When the check was performed
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthCheck {
    /// Create a check result stamped with the current time
    pub fn new<T: std::fmt::Display>(level: HealthLevel, message: T) -> Self {
        Self {
            level,
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Trait for objects with unique identities
pub trait Identifiable {
    /// Get the unique identifier for this object
    fn id(&self) -> Uuid;

    /// Get a human-readable name
    fn name(&self) -> &str;

    /// Get the type identifier
    fn type_name(&self) -> &'static str;
}

/// Trait for validatable objects
pub trait Validatable {
    /// Validate this object
    fn validate(&self) -> WeftResult<()>;

    /// Check if this object is valid
    fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Validate that a numeric field lies within an inclusive range.
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    field: &str,
    value: T,
    min: T,
    max: T,
) -> WeftResult<()> {
    if value < min || value > max {
        return Err(WeftError::invalid_input(format!(
            "{field} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}
