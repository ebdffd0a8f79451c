//! # Weft Core
//!
//! Core traits, error types, and shared utilities for the Weft platform.
//! Every other Weft crate depends on this one for its error taxonomy, its
//! observability contract, and its configuration helpers.
//!
//! ## Quick Start
//!
//! ```rust
//! use weft_core::{WeftError, WeftResult};
//!
//! fn parse_limit(raw: &str) -> WeftResult<usize> {
//!     raw.parse()
//!         .map_err(|_| WeftError::invalid_input(format!("bad limit: {raw}")))
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod traits;

// Re-export commonly used items
pub use error::{WeftError, WeftResult};
pub use traits::{HealthLevel, HealthStatus, Identifiable, Observable, ObservableState, ObservableStatus, Validatable};

/// Version information for the Weft Core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of the Weft Core library
pub const NAME: &str = env!("CARGO_PKG_NAME");
