//! Partition error types
//!
//! Only construction and registration can fail recoverably. Hot-path misuse
//! such as a stale handle is a programmer error and never surfaces here.

use thiserror::Error;

use crate::config::ConfigError;

/// Partition-level errors
#[derive(Error, Debug)]
pub enum PartitionError {
    /// Configuration failed validation
    #[error("Invalid partition configuration: {0}")]
    InvalidConfig(String),

    /// The fixed number of query callbacks is already installed
    #[error("Query callback limit reached ({max} installed)")]
    TooManyQueryCallbacks {
        /// Limit that was hit
        max: usize,
    },

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
