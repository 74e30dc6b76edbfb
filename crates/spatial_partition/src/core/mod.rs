//! # Core Module
//!
//! Shared configuration for the partition.
//!
//! ## Organization
//!
//! - **Config**: partition configuration with validation and file loading

pub mod config;

pub use config::{Config, ConfigError, PartitionConfig};
