//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the partition:
//! - Math types and geometric primitives
//! - Logging utilities

pub mod math;
pub mod logging;
