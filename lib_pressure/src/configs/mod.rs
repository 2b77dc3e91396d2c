//! # Configuration Modules
//!
//! This module aggregates the configuration the delivery core is built with.

/// Engine settings: default sample interval and rate obfuscation ranges.
pub mod engine_config;
