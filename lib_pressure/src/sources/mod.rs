//! # Platform Backends
//!
//! Real `RawStateSource` implementations. Each lives behind its own feature
//! flag so embedders that only need the virtual registry pull in nothing else.

/// Linux CPU utilisation probe over `/proc/stat`.
#[cfg(feature = "probes")]
pub mod cpu_probe;
