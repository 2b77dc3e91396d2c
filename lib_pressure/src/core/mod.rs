//! # Core Engine Module
//!
//! This module forms the heart of the pressure observer delivery core. It
//! aggregates every component that sits between a raw pressure backend and the
//! consumer that receives batched `PressureRecord`s.
//!
//! ## Core Components:
//!
//! - **`registry`**: The source registry and the `RawStateSource` capability
//!   trait. The built-in `SourceRegistry` is the explicit, handle-based
//!   replacement for a process-wide virtual source driver.
//!
//! - **`sampler`**: The per-observer debouncer. It owns the `LastRecordMap` and
//!   applies the "has change in data" test plus the minimum sample interval.
//!
//! - **`rate_guard`**: The rate obfuscation guard. It counts delivered changes
//!   and, once a randomized threshold is reached, withholds the next delivery
//!   until a penalty has elapsed.
//!
//! - **`observer`**: The public `PressureObserver` handle together with its
//!   pending observe operations and the `RecordQueue` that batches land on.
//!
//! - **`dispatcher`**: The delivery scheduler. Once per turn it settles pending
//!   registrations, feeds readings through sampler and guard, and flushes one
//!   batch per observer.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Severity states, sources, records and observe options.
pub mod model;
/// The error type shared by every core operation.
pub mod error;
/// Source registry, raw readings and the backend capability trait.
pub mod registry;
/// The "has change in data" test and the per-observer `LastRecordMap`.
pub mod sampler;
/// Rate obfuscation penalty bookkeeping.
pub mod rate_guard;
/// The public observer handle and its delivery queue.
pub mod observer;
/// The single-threaded delivery scheduler.
pub mod dispatcher;

// --- Public API Re-exports ---
// Make the primary structs from the core modules directly accessible.
pub use dispatcher::{Dispatcher, TurnReport};
pub use error::{ErrorKind, PressureError};
pub use model::{ObserveOptions, PressureRecord, PressureSource, PressureState};
pub use observer::{PendingObserve, PressureObserver, RecordQueue};
pub use rate_guard::{RateObfuscationConfig, RateObfuscationGuard};
pub use registry::{RawStateSource, SourceRegistry};
pub use sampler::Sampler;
