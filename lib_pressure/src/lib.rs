// Declare the modules to re-export
pub mod configs;
pub mod core;
pub mod sources;

// Re-export everything an embedder needs to build and drive observers.
pub use configs::engine_config::*;
pub use crate::core::dispatcher::{Dispatcher, TurnReport};
pub use crate::core::error::{ErrorKind, PressureError};
pub use crate::core::model::{ObserveOptions, PressureRecord, PressureSource, PressureState};
pub use crate::core::observer::{ObserverId, PendingObserve, PressureObserver, RecordQueue};
pub use crate::core::rate_guard::RateObfuscationConfig;
pub use crate::core::registry::{
    RawReading, RawStateSource, ReadingSink, SourceRegistry, VirtualSourceInfo,
    VirtualSourceOptions,
};
#[cfg(feature = "probes")]
pub use sources::cpu_probe::{CpuProbe, CpuThresholds};
