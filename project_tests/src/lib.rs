//! Shared fixtures for the integration tests: a virtual `cpu` source wired
//! to a dispatcher, plus helpers that step turns on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use lib_pressure::{
    Dispatcher, EngineConfig, ObserveOptions, PressureError, PressureObserver, PressureRecord,
    PressureSource, PressureState, RateObfuscationConfig, RawStateSource, RecordQueue,
    SourceRegistry, VirtualSourceOptions,
};

pub const CPU: PressureSource = PressureSource::Cpu;

/// A registry with a supported `cpu` source and a dispatcher over it.
pub struct Harness {
    pub registry: Arc<SourceRegistry>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(SourceRegistry::new());
        registry
            .create(CPU, VirtualSourceOptions::default())
            .expect("Failed to create virtual cpu source");
        let backend: Arc<dyn RawStateSource> = registry.clone();
        Self {
            registry,
            dispatcher: Dispatcher::new(backend, config),
        }
    }

    /// Rate obfuscation switched off, so every change is delivered.
    pub fn without_guard() -> Self {
        Self::new(EngineConfig {
            rate_obfuscation: RateObfuscationConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    /// Rate obfuscation with the default ranges and a fixed seed.
    pub fn with_seeded_guard(seed: u64) -> Self {
        Self::new(EngineConfig {
            rate_obfuscation: RateObfuscationConfig {
                seed: Some(seed),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    pub fn observer(&self) -> (PressureObserver, RecordQueue) {
        PressureObserver::new(&self.dispatcher)
    }

    /// Observes `source` and runs the turn that settles it.
    pub async fn observe(
        &self,
        observer: &PressureObserver,
        source: PressureSource,
        options: ObserveOptions,
    ) -> Result<(), PressureError> {
        let pending = observer.observe(source, options);
        self.dispatcher.run_turn();
        pending.await
    }

    /// Advances the paused clock by `ms`, pushes `state` and runs a turn.
    pub async fn step(&self, ms: u64, state: PressureState) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        self.registry
            .update(CPU, state)
            .expect("Failed to update virtual cpu source");
        self.dispatcher.run_turn();
    }
}

/// Every record queued so far, batch boundaries flattened.
pub fn drain(queue: &mut RecordQueue) -> Vec<PressureRecord> {
    std::iter::from_fn(|| queue.try_recv()).flatten().collect()
}

/// Every batch queued so far.
pub fn drain_batches(queue: &mut RecordQueue) -> Vec<Vec<PressureRecord>> {
    std::iter::from_fn(|| queue.try_recv()).collect()
}

pub fn states(records: &[PressureRecord]) -> Vec<PressureState> {
    records.iter().map(PressureRecord::state).collect()
}
