//! # Source Registry
//!
//! The core never talks to a platform directly. It consumes the
//! `RawStateSource` capability trait, which any backend can implement: the
//! in-process `SourceRegistry` below, or a real probe such as the Linux CPU
//! probe in `sources::cpu_probe`.
//!
//! ## Core Functionality:
//!
//! - **Capability Trait**: `is_supported`, `current_state`, `subscribe` and
//!   `unsubscribe`. The dispatcher subscribes a `ReadingSink` for a source when
//!   its first observer registers and unsubscribes when the last one leaves.
//!
//! - **Explicit Virtual Registry**: `SourceRegistry` is a handle that tests and
//!   embedders create, pass around and drop. It replaces ambient, process-wide
//!   driver state with an explicit `create` / `update` / `remove` / `info`
//!   lifecycle.
//!
//! - **Timestamped Readings**: Every update is stamped with the monotonic
//!   instant it happened at, so the sampler works from the backend's clock and
//!   not from when the dispatcher got around to processing it.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::core::error::PressureError;
use crate::core::model::{PressureSource, PressureState};

/// # Raw Reading
///
/// A backend observation: source `source` was in state `state` at instant `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReading {
    /// The source the reading belongs to.
    pub source: PressureSource,
    /// The raw state reported by the backend.
    pub state: PressureState,
    /// Monotonic instant of the reading.
    pub at: Instant,
}

/// # Reading Sink
///
/// The sending side a backend pushes readings into. Pushing also wakes the
/// dispatcher's run loop, so a backend never needs to know how turns are
/// scheduled.
#[derive(Debug, Clone)]
pub struct ReadingSink {
    tx: mpsc::UnboundedSender<RawReading>,
    wake: Arc<Notify>,
}

impl ReadingSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RawReading>, wake: Arc<Notify>) -> Self {
        Self { tx, wake }
    }

    /// Pushes a reading and wakes the dispatcher.
    ///
    /// # Returns
    /// `false` once the dispatcher behind this sink has been dropped, which
    /// tells the backend to forget the sink.
    pub fn push(&self, reading: RawReading) -> bool {
        if self.tx.send(reading).is_err() {
            return false;
        }
        self.wake.notify_one();
        true
    }

    /// Whether both sinks feed the same dispatcher.
    pub fn same_target(&self, other: &ReadingSink) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Whether the dispatcher behind this sink is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// # Raw State Source
///
/// The capability interface a pressure backend exposes to the core.
pub trait RawStateSource: Send + Sync {
    /// Whether `source` can be observed on this backend.
    fn is_supported(&self, source: PressureSource) -> bool;

    /// The most recent raw state of `source`, if one has been observed.
    fn current_state(&self, source: PressureSource) -> Option<PressureState>;

    /// Starts pushing readings for `source` into `sink`.
    ///
    /// # Returns
    /// `Err(PressureError::NotSupported)` when the source cannot be observed.
    fn subscribe(&self, source: PressureSource, sink: ReadingSink) -> Result<(), PressureError>;

    /// Stops pushing readings for `source` into `sink`.
    fn unsubscribe(&self, source: PressureSource, sink: &ReadingSink);
}

/// Options for `SourceRegistry::create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualSourceOptions {
    /// Whether observers may subscribe to the source.
    pub supported: bool,
}

impl Default for VirtualSourceOptions {
    fn default() -> Self {
        Self { supported: true }
    }
}

/// Snapshot returned by `SourceRegistry::info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VirtualSourceInfo {
    /// The source described.
    pub source: PressureSource,
    /// Whether observers may subscribe to it.
    pub supported: bool,
    /// The last state pushed through `update`, if any.
    pub state: Option<PressureState>,
}

/// A single virtual source slot.
struct VirtualSource {
    supported: bool,
    state: Option<PressureState>,
    sinks: Vec<ReadingSink>,
}

/// # Source Registry
///
/// An explicit, in-process pressure backend. Sources only exist between
/// `create` and `remove`; a source that was never created is unsupported.
///
/// Subscriptions outlive a `remove`: the sinks of a removed source are parked
/// and re-attached when the source is created again as supported.
#[derive(Default)]
pub struct SourceRegistry {
    slots: Mutex<HashMap<PressureSource, VirtualSource>>,
    /// Sinks of removed sources. Locked after `slots`.
    parked: Mutex<HashMap<PressureSource, Vec<ReadingSink>>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// # Create
    ///
    /// Adds a virtual source. Fails with `SourceAlreadyExists` if the source is
    /// already present; the existing slot is left untouched in that case.
    /// A supported source takes over the live sinks parked by an earlier
    /// `remove`.
    pub fn create(
        &self,
        source: PressureSource,
        options: VirtualSourceOptions,
    ) -> Result<(), PressureError> {
        let mut slots = self.slots.lock().expect("Registry lock poisoned");
        if slots.contains_key(&source) {
            return Err(PressureError::SourceAlreadyExists(source));
        }
        let mut sinks = Vec::new();
        if options.supported {
            let mut parked = self.parked.lock().expect("Registry lock poisoned");
            sinks = parked.remove(&source).unwrap_or_default();
            sinks.retain(|sink| !sink.is_closed());
        }
        log::info!(
            "Virtual source '{}' created (supported: {}, {} sinks re-attached)",
            source,
            options.supported,
            sinks.len()
        );
        slots.insert(
            source,
            VirtualSource {
                supported: options.supported,
                state: None,
                sinks,
            },
        );
        Ok(())
    }

    /// # Update
    ///
    /// Records `state` as the source's current state and pushes a reading
    /// stamped with the current instant to every subscribed sink. Sinks whose
    /// dispatcher is gone are removed while iterating.
    pub fn update(&self, source: PressureSource, state: PressureState) -> Result<(), PressureError> {
        let mut slots = self.slots.lock().expect("Registry lock poisoned");
        let slot = slots
            .get_mut(&source)
            .ok_or(PressureError::SourceNotFound(source))?;

        slot.state = Some(state);
        let reading = RawReading {
            source,
            state,
            at: Instant::now(),
        };
        slot.sinks.retain(|sink| sink.push(reading));
        log::debug!(
            "Virtual source '{}' updated to '{}' ({} sinks)",
            source,
            state,
            slot.sinks.len()
        );
        Ok(())
    }

    /// Removes a virtual source. Removing an absent source is not an error.
    /// Its live sinks stay subscribed and are parked until the source is
    /// created again.
    ///
    /// # Returns
    /// Whether a source was actually removed.
    pub fn remove(&self, source: PressureSource) -> bool {
        let mut slots = self.slots.lock().expect("Registry lock poisoned");
        let Some(slot) = slots.remove(&source) else {
            return false;
        };
        let mut parked = self.parked.lock().expect("Registry lock poisoned");
        let entry = parked.entry(source).or_default();
        for sink in slot.sinks.into_iter().filter(|sink| !sink.is_closed()) {
            if !entry.iter().any(|s| s.same_target(&sink)) {
                entry.push(sink);
            }
        }
        log::info!("Virtual source '{}' removed ({} sinks parked)", source, entry.len());
        true
    }

    /// Reports the current configuration and state of a virtual source.
    pub fn info(&self, source: PressureSource) -> Result<VirtualSourceInfo, PressureError> {
        let slots = self.slots.lock().expect("Registry lock poisoned");
        slots
            .get(&source)
            .map(|slot| VirtualSourceInfo {
                source,
                supported: slot.supported,
                state: slot.state,
            })
            .ok_or(PressureError::SourceNotFound(source))
    }

    /// Number of live sinks subscribed to `source`.
    pub fn subscriber_count(&self, source: PressureSource) -> usize {
        let slots = self.slots.lock().expect("Registry lock poisoned");
        slots
            .get(&source)
            .map(|slot| slot.sinks.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl RawStateSource for SourceRegistry {
    fn is_supported(&self, source: PressureSource) -> bool {
        let slots = self.slots.lock().expect("Registry lock poisoned");
        slots.get(&source).map(|slot| slot.supported).unwrap_or(false)
    }

    fn current_state(&self, source: PressureSource) -> Option<PressureState> {
        let slots = self.slots.lock().expect("Registry lock poisoned");
        slots.get(&source).and_then(|slot| slot.state)
    }

    fn subscribe(&self, source: PressureSource, sink: ReadingSink) -> Result<(), PressureError> {
        let mut slots = self.slots.lock().expect("Registry lock poisoned");
        match slots.get_mut(&source) {
            Some(slot) if slot.supported => {
                if !slot.sinks.iter().any(|s| s.same_target(&sink)) {
                    slot.sinks.push(sink);
                }
                Ok(())
            }
            _ => Err(PressureError::NotSupported(source)),
        }
    }

    fn unsubscribe(&self, source: PressureSource, sink: &ReadingSink) {
        let mut slots = self.slots.lock().expect("Registry lock poisoned");
        if let Some(slot) = slots.get_mut(&source) {
            slot.sinks.retain(|s| !s.same_target(sink));
        }
        let mut parked = self.parked.lock().expect("Registry lock poisoned");
        if let Some(sinks) = parked.get_mut(&source) {
            sinks.retain(|s| !s.same_target(sink));
            if sinks.is_empty() {
                parked.remove(&source);
            }
        }
    }
}
