//! # Delivery Dispatcher
//!
//! The `Dispatcher` is the scheduler between a pressure backend and every
//! observer attached to it. It owns the single reading channel all backend
//! sinks feed, the per-source backend reference counts, and the time origin
//! that record timestamps are measured from.
//!
//! ## Core Design Principles:
//!
//! 1.  **One Logical Thread**: All delivery work happens inside `run_turn`.
//!     A turn runs four steps in a fixed order:
//!     - settle pending registrations,
//!     - ingest queued readings in arrival order,
//!     - release penalty holds whose deadline has passed,
//!     - flush each observer's buffer as exactly one batch.
//!
//! 2.  **Shared Backend Subscriptions**: A source is subscribed on the backend
//!     when the first observer registers it and unsubscribed when the last one
//!     lets go. Pending registrations count as holders, so cancelling one never
//!     leaves a residual subscription behind.
//!
//! 3.  **Independent Observers**: Each observer is locked and processed on its
//!     own. A consumer that stops reading its queue, or a callback that panics,
//!     has no effect on delivery to anyone else.
//!
//! 4.  **Driven or Stepped**: `run` drives turns whenever a backend pushes a
//!     reading, an observer changes its registrations, or a penalty deadline
//!     falls due. Embedders and tests that need determinism call `run_turn`
//!     directly instead.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::configs::engine_config::EngineConfig;
use crate::core::error::PressureError;
use crate::core::model::PressureSource;
use crate::core::observer::{ObserverId, ObserverState};
use crate::core::registry::{RawReading, RawStateSource, ReadingSink};

/// # Turn Report
///
/// What a single `run_turn` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnReport {
    /// Pending registrations settled (resolved or rejected).
    pub settled: usize,
    /// Raw readings taken off the reading channel.
    pub readings: usize,
    /// Penalties lifted because their deadline had passed.
    pub penalties_expired: usize,
    /// Batches flushed, at most one per observer.
    pub batches: usize,
    /// Records across all flushed batches.
    pub records: usize,
    /// The earliest active penalty deadline, if any. `run` sleeps until then.
    pub next_deadline: Option<Instant>,
}

struct DispatcherShared {
    backend: Arc<dyn RawStateSource>,
    config: EngineConfig,
    origin: Instant,
    sink: ReadingSink,
    readings: Mutex<mpsc::UnboundedReceiver<RawReading>>,
    /// Held for a whole turn, before any other lock.
    turn: Mutex<()>,
    observers: Mutex<Vec<Arc<Mutex<ObserverState>>>>,
    /// Source → number of registrations holding the backend subscription.
    source_refs: Mutex<HashMap<PressureSource, usize>>,
    wake: Arc<Notify>,
    next_id: AtomicU64,
}

impl Drop for DispatcherShared {
    fn drop(&mut self) {
        let refs = self.source_refs.get_mut().expect("Dispatcher lock poisoned");
        for (source, _) in refs.drain() {
            self.backend.unsubscribe(source, &self.sink);
        }
    }
}

/// # Dispatcher
///
/// A cheaply cloneable handle; clones share the same observers and backend.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    /// Creates a dispatcher over `backend`. The time origin is the moment of
    /// creation.
    pub fn new(backend: Arc<dyn RawStateSource>, config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let shared = DispatcherShared {
            backend,
            config,
            origin: Instant::now(),
            sink: ReadingSink::new(tx, Arc::clone(&wake)),
            readings: Mutex::new(rx),
            turn: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
            source_refs: Mutex::new(HashMap::new()),
            wake,
            next_id: AtomicU64::new(1),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// The engine configuration this dispatcher was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The backend readings come from.
    pub fn backend(&self) -> &Arc<dyn RawStateSource> {
        &self.shared.backend
    }

    /// The instant record times are measured from.
    pub fn origin(&self) -> Instant {
        self.shared.origin
    }

    /// Milliseconds from the time origin to `at`.
    pub fn elapsed_ms(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.shared.origin).as_secs_f64() * 1000.0
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.shared.observers.lock().expect("Dispatcher lock poisoned").len()
    }

    /// Number of registrations currently holding the backend subscription for
    /// `source`.
    pub fn source_ref_count(&self, source: PressureSource) -> usize {
        let refs = self.shared.source_refs.lock().expect("Dispatcher lock poisoned");
        refs.get(&source).copied().unwrap_or(0)
    }

    /// Schedules a turn on the `run` loop.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    pub(crate) fn next_observer_id(&self) -> ObserverId {
        ObserverId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn attach(&self, state: Arc<Mutex<ObserverState>>) {
        let mut observers = self.shared.observers.lock().expect("Dispatcher lock poisoned");
        let id = state.lock().expect("Observer lock poisoned").id();
        observers.push(state);
        log::info!("Observer {} attached ({} total)", id, observers.len());
    }

    pub(crate) fn detach(&self, id: ObserverId) {
        let mut observers = self.shared.observers.lock().expect("Dispatcher lock poisoned");
        observers.retain(|state| state.lock().expect("Observer lock poisoned").id() != id);
        log::info!("Observer {} detached ({} remaining)", id, observers.len());
    }

    /// # Acquire Source
    ///
    /// Takes a reference on the backend subscription for `source`, subscribing
    /// the backend if this is the first one. A refused subscription takes no
    /// reference.
    pub(crate) fn acquire_source(&self, source: PressureSource) -> Result<(), PressureError> {
        let mut refs = self.shared.source_refs.lock().expect("Dispatcher lock poisoned");
        if let Some(count) = refs.get_mut(&source) {
            *count += 1;
            return Ok(());
        }
        self.shared
            .backend
            .subscribe(source, self.shared.sink.clone())?;
        refs.insert(source, 1);
        log::info!("Backend subscribed to '{}'", source);
        Ok(())
    }

    /// Drops a reference taken by `acquire_source`, unsubscribing the backend
    /// when it was the last one.
    pub(crate) fn release_source(&self, source: PressureSource) {
        let mut refs = self.shared.source_refs.lock().expect("Dispatcher lock poisoned");
        let Some(count) = refs.get_mut(&source) else {
            log::warn!("Release of '{}' without a matching acquire", source);
            return;
        };
        *count -= 1;
        if *count == 0 {
            refs.remove(&source);
            self.shared.backend.unsubscribe(source, &self.shared.sink);
            log::info!("Backend unsubscribed from '{}'", source);
        }
    }

    /// # Run Turn
    ///
    /// Executes one delivery turn over every attached observer. Concurrent
    /// callers are serialized, so readings are always ingested in arrival
    /// order.
    ///
    /// ## Logic:
    /// 1.  **Settle**: pending registrations become active, or are rejected with
    ///     the backend's refusal. Registrations cancelled earlier are already
    ///     gone, so cancellation always wins.
    /// 2.  **Ingest**: queued readings are drained in arrival order and offered
    ///     to each observer's guard and sampler.
    /// 3.  **Expire**: penalties whose deadline has passed release their held
    ///     readings, stamped with the deadline.
    /// 4.  **Flush**: each non-empty buffer goes out as one batch.
    pub fn run_turn(&self) -> TurnReport {
        let _turn = self.shared.turn.lock().expect("Dispatcher lock poisoned");
        let observers: Vec<Arc<Mutex<ObserverState>>> = self
            .shared
            .observers
            .lock()
            .expect("Dispatcher lock poisoned")
            .clone();
        let mut report = TurnReport::default();

        // --- 1. Settle ---
        for state in &observers {
            report.settled += state.lock().expect("Observer lock poisoned").settle();
        }

        // --- 2. Ingest ---
        let readings: Vec<RawReading> = {
            let mut rx = self.shared.readings.lock().expect("Dispatcher lock poisoned");
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        report.readings = readings.len();
        for reading in &readings {
            let time_ms = self.elapsed_ms(reading.at);
            for state in &observers {
                state.lock().expect("Observer lock poisoned").ingest(reading, time_ms);
            }
        }

        // --- 3. Expire ---
        let now_ms = self.elapsed_ms(Instant::now());
        for state in &observers {
            if state.lock().expect("Observer lock poisoned").expire_penalty(now_ms) {
                report.penalties_expired += 1;
            }
        }

        // --- 4. Flush ---
        let mut next_deadline_ms: Option<f64> = None;
        for state in &observers {
            let mut state = state.lock().expect("Observer lock poisoned");
            if let Some(count) = state.flush() {
                report.batches += 1;
                report.records += count;
            }
            if let Some(deadline) = state.penalty_deadline() {
                next_deadline_ms = Some(next_deadline_ms.map_or(deadline, |d| d.min(deadline)));
            }
        }
        report.next_deadline = next_deadline_ms.map(|ms| self.instant_at(ms));

        if report.batches > 0 {
            log::debug!(
                "Turn delivered {} record(s) in {} batch(es) from {} reading(s)",
                report.records,
                report.batches,
                report.readings
            );
        }
        report
    }

    /// # Run
    ///
    /// Drives turns until `cancel` fires. Sleeps until a backend pushes a
    /// reading, an observer calls `wake`, or the next penalty deadline passes.
    pub async fn run(&self, cancel: CancellationToken) {
        log::info!("Dispatcher loop started");
        loop {
            let report = self.run_turn();
            let deadline = async {
                match report.next_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shared.wake.notified() => {},
                _ = deadline => {},
            }
        }
        log::info!("Dispatcher loop stopped");
    }

    // Rounded up to the next microsecond so a timer firing at the returned
    // instant always observes the deadline as passed.
    fn instant_at(&self, ms: f64) -> Instant {
        let micros = (ms * 1000.0).ceil().max(0.0) as u64 + 1;
        self.shared.origin + Duration::from_micros(micros)
    }
}
