//! # Pressure Observer
//!
//! The public handle an embedder holds, plus the per-observer state the
//! dispatcher drives on every turn.
//!
//! ## Core Functionality:
//!
//! - **Registrations**: Each source moves from `Pending` (backend subscribed,
//!   waiters parked) to `Active` at the next dispatcher turn, or is dropped if
//!   the backend refused it. `unobserve` and `disconnect` abort pending
//!   registrations immediately and release the backend reference.
//!
//! - **Delivery**: Accepted records collect in a buffer that is flushed as one
//!   batch per turn onto an unbounded channel. The receiving `RecordQueue`
//!   skips batches from before the last `disconnect`, so nothing queued for a
//!   disconnected observer ever reaches the consumer.
//!
//! - **Callback Adaptor**: `with_callback` drains the queue on its own task and
//!   contains panics per batch, so one faulty consumer cannot stall delivery to
//!   other observers.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::dispatcher::Dispatcher;
use crate::core::error::PressureError;
use crate::core::model::{ObserveOptions, PressureRecord, PressureSource, PressureState};
use crate::core::rate_guard::{Admission, RateObfuscationConfig, RateObfuscationGuard};
use crate::core::registry::RawReading;
use crate::core::sampler::Sampler;

/// Unique identifier of an observer within its dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Waiter = oneshot::Sender<Result<(), PressureError>>;

/// Interest in one source.
#[derive(Debug)]
enum Registration {
    Pending {
        interval: u32,
        since: Instant,
        outcome: Result<(), PressureError>,
        waiters: Vec<Waiter>,
    },
    Active {
        interval: u32,
        since: Instant,
    },
}

/// A flushed batch, tagged with the disconnect epoch it was produced in.
#[derive(Debug)]
pub(crate) struct Batch {
    epoch: u64,
    records: Vec<PressureRecord>,
}

/// Per-observer state. Owned by the dispatcher's observer list and locked
/// for each step of a turn.
pub(crate) struct ObserverState {
    id: ObserverId,
    registrations: HashMap<PressureSource, Registration>,
    sampler: Sampler,
    guard: RateObfuscationGuard,
    buffer: Vec<PressureRecord>,
    batches: mpsc::UnboundedSender<Batch>,
    epoch: Arc<AtomicU64>,
}

impl ObserverState {
    pub(crate) fn id(&self) -> ObserverId {
        self.id
    }

    /// Promotes or drops every pending registration and answers its waiters.
    ///
    /// # Returns
    /// The number of registrations settled.
    pub(crate) fn settle(&mut self) -> usize {
        let id = self.id;
        let mut settled = 0;
        self.registrations.retain(|source, registration| {
            let Registration::Pending {
                interval,
                since,
                outcome,
                waiters,
            } = registration
            else {
                return true;
            };
            settled += 1;
            let (interval, since, outcome) = (*interval, *since, outcome.clone());
            for waiter in waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
            match outcome {
                Ok(()) => {
                    log::debug!("Observer {} now observing '{}'", id, source);
                    *registration = Registration::Active { interval, since };
                    true
                }
                Err(e) => {
                    log::debug!("Observer {} could not observe '{}': {}", id, source, e);
                    false
                }
            }
        });
        settled
    }

    /// Feeds one raw reading, taken at `time_ms`, through guard and sampler.
    pub(crate) fn ingest(&mut self, reading: &RawReading, time_ms: f64) {
        let interval = match self.registrations.get(&reading.source) {
            Some(Registration::Active { interval, since }) if reading.at >= *since => *interval,
            _ => return,
        };
        match self.guard.admit(time_ms) {
            Admission::Hold => {
                self.guard.hold(reading.source, reading.state);
                return;
            }
            Admission::Released { deadline_ms } => {
                self.release_held(deadline_ms);
                if self.guard.is_penalized() {
                    self.guard.hold(reading.source, reading.state);
                    return;
                }
            }
            Admission::Open => {}
        }
        self.offer(reading.source, reading.state, time_ms, interval);
    }

    /// Lifts an expired penalty and releases what it held.
    ///
    /// # Returns
    /// Whether a penalty was lifted.
    pub(crate) fn expire_penalty(&mut self, now_ms: f64) -> bool {
        match self.guard.expire(now_ms) {
            Some(deadline_ms) => {
                self.release_held(deadline_ms);
                true
            }
            None => false,
        }
    }

    /// The end of the active penalty, in dispatcher milliseconds.
    pub(crate) fn penalty_deadline(&self) -> Option<f64> {
        self.guard.penalty_deadline()
    }

    /// Sends the buffered records as one batch.
    ///
    /// # Returns
    /// The batch size, or `None` when there was nothing to flush.
    pub(crate) fn flush(&mut self) -> Option<usize> {
        if self.buffer.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.buffer);
        let count = records.len();
        let batch = Batch {
            epoch: self.epoch.load(Ordering::Acquire),
            records,
        };
        if self.batches.send(batch).is_err() {
            log::debug!("Observer {} has no consumer; batch of {} dropped", self.id, count);
        }
        Some(count)
    }

    fn offer(&mut self, source: PressureSource, state: PressureState, time_ms: f64, interval: u32) {
        if let Some(record) = self.sampler.sample(source, state, time_ms, interval) {
            self.guard.record_delivery(record.time());
            self.buffer.push(record);
        }
    }

    fn release_held(&mut self, deadline_ms: f64) {
        for (source, state) in self.guard.take_held() {
            // A release can itself trip the threshold again.
            if self.guard.is_penalized() {
                self.guard.hold(source, state);
                continue;
            }
            if let Some(Registration::Active { interval, .. }) = self.registrations.get(&source) {
                let interval = *interval;
                self.offer(source, state, deadline_ms, interval);
            }
        }
    }

    fn retire(&mut self, source: PressureSource, dispatcher: &Dispatcher) -> bool {
        let Some(registration) = self.registrations.remove(&source) else {
            return false;
        };
        match registration {
            Registration::Pending {
                outcome, waiters, ..
            } => {
                for waiter in waiters {
                    let _ = waiter.send(Err(PressureError::Aborted(source)));
                }
                if outcome.is_ok() {
                    dispatcher.release_source(source);
                }
                log::debug!("Observer {} aborted pending observe of '{}'", self.id, source);
            }
            Registration::Active { .. } => dispatcher.release_source(source),
        }
        true
    }
}

/// # Pending Observe
///
/// The future returned by `PressureObserver::observe`. Resolves once the
/// dispatcher settles the registration, or with `Aborted` when it is cancelled
/// first.
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[derive(Debug)]
pub struct PendingObserve {
    source: PressureSource,
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Ready(Option<Result<(), PressureError>>),
    Waiting(oneshot::Receiver<Result<(), PressureError>>),
}

impl PendingObserve {
    fn ready(source: PressureSource, result: Result<(), PressureError>) -> Self {
        Self {
            source,
            state: PendingState::Ready(Some(result)),
        }
    }

    fn waiting(source: PressureSource, rx: oneshot::Receiver<Result<(), PressureError>>) -> Self {
        Self {
            source,
            state: PendingState::Waiting(rx),
        }
    }

    /// The source this operation registers.
    pub fn source(&self) -> PressureSource {
        self.source
    }

    /// Checks for a settlement without waiting.
    ///
    /// # Returns
    /// `None` while the operation is still pending.
    pub fn try_result(&mut self) -> Option<Result<(), PressureError>> {
        let polled = match &mut self.state {
            PendingState::Ready(result) => return result.clone(),
            PendingState::Waiting(rx) => rx.try_recv(),
        };
        let result = match polled {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(PressureError::Aborted(self.source)),
        };
        self.state = PendingState::Ready(Some(result.clone()));
        Some(result)
    }
}

impl Future for PendingObserve {
    type Output = Result<(), PressureError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let source = this.source;
        match &mut this.state {
            PendingState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(PressureError::Aborted(source))))
            }
            PendingState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|settled| settled.unwrap_or(Err(PressureError::Aborted(source)))),
        }
    }
}

/// # Record Queue
///
/// The receiving end of an observer's batches. Batches produced before the
/// observer's most recent `disconnect` are skipped.
#[derive(Debug)]
pub struct RecordQueue {
    rx: mpsc::UnboundedReceiver<Batch>,
    epoch: Arc<AtomicU64>,
}

impl RecordQueue {
    /// Waits for the next batch.
    ///
    /// # Returns
    /// `None` once the observer is gone and every batch has been consumed.
    pub async fn recv(&mut self) -> Option<Vec<PressureRecord>> {
        loop {
            let batch = self.rx.recv().await?;
            if batch.epoch == self.epoch.load(Ordering::Acquire) {
                return Some(batch.records);
            }
        }
    }

    /// Returns the next batch if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<PressureRecord>> {
        loop {
            let batch = self.rx.try_recv().ok()?;
            if batch.epoch == self.epoch.load(Ordering::Acquire) {
                return Some(batch.records);
            }
        }
    }
}

/// # Pressure Observer
///
/// A consumer's handle on the delivery core. Dropping it disconnects the
/// observer and detaches it from the dispatcher.
pub struct PressureObserver {
    id: ObserverId,
    state: Arc<Mutex<ObserverState>>,
    dispatcher: Dispatcher,
}

impl PressureObserver {
    /// # New
    ///
    /// Creates an observer attached to `dispatcher`.
    ///
    /// # Returns
    /// The observer and the `RecordQueue` its batches are delivered to.
    pub fn new(dispatcher: &Dispatcher) -> (Self, RecordQueue) {
        let id = dispatcher.next_observer_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));

        let guard_config = RateObfuscationConfig {
            seed: dispatcher
                .config()
                .rate_obfuscation
                .seed
                .map(|seed| seed.wrapping_add(id.0)),
            ..dispatcher.config().rate_obfuscation.clone()
        };
        let state = Arc::new(Mutex::new(ObserverState {
            id,
            registrations: HashMap::new(),
            sampler: Sampler::new(),
            guard: RateObfuscationGuard::new(guard_config),
            buffer: Vec::new(),
            batches: tx,
            epoch: Arc::clone(&epoch),
        }));
        dispatcher.attach(Arc::clone(&state));

        let observer = Self {
            id,
            state,
            dispatcher: dispatcher.clone(),
        };
        (observer, RecordQueue { rx, epoch })
    }

    /// # With Callback
    ///
    /// Creates an observer whose batches are handed to `callback` on a spawned
    /// task. A panicking callback is logged and the task moves on to the next
    /// batch. Must be called from within a tokio runtime.
    pub fn with_callback<F>(dispatcher: &Dispatcher, mut callback: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut(Vec<PressureRecord>) + Send + 'static,
    {
        let (observer, mut queue) = Self::new(dispatcher);
        let id = observer.id;
        let handle = tokio::spawn(async move {
            while let Some(records) = queue.recv().await {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(records))) {
                    log::error!("Observer {} callback panicked: {}", id, panic_message(&*panic));
                }
            }
            log::debug!("Observer {} callback task finished", id);
        });
        (observer, handle)
    }

    /// The observer's identifier.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Every source this build can name, supported or not.
    pub fn known_sources() -> &'static [PressureSource] {
        &PressureSource::ALL
    }

    /// # Observe
    ///
    /// Registers interest in `source`.
    ///
    /// ## Logic:
    /// 1.  Validates `sampleInterval`. Out-of-range values yield an already
    ///     settled `InvalidSampleInterval` error and change nothing.
    /// 2.  An active registration resolves immediately; its options are kept.
    /// 3.  A pending registration gains another waiter; all settle together.
    /// 4.  Otherwise the backend is subscribed (or its refusal recorded) and a
    ///     pending registration is stored for the next turn to settle.
    pub fn observe(&self, source: PressureSource, options: ObserveOptions) -> PendingObserve {
        let interval = match options.resolve_interval(self.dispatcher.config().default_sample_interval_ms) {
            Ok(interval) => interval,
            Err(e) => return PendingObserve::ready(source, Err(e)),
        };

        let mut state = self.state.lock().expect("Observer lock poisoned");
        let pending = match state.registrations.entry(source) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Registration::Active { .. } => return PendingObserve::ready(source, Ok(())),
                Registration::Pending { waiters, .. } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    PendingObserve::waiting(source, rx)
                }
            },
            Entry::Vacant(entry) => {
                let outcome = self.dispatcher.acquire_source(source);
                let (tx, rx) = oneshot::channel();
                entry.insert(Registration::Pending {
                    interval,
                    since: Instant::now(),
                    outcome,
                    waiters: vec![tx],
                });
                log::debug!(
                    "Observer {} requested '{}' (sampleInterval {} ms)",
                    self.id,
                    source,
                    interval
                );
                PendingObserve::waiting(source, rx)
            }
        };
        drop(state);
        self.dispatcher.wake();
        pending
    }

    /// # Unobserve
    ///
    /// Drops interest in `source`: aborts a pending observe, releases the
    /// backend, forgets the last delivered record and discards buffered or held
    /// records of that source. Unknown sources are ignored.
    pub fn unobserve(&self, source: PressureSource) {
        let mut state = self.state.lock().expect("Observer lock poisoned");
        state.retire(source, &self.dispatcher);
        state.sampler.forget(source);
        state.guard.forget_held(source);
        state.buffer.retain(|record| record.source() != source);
    }

    /// # Disconnect
    ///
    /// Drops every registration and all delivery state. Batches already queued
    /// but not yet consumed are discarded. Idempotent. The rate obfuscation
    /// counters are kept.
    pub fn disconnect(&self) {
        let mut state = self.state.lock().expect("Observer lock poisoned");
        let sources: Vec<PressureSource> = state.registrations.keys().copied().collect();
        for source in &sources {
            state.retire(*source, &self.dispatcher);
        }
        state.sampler.clear();
        state.guard.clear_held();
        state.buffer.clear();
        state.epoch.fetch_add(1, Ordering::AcqRel);
        if !sources.is_empty() {
            log::info!("Observer {} disconnected from {} source(s)", self.id, sources.len());
        }
    }

    /// # Take Records
    ///
    /// Drains the records accepted since the last flush.
    pub fn take_records(&self) -> Vec<PressureRecord> {
        std::mem::take(&mut self.state.lock().expect("Observer lock poisoned").buffer)
    }

    /// Sources with a pending or active registration, in source order.
    pub fn observed_sources(&self) -> Vec<PressureSource> {
        let state = self.state.lock().expect("Observer lock poisoned");
        let mut sources: Vec<_> = state.registrations.keys().copied().collect();
        sources.sort();
        sources
    }
}

impl Drop for PressureObserver {
    fn drop(&mut self) {
        self.disconnect();
        self.dispatcher.detach(self.id);
    }
}

impl fmt::Debug for PressureObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PressureObserver").field("id", &self.id).finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
