use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lib_pressure::{ObserveOptions, PressureError, PressureObserver, PressureState};
use project_tests::{drain, Harness, CPU};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_observe_then_unobserve_aborts_without_records() {
    let h = Harness::without_guard();
    let (observer, mut queue) = h.observer();

    let pending = observer.observe(CPU, ObserveOptions::default());
    observer.unobserve(CPU);
    h.dispatcher.run_turn();

    let err = pending.await.expect_err("cancelled observe must reject");
    assert_eq!(err, PressureError::Aborted(CPU));
    assert_eq!(err.dom_name(), "AbortError");

    h.step(5, PressureState::Critical).await;
    assert!(drain(&mut queue).is_empty(), "No record may reach a cancelled observer");
    assert_eq!(h.registry.subscriber_count(CPU), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_before_settle_aborts() {
    let h = Harness::without_guard();
    let (observer, _queue) = h.observer();

    let pending = observer.observe(CPU, ObserveOptions::default());
    observer.disconnect();
    assert_eq!(h.dispatcher.run_turn().settled, 0);
    assert_eq!(pending.await, Err(PressureError::Aborted(CPU)));
    assert_eq!(h.dispatcher.source_ref_count(CPU), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_leaves_sibling_observer_untouched() {
    let h = Harness::without_guard();
    let (cancelled, mut cancelled_queue) = h.observer();
    let (sibling, mut sibling_queue) = h.observer();

    let doomed = cancelled.observe(CPU, ObserveOptions::default());
    let kept = sibling.observe(CPU, ObserveOptions::default());
    cancelled.unobserve(CPU);
    h.dispatcher.run_turn();

    assert_eq!(doomed.await, Err(PressureError::Aborted(CPU)));
    kept.await.expect("sibling observe should resolve");
    assert_eq!(h.registry.subscriber_count(CPU), 1);

    h.step(5, PressureState::Serious).await;
    assert!(drain(&mut cancelled_queue).is_empty());
    assert_eq!(drain(&mut sibling_queue).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_discards_undelivered_batches() {
    let h = Harness::without_guard();
    let (observer, mut queue) = h.observer();
    h.observe(&observer, CPU, ObserveOptions::default()).await.unwrap();

    h.step(5, PressureState::Fair).await;
    h.step(5, PressureState::Critical).await;
    observer.disconnect();
    observer.disconnect();

    assert!(drain(&mut queue).is_empty());
    assert!(observer.take_records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_observer_releases_backend() {
    let h = Harness::without_guard();
    let (observer, _queue) = h.observer();
    h.observe(&observer, CPU, ObserveOptions::default()).await.unwrap();
    assert_eq!(h.registry.subscriber_count(CPU), 1);

    drop(observer);
    assert_eq!(h.dispatcher.observer_count(), 0);
    assert_eq!(h.registry.subscriber_count(CPU), 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_callback_does_not_stop_other_observers() {
    let h = Harness::without_guard();
    let cancel = CancellationToken::new();
    let runner = tokio::spawn({
        let dispatcher = h.dispatcher.clone();
        let cancel = cancel.clone();
        async move { dispatcher.run(cancel).await }
    });

    let panics = Arc::new(AtomicUsize::new(0));
    let (faulty, _faulty_task) = PressureObserver::with_callback(&h.dispatcher, {
        let panics = Arc::clone(&panics);
        move |_records| {
            panics.fetch_add(1, Ordering::SeqCst);
            panic!("consumer fault");
        }
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (healthy, _healthy_task) = PressureObserver::with_callback(&h.dispatcher, move |records| {
        let _ = tx.send(records);
    });

    faulty.observe(CPU, ObserveOptions::default()).await.unwrap();
    healthy.observe(CPU, ObserveOptions::default()).await.unwrap();

    h.registry.update(CPU, PressureState::Serious).unwrap();
    let first = rx.recv().await.expect("healthy observer gets the first batch");
    h.registry.update(CPU, PressureState::Critical).unwrap();
    let second = rx.recv().await.expect("healthy observer gets the second batch");

    assert_eq!(first[0].state(), PressureState::Serious);
    assert_eq!(second[0].state(), PressureState::Critical);

    // Yield until the faulty callback has run for both batches.
    while panics.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }

    cancel.cancel();
    runner.await.unwrap();
}
