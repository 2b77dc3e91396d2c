use lib_pressure::core::rate_guard::{
    MAX_CHANGES_THRESHOLD, MIN_CHANGES_THRESHOLD, MIN_PENALTY_TIME_MS,
};
use lib_pressure::{
    EngineConfig, ObserveOptions, PressureRecord, PressureSource, PressureState,
    RateObfuscationConfig, VirtualSourceOptions,
};
use project_tests::{drain, Harness, CPU};
use tokio::time::Duration;

const STEP_MS: u64 = 10;
const THERMALS: PressureSource = PressureSource::Thermals;

// Fixed threshold and penalty, windows long enough never to roll over.
fn fixed_guard(threshold: u32, penalty_ms: u64) -> Harness {
    Harness::new(EngineConfig {
        rate_obfuscation: RateObfuscationConfig {
            min_changes_threshold: threshold,
            max_changes_threshold: threshold,
            min_penalty_time_ms: penalty_ms,
            max_penalty_time_ms: penalty_ms,
            seed: Some(1),
            ..Default::default()
        },
        ..Default::default()
    })
}

async fn push(h: &Harness, ms: u64, source: PressureSource, state: PressureState) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    h.registry.update(source, state).expect("Failed to update virtual source");
    h.dispatcher.run_turn();
}

// Runs turns at each penalty deadline until none is left.
async fn sit_out_penalties(h: &Harness) {
    while let Some(at) = h.dispatcher.run_turn().next_deadline {
        tokio::time::sleep_until(at).await;
    }
}

// Times rounded to the microsecond.
fn times_of(records: &[PressureRecord], source: PressureSource) -> Vec<(PressureState, f64)> {
    records
        .iter()
        .filter(|r| r.source() == source)
        .map(|r| (r.state(), (r.time() * 1000.0).round() / 1000.0))
        .collect()
}

fn alternating(i: usize) -> PressureState {
    if i % 2 == 0 {
        PressureState::Fair
    } else {
        PressureState::Serious
    }
}

#[tokio::test(start_paused = true)]
async fn test_penalty_gap_after_threshold() {
    let h = Harness::with_seeded_guard(2024);
    let (observer, mut queue) = h.observer();
    h.observe(&observer, CPU, ObserveOptions::default()).await.unwrap();

    // 15 s of changes every 10 ms: enough to cross the largest threshold and
    // sit out the longest penalty.
    for i in 0..1_500 {
        h.step(STEP_MS, alternating(i)).await;
    }
    let records = drain(&mut queue);

    let (index, gap) = records
        .windows(2)
        .enumerate()
        .map(|(i, pair)| (i, pair[1].time() - pair[0].time()))
        .find(|(_, gap)| *gap > 2.0 * STEP_MS as f64)
        .expect("a penalty should have opened a gap");

    let delivered_before = (index + 1) as u32;
    assert!(
        (MIN_CHANGES_THRESHOLD..=MAX_CHANGES_THRESHOLD).contains(&delivered_before),
        "penalty after {} changes",
        delivered_before
    );
    assert!(
        gap >= MIN_PENALTY_TIME_MS as f64,
        "gap of {} ms is shorter than the minimum penalty",
        gap
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_penalty_below_threshold() {
    let h = Harness::with_seeded_guard(7);
    let (observer, mut queue) = h.observer();
    h.observe(&observer, CPU, ObserveOptions::default()).await.unwrap();

    let changes = (MIN_CHANGES_THRESHOLD - 1) as usize;
    for i in 0..changes {
        h.step(STEP_MS, alternating(i)).await;
    }
    let records = drain(&mut queue);
    assert_eq!(records.len(), changes);
    for pair in records.windows(2) {
        assert!(pair[1].time() - pair[0].time() <= STEP_MS as f64 + 1e-6);
    }
}

#[tokio::test(start_paused = true)]
async fn test_penalty_never_alters_states() {
    let h = Harness::with_seeded_guard(99);
    let (observer, mut queue) = h.observer();
    h.observe(&observer, CPU, ObserveOptions::default()).await.unwrap();

    for i in 0..1_200 {
        h.step(STEP_MS, alternating(i)).await;
    }
    let records = drain(&mut queue);
    assert!(records
        .iter()
        .all(|r| matches!(r.state(), PressureState::Fair | PressureState::Serious)));
    // Delivered records still alternate: nothing was invented or duplicated.
    for pair in records.windows(2) {
        assert_ne!(pair[0].state(), pair[1].state());
    }
}

#[tokio::test(start_paused = true)]
async fn test_held_reading_released_by_timer_turn() {
    let h = Harness::with_seeded_guard(5);
    let (observer, mut queue) = h.observer();
    h.observe(&observer, CPU, ObserveOptions::default()).await.unwrap();

    let mut i = 0;
    let deadline = loop {
        h.step(STEP_MS, alternating(i)).await;
        i += 1;
        if let Some(at) = h.dispatcher.run_turn().next_deadline {
            break at;
        }
        assert!(i <= MAX_CHANGES_THRESHOLD as usize, "threshold never reached");
    };
    let before = drain(&mut queue);

    // One more change lands inside the penalty and is held.
    h.step(STEP_MS, alternating(i)).await;
    assert!(drain(&mut queue).is_empty());

    // No further readings: the turn at the deadline releases it.
    tokio::time::sleep_until(deadline).await;
    let report = h.dispatcher.run_turn();
    assert_eq!(report.penalties_expired, 1);
    let released = drain(&mut queue);
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].state(), alternating(i));
    assert!(released[0].time() - before.last().unwrap().time() >= MIN_PENALTY_TIME_MS as f64);
}

#[tokio::test(start_paused = true)]
async fn test_release_that_rearms_penalty_holds_the_trigger() {
    let h = fixed_guard(1, 1_000);
    let (observer, mut queue) = h.observer();
    h.observe(&observer, CPU, ObserveOptions::default()).await.unwrap();

    h.step(0, PressureState::Fair).await;
    h.step(500, PressureState::Serious).await;
    // Releases Serious at 1000, which arms the next penalty right away.
    h.step(1_000, PressureState::Critical).await;
    sit_out_penalties(&h).await;

    assert_eq!(
        times_of(&drain(&mut queue), CPU),
        vec![
            (PressureState::Fair, 0.0),
            (PressureState::Serious, 1_000.0),
            (PressureState::Critical, 2_000.0),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_releasing_two_sources_rearms_before_the_trigger() {
    let h = fixed_guard(2, 1_000);
    h.registry
        .create(THERMALS, VirtualSourceOptions::default())
        .expect("Failed to create virtual thermals source");
    let (observer, mut queue) = h.observer();
    h.observe(&observer, CPU, ObserveOptions::default()).await.unwrap();
    h.observe(&observer, THERMALS, ObserveOptions::default()).await.unwrap();

    push(&h, 0, CPU, PressureState::Fair).await;
    push(&h, 10, THERMALS, PressureState::Fair).await;
    // Penalty until 1010: both are held.
    push(&h, 490, CPU, PressureState::Serious).await;
    push(&h, 100, THERMALS, PressureState::Serious).await;
    // The two releases reach the threshold again; Critical waits for 2010.
    push(&h, 900, CPU, PressureState::Critical).await;
    sit_out_penalties(&h).await;

    let records = drain(&mut queue);
    assert_eq!(
        times_of(&records, CPU),
        vec![
            (PressureState::Fair, 0.0),
            (PressureState::Serious, 1_010.0),
            (PressureState::Critical, 2_010.0),
        ]
    );
    assert_eq!(
        times_of(&records, THERMALS),
        vec![(PressureState::Fair, 10.0), (PressureState::Serious, 1_010.0)]
    );
}
