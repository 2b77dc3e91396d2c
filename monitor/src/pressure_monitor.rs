use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_pressure::{
    CpuProbe, Dispatcher, ObserveOptions, PressureObserver, PressureRecord, PressureSource,
    RawStateSource, RecordQueue, SourceRegistry,
};

mod monitor_logic;
use monitor_logic::{config, logger, scenario::Scenario};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), &config.log_level())?;

    let engine = lib_pressure::load_engine_config(config.engine_config.as_deref())?;
    log::info!("{}", engine);

    let cancel = CancellationToken::new();

    // --- Backend ---
    let (backend, source, replay): (Arc<dyn RawStateSource>, PressureSource, Option<(Scenario, Arc<SourceRegistry>)>) =
        match &config.replay {
            Some(path) => {
                let scenario = Scenario::from_file(path)?;
                let registry = Arc::new(SourceRegistry::new());
                scenario.install(&registry)?;
                log::info!("Replaying {} ({} steps)", path.display(), scenario.steps.len());
                let backend: Arc<dyn RawStateSource> = registry.clone();
                (backend, scenario.source, Some((scenario, registry)))
            }
            None => {
                let source: PressureSource = config
                    .source
                    .as_deref()
                    .unwrap_or("cpu")
                    .parse()
                    .context("Invalid --source")?;
                let probe = CpuProbe::new().poll_period(Duration::from_millis(config.poll_ms.unwrap_or(1000)));
                let backend: Arc<dyn RawStateSource> = Arc::new(probe);
                (backend, source, None)
            }
        };

    // --- Dispatcher & observer ---
    let dispatcher = Dispatcher::new(backend, engine);
    let runner = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        async move { dispatcher.run(cancel).await }
    });

    let (observer, mut queue) = PressureObserver::new(&dispatcher);
    let options = ObserveOptions {
        sample_interval: config.sample_interval_ms,
    };
    observer
        .observe(source, options)
        .await
        .with_context(|| format!("Cannot observe '{}'", source))?;
    log::info!("Observing '{}' as observer {}", source, observer.id());

    // --- Replay driver ---
    let replay_handle = replay.map(|(scenario, registry)| {
        let cancel = cancel.clone();
        tokio::spawn(async move { scenario.play(&registry, &cancel).await })
    });
    let replay_done = async {
        match replay_handle {
            Some(handle) => match handle.await {
                Ok(Ok(played)) => log::debug!("Replay pushed {} steps", played),
                Ok(Err(e)) => log::error!("Replay failed: {:#}", e),
                Err(e) => log::error!("Replay task failed: {}", e),
            },
            None => std::future::pending::<()>().await,
        }
    };
    let deadline = async {
        match config.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    // --- Print batches until something stops us ---
    let printer = print_batches(&mut queue);
    let mut replay_finished = false;
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
        _ = deadline => {
            log::info!("Duration elapsed, initiating shutdown.");
        }
        _ = replay_done => {
            replay_finished = true;
            log::info!("Replay finished, initiating shutdown.");
        }
        _ = printer => {}
    }

    // The loop must be gone before turns are run from here.
    cancel.cancel();
    if let Err(e) = runner.await {
        log::error!("Dispatcher task failed: {}", e);
    }
    if replay_finished {
        settle_penalties(&dispatcher).await;
    }

    // Anything delivered between the last print and shutdown.
    dispatcher.run_turn();
    while let Some(records) = queue.try_recv() {
        print_batch(&records)?;
    }
    observer.disconnect();

    log::info!("Shutdown complete.");
    Ok(())
}

async fn print_batches(queue: &mut RecordQueue) {
    while let Some(records) = queue.recv().await {
        if let Err(e) = print_batch(&records) {
            log::error!("Failed to write batch: {}", e);
            return;
        }
    }
}

fn print_batch(records: &[PressureRecord]) -> Result<()> {
    let batch: Vec<serde_json::Value> = records.iter().map(PressureRecord::to_json).collect();
    println!("{}", serde_json::to_string(&batch)?);
    Ok(())
}

// Waits out any rate obfuscation penalty so held readings are not lost.
async fn settle_penalties(dispatcher: &Dispatcher) {
    while let Some(at) = dispatcher.run_turn().next_deadline {
        tokio::time::sleep_until(at).await;
    }
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
