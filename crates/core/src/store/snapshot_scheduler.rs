//! Automatic snapshotting and journal compaction.
//!
//! A background task that saves a snapshot (and thereby compacts the
//! journal onto the fresh baseline) on two triggers: a fixed interval,
//! and the journal outgrowing the live dataset by the configured rewrite
//! ratio. Holds only a weak handle to the engine so a dropped engine
//! stops the task instead of being kept alive by it.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::engine::Engine;

/// How often the journal/dataset ratio is re-checked between interval
/// snapshots.
const RATIO_CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub struct SnapshotScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SnapshotScheduler {
    pub(crate) fn spawn(engine: Weak<Engine>, interval: Option<Duration>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_scheduler(engine, interval, shutdown_rx));
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SnapshotScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_scheduler(
    engine: Weak<Engine>,
    interval: Option<Duration>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let tick = match interval {
        Some(every) => every.min(RATIO_CHECK_INTERVAL),
        None => RATIO_CHECK_INTERVAL,
    };
    if let Some(every) = interval {
        info!(every_secs = every.as_secs(), "snapshot scheduler started");
    }
    let mut last_snapshot = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("snapshot scheduler shutting down");
                    return;
                }
            }
        }

        let Some(engine) = engine.upgrade() else {
            // Engine gone; nothing left to snapshot.
            return;
        };

        let interval_due = interval.is_some_and(|every| last_snapshot.elapsed() >= every);
        let ratio_due = engine.should_compact();
        if !(interval_due || ratio_due) {
            continue;
        }

        if ratio_due {
            info!("journal outgrew the dataset; compacting");
        }
        // Snapshot serialization is file I/O; keep it off the runtime
        // workers.
        let saved = tokio::task::spawn_blocking(move || engine.save_snapshot()).await;
        match saved {
            Ok(Ok(())) => last_snapshot = Instant::now(),
            Ok(Err(err)) => error!(error = %err, "automatic snapshot failed"),
            Err(err) => error!(error = %err, "snapshot task panicked"),
        }
    }
}
