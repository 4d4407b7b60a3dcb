//! Checkpoint and cleanup.
//!
//! A checkpoint persists the root (state, watermark, tracking high-water)
//! and flushes dirty index pages. The journal is synced first, so index
//! pages never reach disk ahead of the records they were built from.
//!
//! Cleanup is a checkpoint followed by removal of journal segments the
//! index no longer refers to.

use crate::store::{Engine, Shared};
use brokerstore_core::{StoreResult, StoreState};
use brokerstore_durability::CleanupInfo;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest the background thread sleeps between checks.
const MAX_TICK: Duration = Duration::from_millis(500);

/// Outcome of an explicit checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Wall time
    pub duration_ms: u64,
    /// Segments reclaimed, when cleanup ran
    pub cleanup: Option<CleanupInfo>,
}

/// Checkpoint the engine, optionally reclaiming unreferenced segments.
///
/// Segments in `holds` are never removed.
pub(crate) fn checkpoint_update(
    engine: &mut Engine,
    tracking_high_water: i64,
    holds: &BTreeSet<u32>,
    cleanup: bool,
    slow_threshold: Duration,
) -> StoreResult<CheckpointInfo> {
    let started = Instant::now();

    let mut root = engine.root.clone();
    root.state = StoreState::Open;
    root.tracking_high_water = root.tracking_high_water.max(tracking_high_water);
    let mut tx = engine.index.tx();
    root.save(&mut tx)?;
    tx.commit()?;
    engine.root = root;

    engine.journal.sync()?;
    engine.index.flush()?;

    let cleanup = if cleanup {
        Some(reclaim_segments(engine, holds)?)
    } else {
        None
    };

    let elapsed = started.elapsed();
    if elapsed > slow_threshold {
        warn!(
            target: "brokerstore::checkpoint",
            duration_ms = elapsed.as_millis() as u64,
            threshold_ms = slow_threshold.as_millis() as u64,
            "Slow checkpoint"
        );
    } else {
        debug!(
            target: "brokerstore::checkpoint",
            duration_ms = elapsed.as_millis() as u64,
            watermark = ?engine.root.last_applied,
            "Checkpoint done"
        );
    }

    Ok(CheckpointInfo {
        duration_ms: elapsed.as_millis() as u64,
        cleanup,
    })
}

fn reclaim_segments(engine: &Engine, holds: &BTreeSet<u32>) -> StoreResult<CleanupInfo> {
    let active = engine.journal.active_segment_id();
    let mut candidates: BTreeSet<u32> = engine
        .journal
        .segment_ids()
        .into_iter()
        .filter(|id| Some(*id) != active && !holds.contains(id))
        .collect();
    if candidates.is_empty() {
        return Ok(CleanupInfo::default());
    }

    let tx = engine.index.tx();
    engine.root.remove_gc_candidates(&tx, &mut candidates)?;
    tx.rollback();
    if candidates.is_empty() {
        return Ok(CleanupInfo::default());
    }

    let info = engine.journal.remove_segments(&candidates)?;
    info!(
        target: "brokerstore::checkpoint",
        segments = ?info.segments_removed,
        reclaimed_bytes = info.reclaimed_bytes,
        "Removed journal segments"
    );
    Ok(info)
}

/// Wakes and stops the background thread.
pub(crate) struct CheckpointSignal {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl CheckpointSignal {
    pub(crate) fn new() -> Self {
        CheckpointSignal {
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn reset(&self) {
        *self.shutdown.lock() = false;
    }

    pub(crate) fn shutdown(&self) {
        *self.shutdown.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep up to `timeout`. Returns true once shutdown was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let mut shutdown = self.shutdown.lock();
        if !*shutdown {
            self.wake.wait_for(&mut shutdown, timeout);
        }
        *shutdown
    }
}

/// Start the `brokerstore-checkpoint` thread.
pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("brokerstore-checkpoint".to_string())
        .spawn(move || run(shared))
}

fn run(shared: Arc<Shared>) {
    let checkpoint_interval = shared.config.checkpoint_interval();
    let cleanup_interval = shared.config.cleanup_interval();
    let tick = checkpoint_interval.min(MAX_TICK);
    let mut last_checkpoint = Instant::now();
    let mut last_cleanup = Instant::now();

    debug!(target: "brokerstore::checkpoint", ?checkpoint_interval, ?cleanup_interval, "Checkpoint thread started");
    while !shared.signal.wait(tick) {
        let now = Instant::now();
        let cleanup = now.duration_since(last_cleanup) >= cleanup_interval;
        if !cleanup && now.duration_since(last_checkpoint) < checkpoint_interval {
            continue;
        }
        if let Err(e) = shared.checkpoint(cleanup) {
            error!(target: "brokerstore::checkpoint", error = %e, cleanup, "Background checkpoint failed");
        }
        last_checkpoint = now;
        if cleanup {
            last_cleanup = now;
        }
    }
    debug!(target: "brokerstore::checkpoint", "Checkpoint thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_wait_times_out() {
        let signal = CheckpointSignal::new();
        let started = Instant::now();
        assert!(!signal.wait(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_signal_shutdown_wakes_waiter() {
        let signal = Arc::new(CheckpointSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                let started = Instant::now();
                while !signal.wait(Duration::from_secs(5)) {}
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(20));
        signal.shutdown();
        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_secs(5));

        signal.reset();
        assert!(!signal.wait(Duration::from_millis(1)));
    }
}
