//! Journal replay into the index.
//!
//! Replay starts after the persisted watermark and walks the journal tail.
//! Records outside a unit of work are applied and committed one at a time;
//! records inside one are buffered in a single page transaction that commits
//! at `EndUnitOfWork` and is dropped at `CancelUnitOfWork`.
//!
//! After replay, index entries pointing past the end of the journal are
//! undone. They can only exist when the index reached disk ahead of a
//! journal tail that was later lost.

use crate::apply::{apply, load_record};
use crate::entity::RootEntity;
use crate::store::Engine;
use brokerstore_core::{Location, StoreResult};
use brokerstore_durability::Record;
use brokerstore_storage::PageTx;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of a full recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Data records applied, counting units of work only once committed
    pub redone: u64,
    /// Index entries undone by reconciliation
    pub undone: u64,
    /// Units of work committed
    pub units_committed: u64,
    /// Units of work closed by a cancel marker
    pub units_cancelled: u64,
    /// Units of work that never completed
    pub units_abandoned: u64,
    /// Wall time
    pub duration_ms: u64,
}

struct OpenUnit {
    tx: PageTx,
    root: RootEntity,
    begun_at: Location,
    /// Records applied inside the unit so far
    applied: u64,
}

#[derive(Default)]
struct ReplayOutcome {
    stats: RecoveryStats,
    /// Last record read
    last_read: Option<Location>,
    /// Unit of work still open at the tail, rolled back
    open_unit: Option<Location>,
}

/// Replay every record from `first` until the end of the journal.
fn replay(engine: &mut Engine, first: Option<Location>) -> StoreResult<ReplayOutcome> {
    let journal = Arc::clone(&engine.journal);
    let mut outcome = ReplayOutcome::default();
    let mut unit: Option<OpenUnit> = None;
    let mut position = first;

    while let Some(location) = position {
        let record = load_record(&journal, location)?;
        debug!(target: "brokerstore::recovery", %location, kind = ?record.kind(), "Replaying");

        match record {
            Record::BeginUnitOfWork => {
                if let Some(stale) = unit.take() {
                    warn!(
                        target: "brokerstore::recovery",
                        begun_at = %stale.begun_at,
                        next = %location,
                        "Unit of work never completed; rolling it back"
                    );
                    stale.tx.rollback();
                    outcome.stats.units_abandoned += 1;
                }
                unit = Some(OpenUnit {
                    tx: engine.index.tx(),
                    root: engine.root.clone(),
                    begun_at: location,
                    applied: 0,
                });
            }
            Record::EndUnitOfWork => match unit.take() {
                Some(OpenUnit {
                    mut tx,
                    mut root,
                    applied,
                    ..
                }) => {
                    root.advance(location);
                    root.save(&mut tx)?;
                    tx.commit()?;
                    engine.root = root;
                    outcome.stats.redone += applied;
                    outcome.stats.units_committed += 1;
                }
                None => {
                    debug!(target: "brokerstore::recovery", %location, "End marker without an open unit of work");
                }
            },
            Record::CancelUnitOfWork => match unit.take() {
                Some(open) => {
                    open.tx.rollback();
                    outcome.stats.units_cancelled += 1;
                }
                None => {
                    debug!(target: "brokerstore::recovery", %location, "Cancel marker without an open unit of work");
                }
            },
            Record::Flush => {}
            data => match unit.as_mut() {
                Some(open) => {
                    apply(&mut open.tx, &mut open.root, &data, location, true)?;
                    open.applied += 1;
                }
                None => {
                    let mut tx = engine.index.tx();
                    let mut root = engine.root.clone();
                    apply(&mut tx, &mut root, &data, location, true)?;
                    root.advance(location);
                    root.save(&mut tx)?;
                    tx.commit()?;
                    engine.root = root;
                    outcome.stats.redone += 1;
                }
            },
        }

        outcome.last_read = Some(location);
        position = journal.next_location(Some(location))?;
    }

    if let Some(open) = unit {
        open.tx.rollback();
        outcome.open_unit = Some(open.begun_at);
    }
    Ok(outcome)
}

/// Full recovery at open. Holds the engine exclusively for its duration.
pub(crate) fn recover(engine: &mut Engine) -> StoreResult<RecoveryStats> {
    let started = Instant::now();
    let from = engine.root.last_applied;
    info!(target: "brokerstore::recovery", watermark = ?from, "Recovering index from journal");

    let first = engine.journal.next_location(from)?;
    let outcome = replay(engine, first)?;
    let mut stats = outcome.stats;

    if let Some(begun_at) = outcome.open_unit {
        warn!(
            target: "brokerstore::recovery",
            %begun_at,
            "Unit of work open at end of journal; cancelling it"
        );
        let marker = Record::CancelUnitOfWork.encode()?;
        engine.journal.append_sync(&marker)?;
        stats.units_abandoned += 1;
    }

    let mut tx = engine.index.tx();
    let mut root = engine.root.clone();
    stats.undone = root.recover_index(&mut tx, engine.journal.last_append_location())?;
    root.save(&mut tx)?;
    tx.commit()?;
    engine.root = root;

    engine.last_recovery_position = engine.journal.last_append_location();
    engine.next_recovery_position = None;

    stats.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        target: "brokerstore::recovery",
        redone = stats.redone,
        undone = stats.undone,
        units_committed = stats.units_committed,
        units_cancelled = stats.units_cancelled,
        units_abandoned = stats.units_abandoned,
        duration_ms = stats.duration_ms,
        watermark = ?engine.root.last_applied,
        "Recovery complete"
    );
    Ok(stats)
}

/// Apply records appended since the last replay. Returns the number applied.
///
/// A unit of work still open at the tail is left for the next call, which
/// resumes at its begin marker.
pub(crate) fn incremental_recover(engine: &mut Engine) -> StoreResult<u64> {
    let first = match engine.next_recovery_position {
        Some(next) => Some(next),
        None => {
            let after = match (engine.last_recovery_position, engine.root.last_applied) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            engine.journal.next_location(after)?
        }
    };

    let outcome = replay(engine, first)?;
    match outcome.open_unit {
        Some(begun_at) => {
            engine.next_recovery_position = Some(begun_at);
            debug!(target: "brokerstore::recovery", %begun_at, "Deferring open unit of work");
        }
        None => {
            engine.next_recovery_position = None;
            if outcome.last_read.is_some() {
                engine.last_recovery_position = outcome.last_read;
            }
        }
    }
    Ok(outcome.stats.redone)
}
