mod error;
mod queries;
mod reserve;
#[cfg(test)]
mod tests;

pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::SlotPolicy;
use crate::model::*;
use crate::wal::Wal;

pub type SharedDateState = Arc<RwLock<DateState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) struct WalAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![(first.event, first.response)];
        while let Ok(next) = rx.try_recv() {
            batch.push((next.event, next.response));
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
            .record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// The allocation core: per-date slot counters and booking logs, with every
/// mutation funneled through [`Engine::reserve`].
///
/// Each date's state sits behind its own async write lock; `reserve` holds
/// that lock across the WAL fsync, so the read-check-append-apply sequence
/// is indivisible with respect to every other caller touching the same date.
pub struct Engine {
    pub(super) state: DashMap<String, SharedDateState>,
    pub(super) policy: SlotPolicy,
    wal_tx: mpsc::Sender<WalAppend>,
    /// Reverse lookup: booking id → date. Serves idempotent replay of
    /// retried reserve calls.
    pub(super) booking_index: DashMap<Ulid, String>,
}

impl Engine {
    /// Replay the WAL at `wal_path`, verify the per-date invariants, and
    /// start the group-commit writer task. Dates configured in `policy` are
    /// seeded at zero usage even if the log never mentions them.
    pub fn new(wal_path: PathBuf, policy: SlotPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut dates: HashMap<String, DateState> = policy
            .dates
            .iter()
            .map(|d| (d.clone(), DateState::new(d.clone())))
            .collect();

        let booking_index = DashMap::new();
        for event in events {
            let Event::BookingRecorded { date, booking } = event;
            booking_index.insert(booking.id, date.clone());
            dates
                .entry(date.clone())
                .or_insert_with(|| DateState::new(date))
                .apply(booking);
        }

        for ds in dates.values() {
            ds.verify()
                .map_err(|msg| io::Error::new(io::ErrorKind::InvalidData, msg))?;
            if ds.slots_used > policy.max_slots_per_date {
                tracing::warn!(
                    "{}: {} slots used exceeds configured capacity {}",
                    ds.date,
                    ds.slots_used,
                    policy.max_slots_per_date
                );
            }
            if !policy.is_valid_date(&ds.date) && ds.slots_used > 0 {
                tracing::warn!(
                    "{}: has {} booked slots but is no longer configured; kept read-only",
                    ds.date,
                    ds.slots_used
                );
            }
        }

        let state = DashMap::new();
        for (date, ds) in dates {
            state.insert(date, Arc::new(RwLock::new(ds)));
        }

        Ok(Self {
            state,
            policy,
            wal_tx,
            booking_index,
        })
    }

    pub fn policy(&self) -> &SlotPolicy {
        &self.policy
    }

    pub fn date_state(&self, date: &str) -> Option<SharedDateState> {
        self.state.get(date).map(|e| e.value().clone())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalAppend {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Snapshot of all date states, for the read views. Configured dates
    /// come first in display order, historical ones after, alphabetically.
    pub(super) fn ordered_date_states(&self) -> Vec<SharedDateState> {
        let mut out: Vec<SharedDateState> = self
            .policy
            .dates
            .iter()
            .filter_map(|d| self.date_state(d))
            .collect();
        let mut extras: Vec<(String, SharedDateState)> = self
            .state
            .iter()
            .filter(|e| !self.policy.is_valid_date(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        extras.sort_by(|a, b| a.0.cmp(&b.0));
        out.extend(extras.into_iter().map(|(_, rs)| rs));
        out
    }
}
