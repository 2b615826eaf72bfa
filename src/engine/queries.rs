//! Read-only views over committed state. These take per-date read locks
//! only and sit outside the reserve atomicity boundary: a view observed by
//! a client may be stale by the time the client acts on it, which is safe
//! because admission is re-checked inside `reserve` regardless.

use crate::model::*;

use super::Engine;

impl Engine {
    /// Usage summary per date: `slots_used` and what remains of the
    /// configured capacity. `date = None` lists every known date, configured
    /// ones first in display order. An unknown date yields no rows rather
    /// than an error, matching SQL filter semantics.
    pub async fn slot_usage(&self, date: Option<&str>) -> Vec<SlotUsage> {
        let mut rows = Vec::new();
        for rs in self.ordered_date_states() {
            let guard = rs.read().await;
            if let Some(filter) = date
                && guard.date != filter
            {
                continue;
            }
            rows.push(SlotUsage {
                date: guard.date.clone(),
                slots_used: guard.slots_used,
                slots_remaining: guard.remaining(self.policy.max_slots_per_date),
            });
        }
        rows
    }

    /// The booking log, `created_at` ascending. Per-date logs are already in
    /// commit order; the cross-date listing merges them by timestamp.
    pub async fn list_bookings(&self, date: Option<&str>) -> Vec<BookingRow> {
        let mut rows = Vec::new();
        for rs in self.ordered_date_states() {
            let guard = rs.read().await;
            if let Some(filter) = date
                && guard.date != filter
            {
                continue;
            }
            rows.extend(guard.bookings.iter().map(|b| BookingRow {
                id: b.id,
                date: guard.date.clone(),
                group_size: b.group_size,
                student_ids: b.student_ids.clone(),
                start_slot: b.start_slot,
                end_slot: b.end_slot,
                created_at: b.created_at,
            }));
        }
        rows.sort_by_key(|r| r.created_at);
        rows
    }

    /// Advisory duplicate check: substring containment of `identifier`
    /// against every booking's raw identifier list. Race-prone by design —
    /// a presentation-layer convenience, not an invariant.
    pub async fn has_booking(&self, identifier: &str) -> bool {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return false;
        }
        for rs in self.ordered_date_states() {
            let guard = rs.read().await;
            if guard.bookings.iter().any(|b| b.student_ids.contains(identifier)) {
                return true;
            }
        }
        false
    }
}
