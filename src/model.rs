use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// 1-based slot number within a date's schedule.
pub type SlotNo = u32;

/// One group's reserved contiguous slot range. Immutable once created; there
/// is no cancellation path, so a booking never leaves its date's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub group_size: u32,
    /// Raw comma-separated student identifiers, exactly as submitted
    /// (trimmed, order-preserving, not deduplicated).
    pub student_ids: String,
    pub start_slot: SlotNo,
    pub end_slot: SlotNo,
    pub created_at: Ms,
}

impl Booking {
    pub fn slot_count(&self) -> u32 {
        self.end_slot - self.start_slot + 1
    }
}

/// The WAL record format. Bookings are never mutated or deleted, so this is
/// the only event kind and replay reproduces state exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingRecorded { date: String, booking: Booking },
}

/// All committed bookings for one date plus its usage counter.
///
/// `slots_used` is the single source of truth for admission; it moves only
/// together with a `bookings` push, under the date's write lock.
#[derive(Debug, Clone)]
pub struct DateState {
    pub date: String,
    pub slots_used: u32,
    /// Commit order == slot order == `created_at` order.
    pub bookings: Vec<Booking>,
}

impl DateState {
    pub fn new(date: String) -> Self {
        Self {
            date,
            slots_used: 0,
            bookings: Vec::new(),
        }
    }

    pub fn remaining(&self, max_slots: u32) -> u32 {
        max_slots.saturating_sub(self.slots_used)
    }

    pub fn last_created_at(&self) -> Ms {
        self.bookings.last().map_or(0, |b| b.created_at)
    }

    pub fn find_booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Append a committed booking and advance the counter.
    pub fn apply(&mut self, booking: Booking) {
        self.slots_used += booking.slot_count();
        self.bookings.push(booking);
    }

    /// Check the per-date invariants: ranges gap-free from slot 1, sized to
    /// their group, timestamps strictly increasing, counter equal to the
    /// covered slot count. Used after WAL replay.
    pub fn verify(&self) -> Result<(), String> {
        let mut next_slot: SlotNo = 1;
        let mut last_ts: Ms = 0;
        for b in &self.bookings {
            if b.start_slot != next_slot {
                return Err(format!(
                    "{}: booking {} starts at slot {}, expected {}",
                    self.date, b.id, b.start_slot, next_slot
                ));
            }
            if b.end_slot < b.start_slot {
                return Err(format!("{}: booking {} has inverted range", self.date, b.id));
            }
            if b.slot_count() != b.group_size {
                return Err(format!(
                    "{}: booking {} covers {} slots for group size {}",
                    self.date,
                    b.id,
                    b.slot_count(),
                    b.group_size
                ));
            }
            if b.created_at <= last_ts {
                return Err(format!(
                    "{}: booking {} breaks created_at monotonicity",
                    self.date, b.id
                ));
            }
            last_ts = b.created_at;
            next_slot = b.end_slot + 1;
        }
        if self.slots_used != next_slot - 1 {
            return Err(format!(
                "{}: counter says {} slots used, bookings cover {}",
                self.date,
                self.slots_used,
                next_slot - 1
            ));
        }
        Ok(())
    }
}

/// The structured outcome of a reserve call — confirmed or denied, never
/// ambiguous. A denial is terminal, not a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Confirmed { start_slot: SlotNo, end_slot: SlotNo },
    Denied { slots_remaining: u32 },
}

// ── Read-view row types ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotUsage {
    pub date: String,
    pub slots_used: u32,
    pub slots_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRow {
    pub id: Ulid,
    pub date: String,
    pub group_size: u32,
    pub student_ids: String,
    pub start_slot: SlotNo,
    pub end_slot: SlotNo,
    pub created_at: Ms,
}
