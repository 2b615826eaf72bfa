use ulid::Ulid;

use crate::limits::MAX_STUDENT_IDS_LEN;
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

impl Engine {
    /// Atomically grant or deny a contiguous slot range on `date`.
    ///
    /// The whole read-check-append-apply sequence runs under the date's
    /// write lock, held across the WAL fsync: two racing calls for the same
    /// date serialize there, and commit order assigns slot order. Distinct
    /// dates never contend.
    ///
    /// `key` is an optional client-supplied booking id. Retrying with the
    /// same key returns the originally confirmed range instead of
    /// allocating again, which resolves the "did my timed-out call commit?"
    /// ambiguity.
    ///
    /// A `Denied` outcome is a normal return value: no counter mutation, no
    /// booking row, nothing to retry.
    pub async fn reserve(
        &self,
        key: Option<Ulid>,
        date: &str,
        group_size: u32,
        student_ids: &str,
    ) -> Result<Reservation, EngineError> {
        let student_ids = student_ids.trim();
        if student_ids.is_empty() {
            return Err(EngineError::EmptyStudentIds);
        }
        if student_ids.len() > MAX_STUDENT_IDS_LEN {
            return Err(EngineError::LimitExceeded("student id list too long"));
        }
        if !self.policy.is_valid_group_size(group_size) {
            return Err(EngineError::InvalidGroupSize(group_size));
        }
        if !self.policy.is_valid_date(date) {
            return Err(EngineError::UnknownDate(date.to_string()));
        }

        // Idempotent replay, checked before taking the write lock so a key
        // that landed on another date never forces cross-date locking.
        if let Some(id) = key
            && let Some(prior) = self.lookup_booking(&id).await
        {
            return Ok(Reservation::Confirmed {
                start_slot: prior.start_slot,
                end_slot: prior.end_slot,
            });
        }

        let rs = self
            .date_state(date)
            .ok_or_else(|| EngineError::UnknownDate(date.to_string()))?;
        let mut guard = rs.write().await;

        // Re-check under the lock: a same-key retry may have raced us here.
        if let Some(id) = key
            && let Some(prior) = guard.find_booking(&id)
        {
            return Ok(Reservation::Confirmed {
                start_slot: prior.start_slot,
                end_slot: prior.end_slot,
            });
        }

        let remaining = guard.remaining(self.policy.max_slots_per_date);
        if remaining < group_size {
            metrics::counter!(crate::observability::RESERVATIONS_DENIED_TOTAL).increment(1);
            return Ok(Reservation::Denied {
                slots_remaining: remaining,
            });
        }

        let start_slot = guard.slots_used + 1;
        let end_slot = guard.slots_used + group_size;
        let booking = Booking {
            id: key.unwrap_or_else(Ulid::new),
            group_size,
            student_ids: student_ids.to_string(),
            start_slot,
            end_slot,
            // Clamp so log order, slot order and timestamp order agree even
            // if the wall clock stalls or steps backwards.
            created_at: now_ms().max(guard.last_created_at() + 1),
        };
        let event = Event::BookingRecorded {
            date: guard.date.clone(),
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;

        self.booking_index.insert(booking.id, guard.date.clone());
        guard.apply(booking);
        metrics::counter!(crate::observability::RESERVATIONS_CONFIRMED_TOTAL).increment(1);
        metrics::gauge!(crate::observability::SLOTS_USED, "date" => guard.date.clone())
            .set(f64::from(guard.slots_used));

        Ok(Reservation::Confirmed {
            start_slot,
            end_slot,
        })
    }

    /// Fetch a committed booking by id, if any. Read locks only.
    pub async fn lookup_booking(&self, id: &Ulid) -> Option<Booking> {
        let date = self.booking_index.get(id).map(|e| e.value().clone())?;
        let rs = self.date_state(&date)?;
        let guard = rs.read().await;
        guard.find_booking(id).cloned()
    }
}
