use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use crate::config::SlotPolicy;
use crate::model::*;
use crate::wal::Wal;

use super::{Engine, EngineError};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("podium_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn default_policy() -> SlotPolicy {
    SlotPolicy::default()
}

fn small_policy(max_slots: u32) -> SlotPolicy {
    SlotPolicy {
        max_slots_per_date: max_slots,
        ..SlotPolicy::default()
    }
}

fn new_engine(name: &str, policy: SlotPolicy) -> Engine {
    Engine::new(test_wal_path(name), policy).unwrap()
}

fn confirmed(outcome: Reservation) -> (SlotNo, SlotNo) {
    match outcome {
        Reservation::Confirmed {
            start_slot,
            end_slot,
        } => (start_slot, end_slot),
        other => panic!("expected Confirmed, got {other:?}"),
    }
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn unknown_date_rejected() {
    let engine = new_engine("unknown_date.wal", default_policy());
    let result = engine.reserve(None, "December 3", 1, "12345678").await;
    assert!(matches!(result, Err(EngineError::UnknownDate(_))));
}

#[tokio::test]
async fn group_size_outside_domain_rejected() {
    let engine = new_engine("bad_group_size.wal", default_policy());
    for size in [0, 4, 99] {
        let result = engine.reserve(None, "December 2", size, "12345678").await;
        assert!(matches!(result, Err(EngineError::InvalidGroupSize(s)) if s == size));
    }
}

#[tokio::test]
async fn empty_student_ids_rejected() {
    let engine = new_engine("empty_ids.wal", default_policy());
    for ids in ["", "   ", "\t\n"] {
        let result = engine.reserve(None, "December 2", 1, ids).await;
        assert!(matches!(result, Err(EngineError::EmptyStudentIds)));
    }
}

#[tokio::test]
async fn oversized_student_ids_rejected() {
    let engine = new_engine("long_ids.wal", default_policy());
    let ids = "9".repeat(crate::limits::MAX_STUDENT_IDS_LEN + 1);
    let result = engine.reserve(None, "December 2", 1, &ids).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn student_ids_are_trimmed_but_kept_raw() {
    let engine = new_engine("raw_ids.wal", default_policy());
    engine
        .reserve(None, "December 2", 2, "  12345678, 87654321  ")
        .await
        .unwrap();
    let rows = engine.list_bookings(None).await;
    assert_eq!(rows[0].student_ids, "12345678, 87654321");
}

// ── Allocation ───────────────────────────────────────────

#[tokio::test]
async fn ranges_are_contiguous_and_deterministic() {
    let engine = new_engine("contiguous.wal", default_policy());
    let first = engine
        .reserve(None, "December 2", 3, "a, b, c")
        .await
        .unwrap();
    assert_eq!(confirmed(first), (1, 3));
    let second = engine
        .reserve(None, "December 2", 3, "d, e, f")
        .await
        .unwrap();
    assert_eq!(confirmed(second), (4, 6));
    let third = engine.reserve(None, "December 2", 1, "g").await.unwrap();
    assert_eq!(confirmed(third), (7, 7));
}

#[tokio::test]
async fn fills_to_capacity_then_denies_with_zero_remaining() {
    let engine = new_engine("fill_deny.wal", default_policy());
    // 7 × 3 + 1 = 22
    for i in 0..7 {
        let outcome = engine
            .reserve(None, "December 2", 3, &format!("group{i}"))
            .await
            .unwrap();
        assert_eq!(confirmed(outcome), (i * 3 + 1, i * 3 + 3));
    }
    let last = engine.reserve(None, "December 2", 1, "tail").await.unwrap();
    assert_eq!(confirmed(last), (22, 22));

    let denied = engine.reserve(None, "December 2", 1, "z").await.unwrap();
    assert_eq!(denied, Reservation::Denied { slots_remaining: 0 });
}

#[tokio::test]
async fn partial_remainder_denies_larger_group_but_fits_smaller() {
    let engine = new_engine("partial.wal", small_policy(4));
    engine.reserve(None, "December 2", 3, "a, b, c").await.unwrap();

    let denied = engine.reserve(None, "December 2", 2, "d, e").await.unwrap();
    assert_eq!(denied, Reservation::Denied { slots_remaining: 1 });

    let fits = engine.reserve(None, "December 2", 1, "f").await.unwrap();
    assert_eq!(confirmed(fits), (4, 4));
}

#[tokio::test]
async fn denial_mutates_nothing() {
    let engine = new_engine("deny_pure.wal", small_policy(2));
    engine.reserve(None, "December 2", 2, "a, b").await.unwrap();

    let usage_before = engine.slot_usage(Some("December 2")).await;
    let bookings_before = engine.list_bookings(None).await.len();

    for _ in 0..3 {
        let outcome = engine.reserve(None, "December 2", 1, "z").await.unwrap();
        assert!(matches!(outcome, Reservation::Denied { .. }));
    }

    assert_eq!(engine.slot_usage(Some("December 2")).await, usage_before);
    assert_eq!(engine.list_bookings(None).await.len(), bookings_before);
}

#[tokio::test]
async fn dates_do_not_share_capacity() {
    let engine = new_engine("independent_dates.wal", small_policy(3));
    engine.reserve(None, "December 2", 3, "a, b, c").await.unwrap();

    // December 2 is full, December 4 is untouched
    let denied = engine.reserve(None, "December 2", 1, "x").await.unwrap();
    assert!(matches!(denied, Reservation::Denied { .. }));
    let ok = engine.reserve(None, "December 4", 1, "x").await.unwrap();
    assert_eq!(confirmed(ok), (1, 1));
}

#[tokio::test]
async fn created_at_strictly_increases_per_date() {
    let engine = new_engine("monotonic.wal", default_policy());
    for i in 0..5 {
        engine
            .reserve(None, "December 2", 1, &format!("s{i}"))
            .await
            .unwrap();
    }
    let rows = engine.list_bookings(Some("December 2")).await;
    for pair in rows.windows(2) {
        assert!(pair[1].created_at > pair[0].created_at);
    }
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test]
async fn oversubscribed_racers_get_exactly_capacity() {
    let engine = Arc::new(new_engine("oversubscribed.wal", default_policy()));

    // 30 callers asking for 60 slots total against a 22-slot date.
    let mut handles = Vec::new();
    for i in 0..30u32 {
        let engine = engine.clone();
        let group_size = i % 3 + 1;
        handles.push(tokio::spawn(async move {
            let outcome = engine
                .reserve(None, "December 2", group_size, &format!("racer{i}"))
                .await
                .unwrap();
            (group_size, outcome)
        }));
    }

    let mut granted: Vec<(SlotNo, SlotNo)> = Vec::new();
    let mut denied = 0usize;
    for handle in handles {
        let (group_size, outcome) = handle.await.unwrap();
        match outcome {
            Reservation::Confirmed {
                start_slot,
                end_slot,
            } => {
                assert_eq!(end_slot - start_slot + 1, group_size);
                granted.push((start_slot, end_slot));
            }
            Reservation::Denied { slots_remaining } => {
                // Every denial saw less room than it asked for.
                assert!(slots_remaining < group_size);
                denied += 1;
            }
        }
    }
    assert!(denied > 0, "60 requested slots must not all fit in 22");

    // Committed ranges are disjoint and gap-free from slot 1.
    granted.sort_unstable();
    let mut next = 1;
    for (start, end) in &granted {
        assert_eq!(*start, next, "gap or overlap at slot {next}");
        next = end + 1;
    }
    let total: u32 = next - 1;
    assert!(total <= 22);

    let usage = engine.slot_usage(Some("December 2")).await;
    assert_eq!(usage[0].slots_used, total);
    assert_eq!(usage[0].slots_remaining, 22 - total);

    // No racer that fit was turned away: whatever remains is smaller than
    // the smallest group size, or nothing was denied spuriously.
    assert!(22 - total < 3 || denied == 0);
}

#[tokio::test]
async fn distinct_dates_fill_independently_under_load() {
    let engine = Arc::new(new_engine("parallel_dates.wal", default_policy()));

    let mut handles = Vec::new();
    for date in ["December 2", "December 4"] {
        for i in 0..22 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .reserve(None, date, 1, &format!("{date}-{i}"))
                    .await
                    .unwrap()
            }));
        }
    }
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, Reservation::Confirmed { .. }));
    }

    for usage in engine.slot_usage(None).await {
        assert_eq!(usage.slots_used, 22);
        assert_eq!(usage.slots_remaining, 0);
    }
}

// ── Idempotency ──────────────────────────────────────────

#[tokio::test]
async fn same_key_retry_returns_original_range() {
    let engine = new_engine("idempotent.wal", default_policy());
    let key = Ulid::new();

    let first = engine
        .reserve(Some(key), "December 2", 2, "a, b")
        .await
        .unwrap();
    assert_eq!(confirmed(first), (1, 2));

    // Retry (e.g. after a client timeout) — no second allocation.
    let retry = engine
        .reserve(Some(key), "December 2", 2, "a, b")
        .await
        .unwrap();
    assert_eq!(confirmed(retry), (1, 2));

    let usage = engine.slot_usage(Some("December 2")).await;
    assert_eq!(usage[0].slots_used, 2);
    assert_eq!(engine.list_bookings(None).await.len(), 1);
}

#[tokio::test]
async fn same_key_retry_survives_restart() {
    let path = test_wal_path("idempotent_restart.wal");
    let key = Ulid::new();

    {
        let engine = Engine::new(path.clone(), default_policy()).unwrap();
        let first = engine
            .reserve(Some(key), "December 4", 3, "a, b, c")
            .await
            .unwrap();
        assert_eq!(confirmed(first), (1, 3));
    }

    let engine = Engine::new(path, default_policy()).unwrap();
    let retry = engine
        .reserve(Some(key), "December 4", 3, "a, b, c")
        .await
        .unwrap();
    assert_eq!(confirmed(retry), (1, 3));
    assert_eq!(engine.slot_usage(Some("December 4")).await[0].slots_used, 3);
}

// ── Durability & replay ──────────────────────────────────

#[tokio::test]
async fn replay_restores_counters_and_log() {
    let path = test_wal_path("replay_restore.wal");

    {
        let engine = Engine::new(path.clone(), default_policy()).unwrap();
        engine.reserve(None, "December 2", 3, "a, b, c").await.unwrap();
        engine.reserve(None, "December 2", 2, "d, e").await.unwrap();
        engine.reserve(None, "December 4", 1, "f").await.unwrap();
    }

    let engine = Engine::new(path, default_policy()).unwrap();
    let usage = engine.slot_usage(None).await;
    assert_eq!(usage[0].slots_used, 5); // December 2
    assert_eq!(usage[1].slots_used, 1); // December 4

    // Allocation continues from the next free slot, not from 1.
    let next = engine.reserve(None, "December 2", 1, "g").await.unwrap();
    assert_eq!(confirmed(next), (6, 6));
}

#[tokio::test]
async fn replay_rejects_log_with_slot_gap() {
    let path = test_wal_path("replay_gap.wal");
    {
        let mut wal = Wal::open(&path).unwrap();
        for (start, end, ts) in [(1u32, 2u32, 10i64), (5, 5, 20)] {
            wal.append(&Event::BookingRecorded {
                date: "December 2".into(),
                booking: Booking {
                    id: Ulid::new(),
                    group_size: end - start + 1,
                    student_ids: "x".into(),
                    start_slot: start,
                    end_slot: end,
                    created_at: ts,
                },
            })
            .unwrap();
        }
    }

    let result = Engine::new(path, default_policy());
    let err = result.err().expect("gap in slot coverage must fail replay");
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn unconfigured_date_in_log_is_read_only() {
    let path = test_wal_path("retired_date.wal");
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::BookingRecorded {
            date: "December 9".into(),
            booking: Booking {
                id: Ulid::new(),
                group_size: 2,
                student_ids: "12345678, 87654321".into(),
                start_slot: 1,
                end_slot: 2,
                created_at: 10,
            },
        })
        .unwrap();
    }

    let engine = Engine::new(path, default_policy()).unwrap();

    // Still visible in the views...
    let usage = engine.slot_usage(Some("December 9")).await;
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].slots_used, 2);
    assert_eq!(engine.list_bookings(Some("December 9")).await.len(), 1);

    // ...but closed to new reservations.
    let result = engine.reserve(None, "December 9", 1, "x").await;
    assert!(matches!(result, Err(EngineError::UnknownDate(_))));
}

// ── Read views ───────────────────────────────────────────

#[tokio::test]
async fn slot_usage_reports_zero_for_untouched_dates() {
    let engine = new_engine("usage_zero.wal", default_policy());
    let usage = engine.slot_usage(None).await;
    assert_eq!(usage.len(), 2);
    assert_eq!(usage[0].date, "December 2");
    assert_eq!(usage[0].slots_used, 0);
    assert_eq!(usage[0].slots_remaining, 22);
    assert_eq!(usage[1].date, "December 4");
}

#[tokio::test]
async fn slot_usage_unknown_date_yields_no_rows() {
    let engine = new_engine("usage_unknown.wal", default_policy());
    assert!(engine.slot_usage(Some("December 3")).await.is_empty());
}

#[tokio::test]
async fn bookings_listing_is_created_at_ordered_across_dates() {
    let engine = new_engine("bookings_order.wal", default_policy());
    engine.reserve(None, "December 2", 1, "a").await.unwrap();
    engine.reserve(None, "December 4", 1, "b").await.unwrap();
    engine.reserve(None, "December 2", 1, "c").await.unwrap();

    let rows = engine.list_bookings(None).await;
    assert_eq!(rows.len(), 3);
    for pair in rows.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }

    let dec2 = engine.list_bookings(Some("December 2")).await;
    assert_eq!(dec2.len(), 2);
    assert_eq!(dec2[0].student_ids, "a");
    assert_eq!(dec2[1].student_ids, "c");
}

#[tokio::test]
async fn has_booking_is_substring_containment() {
    let engine = new_engine("has_booking.wal", default_policy());
    engine
        .reserve(None, "December 2", 2, "12345678, 87654321")
        .await
        .unwrap();

    assert!(engine.has_booking("12345678").await);
    assert!(engine.has_booking("87654321").await);
    // Substring semantics, advisory only
    assert!(engine.has_booking("345678").await);
    assert!(!engine.has_booking("00000000").await);
    assert!(!engine.has_booking("").await);
    assert!(!engine.has_booking("   ").await);
}
