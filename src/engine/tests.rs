use super::*;
use crate::clock::ManualClock;
use crate::damage::ConditionThreshold;
use crate::ledger::{CreditType, InMemoryLedger};
use chrono::NaiveDate;

const H: Ms = HOUR_MS;
const M: Ms = MINUTE_MS;
/// 2024-03-15T00:00:00Z
const T0: Ms = 1_710_460_800_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("rigbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
    ledger: Arc<InMemoryLedger>,
}

fn harness_with(path: PathBuf, assessor: Arc<dyn DamageAssessor>) -> Harness {
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = Arc::new(InMemoryLedger::new());
    let collaborators = Collaborators {
        clock: clock.clone(),
        ledger: ledger.clone(),
        pricing: PricingConfig::default(),
        assessor,
    };
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), collaborators).unwrap();
    Harness {
        engine,
        clock,
        ledger,
    }
}

fn harness(name: &str) -> Harness {
    harness_with(test_wal_path(name), Arc::new(NoAssessment))
}

async fn space(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .create_resource(ResourceInfo::new(id, ResourceKind::Space))
        .await
        .unwrap();
    id
}

async fn subscriber(h: &Harness, blocks: u32) -> Holder {
    let member = Ulid::new();
    h.ledger.set_subscriber(member, true);
    h.ledger
        .allocate_monthly(member, blocks, &CreditType::FreeHours)
        .await
        .unwrap();
    Holder::Registered(member)
}

async fn balance(h: &Harness, holder: &Holder) -> u32 {
    h.ledger
        .balance(holder.member_id().unwrap(), &CreditType::FreeHours)
        .await
        .unwrap()
}

fn guest() -> Holder {
    Holder::Guest("Sam".into())
}

async fn book(engine: &Engine, rid: Ulid, holder: Holder, start: Ms, end: Ms) -> Booking {
    engine
        .create_booking(rid, holder, Span::new(start, end), BookingTerms::default())
        .await
        .unwrap()
}

/// Requested → StaffPreparing → ReadyForPickup → CheckedOut.
async fn hand_over(engine: &Engine, b: Booking) -> Booking {
    let b = engine.start_preparing(&b).await.unwrap();
    let b = engine.mark_ready(&b).await.unwrap();
    engine.checkout(&b, Condition::Good).await.unwrap()
}

// ── Pricing through the engine ───────────────────────────

#[tokio::test]
async fn subscriber_with_ample_credit_pays_nothing() {
    let h = harness("ample_credit.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 16).await;

    let b = book(&h.engine, rid, holder.clone(), T0 + 14 * H, T0 + 16 * H).await;
    assert_eq!(b.free_units_used, 4);
    assert_eq!(b.paid_amount, 0);
    assert_eq!(balance(&h, &holder).await, 12);
}

#[tokio::test]
async fn subscriber_short_on_credit_pays_the_rest() {
    let h = harness("short_credit.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 2).await;

    let quote = h
        .engine
        .quote(&holder, Span::new(T0 + 14 * H, T0 + 16 * H))
        .await
        .unwrap();
    assert_eq!(quote.free_hours(), 1.0);
    assert_eq!(quote.paid_hours(), 1.0);
    assert_eq!(quote.cost_cents, 1500);

    let b = book(&h.engine, rid, holder.clone(), T0 + 14 * H, T0 + 16 * H).await;
    assert_eq!(b.free_units_used, 2);
    assert_eq!(b.paid_amount, 1500);
    assert_eq!(balance(&h, &holder).await, 0);
}

#[tokio::test]
async fn guest_pays_full_rate() {
    let h = harness("guest_rate.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + 90 * M).await;
    assert_eq!(b.free_units_used, 0);
    assert_eq!(b.paid_amount, 2250);
}

#[tokio::test]
async fn credit_covering_a_partial_block_costs_nothing() {
    let h = harness("partial_block_credit.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 10).await;

    let b = book(&h.engine, rid, holder.clone(), T0 + 10 * H, T0 + 11 * H + 10 * M).await;
    assert_eq!(b.paid_amount, 0);
    assert_eq!(b.free_units_used, 3);
    assert_eq!(balance(&h, &holder).await, 7);
}

// ── Conflicts ────────────────────────────────────────────

#[tokio::test]
async fn overlap_rejected_adjacent_accepted() {
    let h = harness("overlap_adjacent.wal");
    let rid = space(&h.engine).await;
    let a = book(&h.engine, rid, guest(), T0 + 14 * H, T0 + 16 * H).await;

    let err = h
        .engine
        .create_booking(
            rid,
            guest(),
            Span::new(T0 + 15 * H, T0 + 17 * H),
            BookingTerms::default(),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::SchedulingConflict { conflicting, .. } => assert_eq!(conflicting, a.id),
        other => panic!("expected conflict, got {other:?}"),
    }

    let c = book(&h.engine, rid, guest(), T0 + 16 * H, T0 + 18 * H).await;
    assert_eq!(c.state, BookingState::Requested);
    assert_eq!(h.engine.bookings_for_resource(rid).await.unwrap().len(), 2);
}

#[tokio::test]
async fn rejected_booking_leaves_credit_untouched() {
    let h = harness("conflict_no_charge.wal");
    let rid = space(&h.engine).await;
    book(&h.engine, rid, guest(), T0, T0 + 2 * H).await;

    let holder = subscriber(&h, 8).await;
    let result = h
        .engine
        .create_booking(rid, holder.clone(), Span::new(T0 + H, T0 + 3 * H), BookingTerms::default())
        .await;
    assert!(matches!(result, Err(EngineError::SchedulingConflict { .. })));
    assert_eq!(balance(&h, &holder).await, 8);
}

#[tokio::test]
async fn cancelled_booking_frees_its_interval() {
    let h = harness("cancel_frees.wal");
    let rid = space(&h.engine).await;
    let a = book(&h.engine, rid, guest(), T0, T0 + 2 * H).await;
    h.engine.cancel(&a).await.unwrap();

    book(&h.engine, rid, guest(), T0, T0 + 2 * H).await;
}

#[tokio::test]
async fn inverted_interval_rejected() {
    let h = harness("inverted.wal");
    let rid = space(&h.engine).await;
    let result = h
        .engine
        .create_booking(rid, guest(), Span { start: T0 + H, end: T0 }, BookingTerms::default())
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInterval(_))));
}

#[tokio::test]
async fn unknown_resource_not_found() {
    let h = harness("unknown_resource.wal");
    let rid = Ulid::new();
    let result = h
        .engine
        .create_booking(rid, guest(), Span::new(T0, T0 + H), BookingTerms::default())
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(id)) if id == rid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_requests_one_wins() {
    let h = harness("concurrent_race.wal");
    let rid = space(&h.engine).await;
    let engine = Arc::new(h.engine);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let start = T0 + i * 10 * M;
            engine
                .create_booking(
                    rid,
                    Holder::Guest(format!("band {i}")),
                    Span::new(start, start + 3 * H),
                    BookingTerms::default(),
                )
                .await
        }));
    }
    let results = futures::future::join_all(tasks).await;

    let mut accepted: Vec<Booking> = Vec::new();
    for r in results {
        match r.unwrap() {
            Ok(b) => accepted.push(b),
            Err(EngineError::SchedulingConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(!accepted.is_empty());
    for (i, a) in accepted.iter().enumerate() {
        for b in &accepted[i + 1..] {
            assert!(!a.span.overlaps(&b.span), "{} overlaps {}", a.span, b.span);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_exactly_one_succeeds() {
    let h = harness("concurrent_identical.wal");
    let rid = space(&h.engine).await;
    let engine = Arc::new(h.engine);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create_booking(rid, guest(), Span::new(T0, T0 + H), BookingTerms::default())
                    .await
            })
        })
        .collect();
    let ok = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(ok, 1);
}

// ── Resource status ──────────────────────────────────────

#[tokio::test]
async fn maintenance_and_unloanable_resources_refuse_bookings() {
    let h = harness("unavailable.wal");
    let rid = space(&h.engine).await;

    h.engine
        .set_resource_status(rid, OperationalStatus::Maintenance)
        .await
        .unwrap();
    let result = h
        .engine
        .create_booking(rid, guest(), Span::new(T0, T0 + H), BookingTerms::default())
        .await;
    assert!(matches!(result, Err(EngineError::UnavailableResource { .. })));
    assert!(!h.engine.is_available(rid, Span::new(T0, T0 + H)).await.unwrap());

    h.engine
        .set_resource_status(rid, OperationalStatus::Available)
        .await
        .unwrap();
    h.engine.set_loanable(rid, false).await.unwrap();
    let result = h
        .engine
        .create_booking(rid, guest(), Span::new(T0, T0 + H), BookingTerms::default())
        .await;
    assert!(matches!(result, Err(EngineError::UnavailableResource { loanable: false, .. })));
}

#[tokio::test]
async fn checked_out_status_is_not_settable() {
    let h = harness("derived_status.wal");
    let rid = space(&h.engine).await;
    let result = h
        .engine
        .set_resource_status(rid, OperationalStatus::CheckedOut)
        .await;
    assert!(matches!(result, Err(EngineError::DerivedStatus(_))));
}

#[tokio::test]
async fn checked_out_resource_still_takes_later_bookings() {
    let h = harness("checked_out_later.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + 2 * H).await;
    hand_over(&h.engine, b).await;
    let info = h.engine.get_resource_info(rid).await.unwrap();
    assert_eq!(info.status, OperationalStatus::CheckedOut);

    book(&h.engine, rid, guest(), T0 + 3 * H, T0 + 4 * H).await;
}

#[tokio::test]
async fn returning_one_of_two_loans_keeps_resource_checked_out() {
    let h = harness("back_to_back_loans.wal");
    let rid = space(&h.engine).await;
    let first = book(&h.engine, rid, guest(), T0 + 10 * H, T0 + 12 * H).await;
    let second = book(&h.engine, rid, guest(), T0 + 12 * H, T0 + 14 * H).await;
    let first = hand_over(&h.engine, first).await;
    let second = hand_over(&h.engine, second).await;

    h.engine.process_return(&first, Condition::Good, None).await.unwrap();
    let info = h.engine.get_resource_info(rid).await.unwrap();
    assert_eq!(info.status, OperationalStatus::CheckedOut);
    assert_eq!(
        h.engine.get_booking(second.id).await.unwrap().state,
        BookingState::CheckedOut
    );

    h.engine.process_return(&second, Condition::Good, None).await.unwrap();
    let info = h.engine.get_resource_info(rid).await.unwrap();
    assert_eq!(info.status, OperationalStatus::Available);
}

#[tokio::test]
async fn staff_cannot_mark_available_while_gear_is_out() {
    let h = harness("available_while_out.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + 2 * H).await;
    let b = hand_over(&h.engine, b).await;

    h.engine
        .set_resource_status(rid, OperationalStatus::Available)
        .await
        .unwrap();
    let info = h.engine.get_resource_info(rid).await.unwrap();
    assert_eq!(info.status, OperationalStatus::CheckedOut);

    h.engine.process_return(&b, Condition::Good, None).await.unwrap();
    h.engine
        .set_resource_status(rid, OperationalStatus::Available)
        .await
        .unwrap();
    let info = h.engine.get_resource_info(rid).await.unwrap();
    assert_eq!(info.status, OperationalStatus::Available);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_updates_booking_and_resource() {
    let h = harness("full_lifecycle.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + 2 * H).await;

    h.clock.advance(10 * M);
    let b = hand_over(&h.engine, b).await;
    assert_eq!(b.state, BookingState::CheckedOut);
    assert_eq!(b.checked_out_at, Some(T0 + 10 * M));
    assert_eq!(b.condition_out, Some(Condition::Good));

    let b = h.engine.schedule_dropoff(&b).await.unwrap();
    let b = h.engine.begin_return_processing(&b).await.unwrap();
    h.clock.advance(H);
    let b = h
        .engine
        .process_return(&b, Condition::Fair, Some("scuffed lid".into()))
        .await
        .unwrap();
    assert_eq!(b.state, BookingState::Returned);
    assert_eq!(b.returned_at, Some(T0 + 70 * M));
    assert_eq!(b.condition_in, Some(Condition::Fair));
    assert_eq!(b.damage_notes.as_deref(), Some("scuffed lid"));

    let info = h.engine.get_resource_info(rid).await.unwrap();
    assert_eq!(info.status, OperationalStatus::Available);
    assert_eq!(info.condition, Some(Condition::Fair));
}

#[tokio::test]
async fn skipping_a_step_is_illegal() {
    let h = harness("skip_step.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + H).await;

    let result = h.engine.checkout(&b, Condition::Good).await;
    assert!(matches!(
        result,
        Err(EngineError::IllegalStateTransition {
            from: BookingState::Requested,
            to: BookingState::CheckedOut,
            ..
        })
    ));
}

#[tokio::test]
async fn missed_dropoff_goes_back_to_checked_out() {
    let h = harness("missed_dropoff.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + H).await;
    let b = hand_over(&h.engine, b).await;
    let checked_out_at = b.checked_out_at;

    let b = h.engine.schedule_dropoff(&b).await.unwrap();
    h.clock.advance(2 * H);
    let b = h.engine.reschedule_dropoff(&b).await.unwrap();
    assert_eq!(b.state, BookingState::CheckedOut);
    assert_eq!(b.checked_out_at, checked_out_at);
    assert_eq!(b.condition_out, Some(Condition::Good));
}

#[tokio::test]
async fn cancel_after_checkout_is_refused() {
    let h = harness("cancel_after_checkout.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 8).await;

    let b = book(&h.engine, rid, holder.clone(), T0, T0 + 2 * H).await;
    let b = hand_over(&h.engine, b).await;
    let result = h.engine.cancel(&b).await;
    assert!(matches!(result, Err(EngineError::CannotCancelAfterCheckout(id)) if id == b.id));
    assert_eq!(balance(&h, &holder).await, 4);
}

#[tokio::test]
async fn cancel_while_requested_refunds_credit() {
    let h = harness("cancel_requested.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 8).await;

    let b = book(&h.engine, rid, holder.clone(), T0, T0 + 2 * H).await;
    assert_eq!(balance(&h, &holder).await, 4);
    let b = h.engine.cancel(&b).await.unwrap();
    assert_eq!(b.state, BookingState::Cancelled);
    assert_eq!(balance(&h, &holder).await, 8);

    let again = h.engine.cancel(&b).await;
    assert!(matches!(again, Err(EngineError::IllegalStateTransition { .. })));
    assert_eq!(balance(&h, &holder).await, 8);
}

#[tokio::test]
async fn stale_snapshot_is_rejected() {
    let h = harness("stale_snapshot.wal");
    let rid = space(&h.engine).await;
    let original = book(&h.engine, rid, guest(), T0, T0 + H).await;
    h.engine.start_preparing(&original).await.unwrap();

    let result = h.engine.start_preparing(&original).await;
    // Guards run before the version check: the stored booking is already
    // preparing, so the repeat is an illegal transition.
    assert!(matches!(result, Err(EngineError::IllegalStateTransition { .. })));

    let result = h.engine.cancel(&original).await;
    assert!(matches!(
        result,
        Err(EngineError::StaleBooking {
            seen: 0,
            current: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn return_with_damage_sends_resource_to_maintenance() {
    let h = harness_with(
        test_wal_path("damage_return.wal"),
        Arc::new(ConditionThreshold::default()),
    );
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + H).await;
    let b = hand_over(&h.engine, b).await;

    let b = h
        .engine
        .process_return(&b, Condition::Damaged, Some("cracked cymbal".into()))
        .await
        .unwrap();
    assert_eq!(b.state, BookingState::Returned);

    let info = h.engine.get_resource_info(rid).await.unwrap();
    assert_eq!(info.status, OperationalStatus::Maintenance);
    assert_eq!(info.condition, Some(Condition::Damaged));
    assert!(!h.engine.is_available(rid, Span::new(T0 + 2 * H, T0 + 3 * H)).await.unwrap());
}

#[tokio::test]
async fn process_return_before_checkout_is_illegal() {
    let h = harness("early_return.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + H).await;
    let result = h.engine.process_return(&b, Condition::Good, None).await;
    assert!(matches!(
        result,
        Err(EngineError::IllegalStateTransition {
            to: BookingState::Returned,
            ..
        })
    ));
}

// ── Walk-up checkout ─────────────────────────────────────

#[tokio::test]
async fn checkout_to_member_lands_checked_out() {
    let h = harness("walk_up.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 8).await;

    let b = h
        .engine
        .checkout_to_member(rid, holder.clone(), T0 + 3 * H, Condition::Excellent, BookingTerms::default())
        .await
        .unwrap();
    assert_eq!(b.state, BookingState::CheckedOut);
    assert_eq!(b.span, Span::new(T0, T0 + 3 * H));
    assert_eq!(b.checked_out_at, Some(T0));
    assert_eq!(b.condition_out, Some(Condition::Excellent));
    assert_eq!(balance(&h, &holder).await, 2);
}

#[tokio::test]
async fn checkout_to_member_blocked_by_future_reservation() {
    let h = harness("walk_up_blocked.wal");
    let rid = space(&h.engine).await;
    let reserved = book(&h.engine, rid, guest(), T0 + 2 * H, T0 + 4 * H).await;

    let result = h
        .engine
        .checkout_to_member(rid, guest(), T0 + 3 * H, Condition::Good, BookingTerms::default())
        .await;
    match result {
        Err(EngineError::SchedulingConflict { conflicting, .. }) => {
            assert_eq!(conflicting, reserved.id)
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    h.engine
        .checkout_to_member(rid, guest(), T0 + 2 * H, Condition::Good, BookingTerms::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn checkout_to_member_due_in_past_rejected() {
    let h = harness("walk_up_past.wal");
    let rid = space(&h.engine).await;
    let result = h
        .engine
        .checkout_to_member(rid, guest(), T0 - H, Condition::Good, BookingTerms::default())
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInterval(_))));
}

#[tokio::test]
async fn unreturned_overdue_gear_blocks_walk_up_checkout() {
    let h = harness("walk_up_overdue.wal");
    let rid = space(&h.engine).await;
    let first = h
        .engine
        .checkout_to_member(rid, guest(), T0 + 2 * H, Condition::Good, BookingTerms::default())
        .await
        .unwrap();

    h.clock.set(T0 + 5 * H);
    assert_eq!(h.engine.mark_overdue().await.marked, 1);
    let first = h.engine.get_booking(first.id).await.unwrap();
    assert_eq!(first.state, BookingState::Overdue);

    let result = h
        .engine
        .checkout_to_member(rid, guest(), T0 + 8 * H, Condition::Good, BookingTerms::default())
        .await;
    match result {
        Err(EngineError::SchedulingConflict { conflicting, .. }) => {
            assert_eq!(conflicting, first.id)
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(!h.engine.is_available(rid, Span::new(T0 + 5 * H, T0 + 6 * H)).await.unwrap());
    // Later reservations stay open while the gear is out.
    book(&h.engine, rid, guest(), T0 + 6 * H, T0 + 7 * H).await;

    h.engine.process_return(&first, Condition::Good, None).await.unwrap();
    let second = h
        .engine
        .checkout_to_member(rid, guest(), T0 + 6 * H, Condition::Good, BookingTerms::default())
        .await
        .unwrap();
    assert_eq!(second.state, BookingState::CheckedOut);
}

// ── Reschedule ───────────────────────────────────────────

#[tokio::test]
async fn reschedule_reconciles_credit_and_ignores_itself() {
    let h = harness("reschedule.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 6).await;

    let b = book(&h.engine, rid, holder.clone(), T0, T0 + 2 * H).await;
    assert_eq!(balance(&h, &holder).await, 2);

    // Overlaps its own old slot only.
    let b = h
        .engine
        .reschedule(&b, Span::new(T0 + H, T0 + 4 * H))
        .await
        .unwrap();
    assert_eq!(b.span, Span::new(T0 + H, T0 + 4 * H));
    assert_eq!(b.free_units_used, 6);
    assert_eq!(b.paid_amount, 0);
    assert_eq!(balance(&h, &holder).await, 0);

    let b = h
        .engine
        .reschedule(&b, Span::new(T0 + H, T0 + 2 * H))
        .await
        .unwrap();
    assert_eq!(b.free_units_used, 2);
    assert_eq!(balance(&h, &holder).await, 4);
    assert!(!h.engine.has_conflict(rid, Span::new(T0, T0 + H), None).await.unwrap());
}

#[tokio::test]
async fn reschedule_into_another_booking_conflicts() {
    let h = harness("reschedule_conflict.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 8).await;
    let a = book(&h.engine, rid, holder.clone(), T0, T0 + H).await;
    let other = book(&h.engine, rid, guest(), T0 + 2 * H, T0 + 3 * H).await;

    let result = h.engine.reschedule(&a, Span::new(T0 + H, T0 + 3 * H)).await;
    assert!(matches!(
        result,
        Err(EngineError::SchedulingConflict { conflicting, .. }) if conflicting == other.id
    ));
    assert_eq!(balance(&h, &holder).await, 6);
    assert_eq!(h.engine.get_booking(a.id).await.unwrap().span, a.span);
}

#[tokio::test]
async fn reschedule_after_checkout_refused() {
    let h = harness("reschedule_checked_out.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + H).await;
    let b = hand_over(&h.engine, b).await;
    let result = h.engine.reschedule(&b, Span::new(T0, T0 + 2 * H)).await;
    assert!(matches!(result, Err(EngineError::CannotRescheduleAfterCheckout(_))));
}

// ── Overdue ──────────────────────────────────────────────

#[tokio::test]
async fn checked_out_past_due_is_overdue() {
    let h = harness("overdue_predicate.wal");
    let rid = space(&h.engine).await;
    let b = book(&h.engine, rid, guest(), T0, T0 + 2 * H).await;
    let b = hand_over(&h.engine, b).await;
    assert!(!b.is_overdue(h.engine.now()));

    h.clock.set(T0 + 2 * H + 3 * DAY_MS + 5 * H);
    let now = h.engine.now();
    assert!(b.is_overdue(now));
    assert_eq!(b.days_overdue(now), 3);

    let listed = h.engine.overdue_bookings().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, b.id);
}

#[tokio::test]
async fn overdue_sweep_is_idempotent() {
    let h = harness("overdue_sweep.wal");
    let rid = space(&h.engine).await;
    let late = book(&h.engine, rid, guest(), T0, T0 + H).await;
    let late = hand_over(&h.engine, late).await;
    let on_time = book(&h.engine, rid, guest(), T0 + 2 * DAY_MS, T0 + 3 * DAY_MS).await;

    h.clock.advance(DAY_MS);
    let first = h.engine.mark_overdue().await;
    assert_eq!(
        first,
        OverdueSweep {
            marked: 1,
            already_overdue: 0,
            failed: 0
        }
    );
    let second = h.engine.mark_overdue().await;
    assert_eq!(second.marked, 0);
    assert_eq!(second.already_overdue, 1);

    let late = h.engine.get_booking(late.id).await.unwrap();
    assert_eq!(late.state, BookingState::Overdue);
    assert!(late.is_overdue(h.engine.now()));
    assert_eq!(
        h.engine.get_booking(on_time.id).await.unwrap().state,
        BookingState::Requested
    );

    // Overdue gear still comes back through the normal chain.
    let back = h
        .engine
        .process_return(&late, Condition::Good, None)
        .await
        .unwrap();
    assert_eq!(back.state, BookingState::Returned);
    assert!(!back.is_overdue(h.engine.now()));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn bookings_on_date_and_for_holder() {
    let h = harness("date_holder.wal");
    let rid = space(&h.engine).await;
    let holder = subscriber(&h, 0).await;
    let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();

    book(&h.engine, rid, holder.clone(), T0 + 20 * H, T0 + 26 * H).await;
    book(&h.engine, rid, guest(), T0 + 30 * H, T0 + 31 * H).await;
    let cancelled = book(&h.engine, rid, holder.clone(), T0 + H, T0 + 2 * H).await;
    h.engine.cancel(&cancelled).await.unwrap();

    let on_day = h.engine.bookings_on_date(rid, date).await.unwrap();
    assert_eq!(on_day.len(), 2);

    let mine = h.engine.active_bookings_for_holder(&holder).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].span.start, T0 + 20 * H);
}

#[tokio::test]
async fn find_available_resources_filters_kind_category_and_conflicts() {
    let h = harness("find_available.wal");
    let mut amp_a = ResourceInfo::new(Ulid::new(), ResourceKind::Equipment);
    amp_a.category = Some("amps".into());
    let mut amp_b = ResourceInfo::new(Ulid::new(), ResourceKind::Equipment);
    amp_b.category = Some("amps".into());
    let mut mic = ResourceInfo::new(Ulid::new(), ResourceKind::Equipment);
    mic.category = Some("mics".into());
    let room = ResourceInfo::new(Ulid::new(), ResourceKind::Space);
    for info in [&amp_a, &amp_b, &mic, &room] {
        h.engine.create_resource(info.clone()).await.unwrap();
    }
    book(&h.engine, amp_a.id, guest(), T0, T0 + 2 * H).await;

    let span = Span::new(T0 + H, T0 + 3 * H);
    let amps = h
        .engine
        .find_available_resources(ResourceKind::Equipment, Some("amps"), span)
        .await;
    assert_eq!(amps.iter().map(|r| r.id).collect::<Vec<_>>(), vec![amp_b.id]);

    let equipment = h
        .engine
        .find_available_resources(ResourceKind::Equipment, None, span)
        .await;
    assert_eq!(equipment.len(), 2);
}

#[tokio::test]
async fn free_windows_around_bookings() {
    let h = harness("free_windows.wal");
    let rid = space(&h.engine).await;
    book(&h.engine, rid, guest(), T0 + 2 * H, T0 + 3 * H).await;
    book(&h.engine, rid, guest(), T0 + 3 * H, T0 + 5 * H).await;

    let free = h
        .engine
        .free_windows(rid, Span::new(T0, T0 + 8 * H), None)
        .await
        .unwrap();
    assert_eq!(
        free,
        vec![Span::new(T0, T0 + 2 * H), Span::new(T0 + 5 * H, T0 + 8 * H)]
    );

    let long = h
        .engine
        .free_windows(rid, Span::new(T0, T0 + 8 * H), Some(150 * M))
        .await
        .unwrap();
    assert_eq!(long, vec![Span::new(T0 + 5 * H, T0 + 8 * H)]);
}

// ── Borrowed gear ────────────────────────────────────────

#[tokio::test]
async fn borrowed_gear_goes_back_to_owner() {
    let h = harness("owner_return.wal");
    let mut info = ResourceInfo::new(Ulid::new(), ResourceKind::Equipment);
    info.ownership = Ownership::OnLoan {
        owner: "Riley".into(),
        return_due: Some(T0 + DAY_MS),
    };
    let rid = info.id;
    h.engine.create_resource(info).await.unwrap();
    let owned = space(&h.engine).await;

    assert!(h.engine.resources_needing_return().await.is_empty());
    h.clock.advance(2 * DAY_MS);
    let due = h.engine.resources_needing_return().await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, rid);

    let b = h
        .engine
        .checkout_to_member(rid, guest(), h.engine.now() + H, Condition::Good, BookingTerms::default())
        .await
        .unwrap();
    assert!(matches!(
        h.engine.mark_returned_to_owner(rid).await,
        Err(EngineError::HasActiveBookings(_))
    ));
    h.engine.process_return(&b, Condition::Good, None).await.unwrap();

    let info = h.engine.mark_returned_to_owner(rid).await.unwrap();
    assert!(!info.loanable);
    assert!(matches!(info.ownership, Ownership::ReturnedToOwner { ref owner, .. } if owner == "Riley"));
    assert!(h.engine.resources_needing_return().await.is_empty());

    assert!(matches!(
        h.engine.mark_returned_to_owner(owned).await,
        Err(EngineError::NotOnLoan(_))
    ));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn transitions_are_broadcast() {
    let h = harness("broadcast.wal");
    let rid = space(&h.engine).await;
    let mut rx = h.engine.notify.subscribe(rid);

    let b = book(&h.engine, rid, guest(), T0, T0 + H).await;
    let b = hand_over(&h.engine, b).await;
    h.engine.process_return(&b, Condition::Good, None).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], Event::BookingCreated { .. }));
    assert!(seen.iter().any(|e| matches!(e, Event::BookingCheckedOut { .. })));
    assert!(matches!(seen.last(), Some(Event::BookingReturned { .. })));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (rid, returned_id, open_id) = {
        let h = harness_with(path.clone(), Arc::new(ConditionThreshold::default()));
        let rid = space(&h.engine).await;
        let b = book(&h.engine, rid, guest(), T0, T0 + H).await;
        let open = book(&h.engine, rid, guest(), T0 + 2 * H, T0 + 3 * H).await;
        let open = h
            .engine
            .reschedule(&open, Span::new(T0 + 4 * H, T0 + 5 * H))
            .await
            .unwrap();
        let b = hand_over(&h.engine, b).await;
        h.engine
            .process_return(&b, Condition::Damaged, None)
            .await
            .unwrap();
        (rid, b.id, open.id)
    };

    let h = harness_with(path, Arc::new(NoAssessment));
    let info = h.engine.get_resource_info(rid).await.unwrap();
    assert_eq!(info.status, OperationalStatus::Maintenance);
    assert_eq!(info.condition, Some(Condition::Damaged));

    let returned = h.engine.get_booking(returned_id).await.unwrap();
    assert_eq!(returned.state, BookingState::Returned);
    assert_eq!(returned.condition_in, Some(Condition::Damaged));
    let open = h.engine.get_booking(open_id).await.unwrap();
    assert_eq!(open.span, Span::new(T0 + 4 * H, T0 + 5 * H));
    assert_eq!(open.version, 1);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let (rid, kept) = {
        let h = harness_with(path.clone(), Arc::new(NoAssessment));
        let rid = space(&h.engine).await;
        for i in 0..5 {
            let b = book(&h.engine, rid, guest(), T0 + i * H, T0 + i * H + 30 * M).await;
            h.engine.cancel(&b).await.unwrap();
        }
        let kept = book(&h.engine, rid, guest(), T0 + 10 * H, T0 + 11 * H).await;
        let kept = h.engine.start_preparing(&kept).await.unwrap();
        assert!(h.engine.wal_appends_since_compact().await >= 12);

        h.engine.compact_wal().await.unwrap();
        assert_eq!(h.engine.wal_appends_since_compact().await, 0);
        (rid, kept)
    };

    let h = harness_with(path, Arc::new(NoAssessment));
    let bookings = h.engine.bookings_for_resource(rid).await.unwrap();
    assert_eq!(bookings.len(), 6);
    assert_eq!(h.engine.get_booking(kept.id).await.unwrap(), kept);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resources_created_during_compaction_survive_restart() {
    let path = test_wal_path("compaction_race.wal");
    let created = {
        let engine = Arc::new(harness_with(path.clone(), Arc::new(NoAssessment)).engine);
        space(&engine).await;

        let compactor = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    engine.compact_wal().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let creators: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let mut ids = Vec::new();
                    for _ in 0..10 {
                        ids.push(space(&engine).await);
                    }
                    ids
                })
            })
            .collect();

        let mut created = Vec::new();
        for task in creators {
            created.extend(task.await.unwrap());
        }
        compactor.await.unwrap();
        created
    };

    let h = harness_with(path, Arc::new(NoAssessment));
    assert_eq!(h.engine.list_resources().await.len(), created.len() + 1);
    for id in created {
        assert!(h.engine.get_resource_info(id).await.is_some());
    }
}

#[tokio::test]
async fn duplicate_resource_rejected() {
    let h = harness("duplicate_resource.wal");
    let rid = space(&h.engine).await;
    let result = h
        .engine
        .create_resource(ResourceInfo::new(rid, ResourceKind::Space))
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(id)) if id == rid));
    assert_eq!(h.engine.list_resources().await.len(), 1);
}

#[tokio::test]
async fn oversized_notes_rejected() {
    let h = harness("oversized_notes.wal");
    let rid = space(&h.engine).await;
    let terms = BookingTerms {
        notes: Some("x".repeat(crate::limits::MAX_NOTES_LEN + 1)),
        ..BookingTerms::default()
    };
    let result = h
        .engine
        .create_booking(rid, guest(), Span::new(T0, T0 + H), terms)
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}
