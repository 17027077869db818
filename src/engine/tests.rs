use super::*;
use crate::time::at;
use chrono::NaiveDateTime;

const H: Minute = 60;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("drivetime_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

/// 2026-03-02 is a Monday.
fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
}

fn dt(day: u32, minutes: Minute) -> NaiveDateTime {
    at(d(day), minutes)
}

async fn instructor_with_hours(engine: &Engine, days: &[u8], start: Minute, end: Minute) -> Ulid {
    let iid = Ulid::new();
    engine.register_instructor(InstructorProfile::new(iid)).await.unwrap();
    for &dow in days {
        engine
            .add_availability(Ulid::new(), iid, BlockSpec { day_of_week: dow, start, end })
            .await
            .unwrap();
    }
    iid
}

fn lesson(instructor_id: Ulid, student_id: Ulid, day: u32, start: Minute, end: Minute) -> NewBooking {
    NewBooking {
        id: Ulid::new(),
        instructor_id,
        student_id,
        vehicle_id: None,
        start: dt(day, start),
        end: dt(day, end),
        buffer_after: None,
        cost_cents: None,
    }
}

fn slot_query(instructor_id: Option<Ulid>, from: u32, to: u32, duration: u32) -> SlotQuery {
    SlotQuery {
        instructor_id,
        vehicle_id: None,
        student_id: None,
        start_date: d(from),
        end_date: d(to),
        duration,
    }
}

fn weekly_pattern(instructor_id: Ulid, student_id: Ulid, days: Vec<u8>, max: u32) -> RecurrencePattern {
    RecurrencePattern {
        id: Ulid::new(),
        student_id,
        instructor_id,
        vehicle_id: None,
        recurrence: RecurrenceType::Weekly,
        days_of_week: days,
        time_of_day: 16 * H,
        duration: 60,
        cost_cents: Some(5000),
        start_date: d(2),
        end_date: None,
        max_occurrences: Some(max),
        active: true,
    }
}

fn kinds(conflicts: &[Conflict]) -> Vec<ConflictKind> {
    conflicts.iter().map(|c| c.kind).collect()
}

// ── Instructors & availability ───────────────────────────

#[tokio::test]
async fn register_instructor_twice_rejected() {
    let engine = new_engine("register_twice.wal");
    let iid = Ulid::new();
    engine.register_instructor(InstructorProfile::new(iid)).await.unwrap();
    let err = engine.register_instructor(InstructorProfile::new(iid)).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == iid));
}

#[tokio::test]
async fn availability_for_unknown_instructor() {
    let engine = new_engine("availability_unknown.wal");
    let missing = Ulid::new();
    let err = engine
        .add_availability(Ulid::new(), missing, BlockSpec { day_of_week: 1, start: 9 * H, end: 12 * H })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));
}

#[tokio::test]
async fn invalid_block_rejected() {
    let engine = new_engine("invalid_block.wal");
    let iid = instructor_with_hours(&engine, &[], 0, 0).await;
    for spec in [
        BlockSpec { day_of_week: 7, start: 9 * H, end: 10 * H },
        BlockSpec { day_of_week: 1, start: 10 * H, end: 9 * H },
        BlockSpec { day_of_week: 1, start: 23 * H, end: 25 * H },
    ] {
        let err = engine.add_availability(Ulid::new(), iid, spec).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)), "{spec:?}");
    }
}

#[tokio::test]
async fn deactivated_block_opens_nothing() {
    let engine = new_engine("deactivate_block.wal");
    let iid = Ulid::new();
    engine.register_instructor(InstructorProfile::new(iid)).await.unwrap();
    let block = engine
        .add_availability(Ulid::new(), iid, BlockSpec { day_of_week: 1, start: 9 * H, end: 12 * H })
        .await
        .unwrap();

    assert_eq!(engine.deactivate_availability(block.id).await.unwrap(), iid);
    assert!(engine.find_slots(&slot_query(Some(iid), 2, 2, 60)).await.unwrap().is_empty());
    assert!(engine.instructor_schedule(iid).await.unwrap().is_empty());

    let missing = Ulid::new();
    assert!(matches!(
        engine.deactivate_availability(missing).await,
        Err(EngineError::NotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn weekly_schedule_replaces_blocks() {
    let engine = new_engine("weekly_schedule.wal");
    let iid = instructor_with_hours(&engine, &[1, 2, 3], 9 * H, 17 * H).await;

    let blocks = engine
        .set_weekly_schedule(
            iid,
            &[
                BlockSpec { day_of_week: 4, start: 13 * H, end: 18 * H },
                BlockSpec { day_of_week: 4, start: 8 * H, end: 12 * H },
            ],
        )
        .await
        .unwrap();
    assert_eq!(blocks.len(), 2);

    let schedule = engine.instructor_schedule(iid).await.unwrap();
    let summary: Vec<(u8, Minute)> = schedule.iter().map(|b| (b.day_of_week, b.span.start)).collect();
    assert_eq!(summary, vec![(4, 8 * H), (4, 13 * H)]);
    // Monday is gone.
    assert!(engine.find_slots(&slot_query(Some(iid), 2, 2, 60)).await.unwrap().is_empty());
}

// ── Slot search ──────────────────────────────────────────

#[tokio::test]
async fn slots_respect_bookings_and_buffer() {
    let engine = new_engine("slots_buffer.wal");
    engine
        .update_settings(SettingsPatch {
            buffer_between_lessons: Some(60),
            ..Default::default()
        })
        .await
        .unwrap();
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 12 * H).await;
    engine
        .book_lesson(lesson(iid, Ulid::new(), 2, 10 * H, 10 * H + 30))
        .await
        .unwrap();

    // Busy 10:00-11:30 once the buffer is added.
    let hour = engine.find_slots(&slot_query(Some(iid), 2, 2, 60)).await.unwrap();
    assert_eq!(hour.len(), 1);
    assert_eq!(hour[0].start, dt(2, 9 * H));
    assert_eq!(hour[0].end, dt(2, 10 * H));
    assert_eq!(hour[0].duration, 60);

    let half: Vec<NaiveDateTime> = engine
        .find_slots(&slot_query(Some(iid), 2, 2, 30))
        .await
        .unwrap()
        .iter()
        .map(|s| s.start)
        .collect();
    assert_eq!(half, vec![dt(2, 9 * H), dt(2, 11 * H + 30)]);
}

#[tokio::test]
async fn booking_buffer_override_wins() {
    let engine = new_engine("slots_override.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 12 * H).await;
    let mut req = lesson(iid, Ulid::new(), 2, 9 * H, 10 * H);
    req.buffer_after = Some(0);
    engine.book_lesson(req).await.unwrap();

    let slots = engine.find_slots(&slot_query(Some(iid), 2, 2, 120)).await.unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].start, dt(2, 10 * H));
}

#[tokio::test]
async fn slots_ordered_by_date_then_instructor() {
    let engine = new_engine("slots_order.wal");
    let a = Ulid::from_parts(1, 1);
    let b = Ulid::from_parts(1, 2);
    // Register out of order; the search still walks ids in order.
    for iid in [b, a] {
        engine.register_instructor(InstructorProfile::new(iid)).await.unwrap();
        for dow in [1, 2] {
            engine
                .add_availability(Ulid::new(), iid, BlockSpec { day_of_week: dow, start: 9 * H, end: 10 * H })
                .await
                .unwrap();
        }
    }

    let slots = engine.find_slots(&slot_query(None, 2, 3, 60)).await.unwrap();
    let order: Vec<(NaiveDate, Ulid)> = slots.iter().map(|s| (s.date, s.instructor_id)).collect();
    assert_eq!(order, vec![(d(2), a), (d(2), b), (d(3), a), (d(3), b)]);
}

#[tokio::test]
async fn inactive_instructor_skipped_in_open_search() {
    let engine = new_engine("slots_inactive.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 12 * H).await;
    let mut profile = engine.get_instructor(iid).await.unwrap();
    profile.active = false;
    engine.update_instructor(profile).await.unwrap();

    assert!(engine.find_slots(&slot_query(None, 2, 2, 60)).await.unwrap().is_empty());
    // Asking for them by id still answers.
    assert_eq!(engine.find_slots(&slot_query(Some(iid), 2, 2, 60)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn all_day_absence_removes_the_day() {
    let engine = new_engine("slots_absence.wal");
    let iid = instructor_with_hours(&engine, &[1, 2], 9 * H, 12 * H).await;
    engine
        .record_absence(AbsencePeriod::new(iid, d(2), d(2), AbsenceWindow::AllDay, AbsenceReason::Sick))
        .await
        .unwrap();

    let slots = engine.find_slots(&slot_query(Some(iid), 2, 3, 60)).await.unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].date, d(3));
}

#[tokio::test]
async fn bounded_absence_splits_the_window() {
    let engine = new_engine("slots_bounded_absence.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 13 * H).await;
    let absence = AbsencePeriod::new(
        iid,
        d(2),
        d(2),
        AbsenceWindow::Bounded(Span::new(10 * H, 12 * H)),
        AbsenceReason::Personal,
    );
    let absence_id = absence.id;
    engine.record_absence(absence).await.unwrap();

    let starts: Vec<NaiveDateTime> = engine
        .find_slots(&slot_query(Some(iid), 2, 2, 60))
        .await
        .unwrap()
        .iter()
        .map(|s| s.start)
        .collect();
    assert_eq!(starts, vec![dt(2, 9 * H), dt(2, 12 * H)]);

    engine.remove_absence(absence_id).await.unwrap();
    assert!(engine.absences_between(iid, d(1), d(31)).await.unwrap().is_empty());
    assert_eq!(engine.find_slots(&slot_query(Some(iid), 2, 2, 240)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn slot_search_input_errors() {
    let engine = new_engine("slots_errors.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 12 * H).await;

    assert!(matches!(
        engine.find_slots(&slot_query(Some(iid), 2, 2, 0)).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.find_slots(&slot_query(Some(iid), 5, 2, 60)).await,
        Err(EngineError::InvalidInput(_))
    ));
    let missing = Ulid::new();
    assert!(matches!(
        engine.find_slots(&slot_query(Some(missing), 2, 2, 60)).await,
        Err(EngineError::NotFound(id)) if id == missing
    ));

    let mut wide = slot_query(Some(iid), 2, 2, 60);
    wide.end_date = NaiveDate::from_ymd_opt(2027, 6, 1).unwrap();
    assert!(matches!(engine.find_slots(&wide).await, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn preferred_vehicle_attached_to_slots() {
    let engine = new_engine("slots_vehicle.wal");
    let vid = Ulid::new();
    let iid = Ulid::new();
    engine
        .register_instructor(InstructorProfile {
            default_vehicle_id: Some(vid),
            prefers_own_vehicle: true,
            ..InstructorProfile::new(iid)
        })
        .await
        .unwrap();
    engine
        .add_availability(Ulid::new(), iid, BlockSpec { day_of_week: 1, start: 9 * H, end: 10 * H })
        .await
        .unwrap();

    let slots = engine.find_slots(&slot_query(Some(iid), 2, 2, 60)).await.unwrap();
    assert_eq!(slots[0].vehicle_id, Some(vid));

    let other = Ulid::new();
    let mut query = slot_query(Some(iid), 2, 2, 60);
    query.vehicle_id = Some(other);
    assert_eq!(engine.find_slots(&query).await.unwrap()[0].vehicle_id, Some(other));
}

// ── Conflict detection ───────────────────────────────────

#[tokio::test]
async fn detect_reports_soft_conflicts() {
    let engine = new_engine("detect_soft.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let student = Ulid::new();
    let existing = engine.book_lesson(lesson(iid, student, 2, 10 * H, 11 * H)).await.unwrap();

    let proposal = |start, end| Proposal {
        instructor_id: iid,
        student_id: Ulid::new(),
        vehicle_id: None,
        start: dt(2, start),
        end: dt(2, end),
        exclude_booking_id: None,
    };

    // Five minutes after the lesson ends, inside the 15 minute buffer.
    let tight = engine.detect_conflicts(&proposal(11 * H + 5, 12 * H)).await.unwrap();
    assert_eq!(kinds(&tight), vec![ConflictKind::BufferViolation]);
    assert_eq!(tight[0].record, Some(ConflictRecord::Booking(existing.id)));

    let late = engine.validate(&proposal(17 * H, 18 * H)).await.unwrap();
    assert!(!late.valid);
    assert_eq!(kinds(&late.conflicts), vec![ConflictKind::OutsideWorkingHours]);

    assert!(engine.validate(&proposal(13 * H, 14 * H)).await.unwrap().valid);
}

#[tokio::test]
async fn detect_reports_every_party() {
    let engine = new_engine("detect_parties.wal");
    let a = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let b = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let vid = Ulid::new();
    engine
        .register_vehicle(VehicleProfile {
            id: vid,
            ownership: VehicleOwnership::SchoolOwned,
            owner_instructor_id: None,
        })
        .await
        .unwrap();
    let student = Ulid::new();
    let mut req = lesson(a, student, 2, 10 * H, 11 * H);
    req.vehicle_id = Some(vid);
    engine.book_lesson(req).await.unwrap();

    let conflicts = engine
        .detect_conflicts(&Proposal {
            instructor_id: b,
            student_id: student,
            vehicle_id: Some(vid),
            start: dt(2, 10 * H + 30),
            end: dt(2, 11 * H + 30),
            exclude_booking_id: None,
        })
        .await
        .unwrap();
    assert_eq!(kinds(&conflicts), vec![ConflictKind::VehicleBusy, ConflictKind::StudentBusy]);
}

#[tokio::test]
async fn detect_rejects_bad_proposals() {
    let engine = new_engine("detect_errors.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let base = Proposal {
        instructor_id: iid,
        student_id: Ulid::new(),
        vehicle_id: None,
        start: dt(2, 11 * H),
        end: dt(2, 10 * H),
        exclude_booking_id: None,
    };
    assert!(matches!(engine.detect_conflicts(&base).await, Err(EngineError::InvalidInput(_))));

    let missing_vehicle = Ulid::new();
    let unknown_vehicle = Proposal {
        vehicle_id: Some(missing_vehicle),
        end: dt(2, 12 * H),
        ..base.clone()
    };
    assert!(matches!(
        engine.detect_conflicts(&unknown_vehicle).await,
        Err(EngineError::NotFound(id)) if id == missing_vehicle
    ));

    // Thirty seconds truncates to an empty minute span.
    let sub_minute = Proposal {
        start: dt(2, 10 * H),
        end: dt(2, 10 * H) + chrono::Duration::seconds(30),
        ..base.clone()
    };
    assert!(matches!(
        engine.detect_conflicts(&sub_minute).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(engine.validate(&sub_minute).await, Err(EngineError::InvalidInput(_))));

    let mut short_lesson = lesson(iid, Ulid::new(), 2, 10 * H, 10 * H);
    short_lesson.end = short_lesson.start + chrono::Duration::seconds(30);
    assert!(matches!(
        engine.book_lesson(short_lesson).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(engine.bookings_on(iid, d(2)).await.unwrap().is_empty());

    let booked = engine.book_lesson(lesson(iid, Ulid::new(), 2, 13 * H, 14 * H)).await.unwrap();
    assert!(matches!(
        engine
            .reschedule_booking(booked.id, dt(2, 15 * H), dt(2, 15 * H) + chrono::Duration::seconds(59))
            .await,
        Err(EngineError::InvalidInput(_))
    ));
}

// ── Bookings ─────────────────────────────────────────────

#[tokio::test]
async fn double_booking_rejected() {
    let engine = new_engine("double_booking.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    engine.book_lesson(lesson(iid, Ulid::new(), 2, 10 * H, 11 * H)).await.unwrap();

    let err = engine
        .book_lesson(lesson(iid, Ulid::new(), 2, 10 * H + 30, 11 * H + 30))
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(conflicts) => assert_eq!(kinds(&conflicts), vec![ConflictKind::InstructorBusy]),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(engine.bookings_on(iid, d(2)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn student_cannot_be_in_two_cars() {
    let engine = new_engine("student_two_cars.wal");
    let a = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let b = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let student = Ulid::new();
    engine.book_lesson(lesson(a, student, 2, 10 * H, 11 * H)).await.unwrap();

    let err = engine.book_lesson(lesson(b, student, 2, 10 * H, 11 * H)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(c) if kinds(&c) == vec![ConflictKind::StudentBusy]));
    assert_eq!(engine.student_bookings_on(student, d(2)).await.len(), 1);
}

#[tokio::test]
async fn back_to_back_lessons_commit() {
    let engine = new_engine("back_to_back.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    engine.book_lesson(lesson(iid, Ulid::new(), 2, 10 * H, 11 * H)).await.unwrap();
    // Touching, not overlapping. The buffer is advisory.
    engine.book_lesson(lesson(iid, Ulid::new(), 2, 11 * H, 12 * H)).await.unwrap();

    let day = engine.bookings_on(iid, d(2)).await.unwrap();
    let starts: Vec<Minute> = day.iter().map(|b| b.span.start).collect();
    assert_eq!(starts, vec![10 * H, 11 * H]);
}

#[tokio::test]
async fn owned_vehicle_not_double_checked() {
    let engine = new_engine("owned_vehicle.wal");
    let a = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let b = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let vid = Ulid::new();
    engine
        .register_vehicle(VehicleProfile {
            id: vid,
            ownership: VehicleOwnership::InstructorOwned,
            owner_instructor_id: Some(a),
        })
        .await
        .unwrap();

    for iid in [a, b] {
        let mut req = lesson(iid, Ulid::new(), 2, 10 * H, 11 * H);
        req.vehicle_id = Some(vid);
        engine.book_lesson(req).await.unwrap();
    }
}

#[tokio::test]
async fn booking_input_errors() {
    let engine = new_engine("booking_errors.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;

    let missing = Ulid::new();
    let err = engine.book_lesson(lesson(missing, Ulid::new(), 2, 10 * H, 11 * H)).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));

    let mut overnight = lesson(iid, Ulid::new(), 2, 23 * H, 24 * H);
    overnight.end = dt(3, H);
    assert!(matches!(engine.book_lesson(overnight).await, Err(EngineError::InvalidInput(_))));

    let mut huge_buffer = lesson(iid, Ulid::new(), 2, 10 * H, 11 * H);
    huge_buffer.buffer_after = Some(2000);
    assert!(matches!(engine.book_lesson(huge_buffer).await, Err(EngineError::InvalidInput(_))));

    let first = lesson(iid, Ulid::new(), 2, 13 * H, 14 * H);
    let again = NewBooking {
        start: dt(2, 15 * H),
        end: dt(2, 16 * H),
        ..first.clone()
    };
    engine.book_lesson(first).await.unwrap();
    assert!(matches!(engine.book_lesson(again).await, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn cancel_reopens_slot_and_reactivation_rechecks() {
    let engine = new_engine("cancel_reactivate.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 10 * H).await;
    let first = engine.book_lesson(lesson(iid, Ulid::new(), 2, 9 * H, 10 * H)).await.unwrap();
    assert!(engine.find_slots(&slot_query(Some(iid), 2, 2, 60)).await.unwrap().is_empty());

    let cancelled = engine.cancel_booking(first.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(engine.find_slots(&slot_query(Some(iid), 2, 2, 60)).await.unwrap().len(), 1);

    engine.book_lesson(lesson(iid, Ulid::new(), 2, 9 * H, 10 * H)).await.unwrap();
    let err = engine
        .set_booking_status(first.id, BookingStatus::Scheduled)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(engine.get_booking(first.id).await.unwrap().status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn completed_and_no_show_statuses() {
    let engine = new_engine("statuses.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let a = engine.book_lesson(lesson(iid, Ulid::new(), 2, 9 * H, 10 * H)).await.unwrap();
    let b = engine.book_lesson(lesson(iid, Ulid::new(), 2, 11 * H, 12 * H)).await.unwrap();

    assert_eq!(engine.complete_booking(a.id).await.unwrap().status, BookingStatus::Completed);
    assert_eq!(engine.mark_no_show(b.id).await.unwrap().status, BookingStatus::NoShow);

    // A completed lesson still holds its time, a no-show does not.
    let slots: Vec<NaiveDateTime> = engine
        .find_slots(&slot_query(Some(iid), 2, 2, 60))
        .await
        .unwrap()
        .iter()
        .map(|s| s.start)
        .collect();
    assert!(!slots.contains(&dt(2, 9 * H)));
    assert!(slots.contains(&dt(2, 10 * H + 15)));

    let missing = Ulid::new();
    assert!(matches!(engine.cancel_booking(missing).await, Err(EngineError::NotFound(id)) if id == missing));
}

#[tokio::test]
async fn reschedule_ignores_itself() {
    let engine = new_engine("reschedule_self.wal");
    let iid = instructor_with_hours(&engine, &[1, 2], 9 * H, 17 * H).await;
    let student = Ulid::new();
    let booking = engine.book_lesson(lesson(iid, student, 2, 10 * H, 11 * H)).await.unwrap();

    let moved = engine
        .reschedule_booking(booking.id, dt(2, 10 * H + 30), dt(2, 11 * H + 30))
        .await
        .unwrap();
    assert_eq!(moved.span, Span::new(10 * H + 30, 11 * H + 30));

    let next_day = engine
        .reschedule_booking(booking.id, dt(3, 14 * H), dt(3, 15 * H + 30))
        .await
        .unwrap();
    assert_eq!(next_day.date, d(3));
    assert_eq!(next_day.duration, 90);
    assert!(engine.bookings_on(iid, d(2)).await.unwrap().is_empty());
    assert!(engine.student_bookings_on(student, d(2)).await.is_empty());
    assert_eq!(engine.get_booking(booking.id).await.unwrap().date, d(3));
}

#[tokio::test]
async fn reschedule_into_another_lesson_rejected() {
    let engine = new_engine("reschedule_conflict.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let a = engine.book_lesson(lesson(iid, Ulid::new(), 2, 9 * H, 10 * H)).await.unwrap();
    engine.book_lesson(lesson(iid, Ulid::new(), 2, 13 * H, 14 * H)).await.unwrap();

    let err = engine
        .reschedule_booking(a.id, dt(2, 13 * H + 30), dt(2, 14 * H + 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(engine.get_booking(a.id).await.unwrap().span, Span::new(9 * H, 10 * H));
}

#[tokio::test]
async fn concurrent_bookings_for_one_slot() {
    let engine = Arc::new(new_engine("concurrent_slot.wal"));
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.book_lesson(lesson(iid, Ulid::new(), 2, 10 * H, 11 * H)).await
        }));
    }
    let mut committed = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            committed += 1;
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(engine.bookings_on(iid, d(2)).await.unwrap().len(), 1);
}

// ── Settings ─────────────────────────────────────────────

#[tokio::test]
async fn settings_patch_merges_over_defaults() {
    let engine = new_engine("settings_patch.wal");
    assert_eq!(engine.settings().await, SchedulingSettings::default());

    let updated = engine
        .update_settings(SettingsPatch {
            buffer_between_lessons: Some(30),
            allow_back_to_back_lessons: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(updated.buffer_between_lessons, 30);
    assert!(updated.allow_back_to_back_lessons);
    assert_eq!(updated.default_lesson_duration, 60);
    assert_eq!(engine.settings().await, updated);

    assert!(matches!(
        engine.update_settings(SettingsPatch::default()).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine
            .update_settings(SettingsPatch {
                buffer_between_lessons: Some(-5),
                ..Default::default()
            })
            .await,
        Err(EngineError::InvalidInput(_))
    ));
    assert_eq!(engine.settings().await.buffer_between_lessons, 30);
}

#[tokio::test]
async fn back_to_back_setting_silences_buffer_warning() {
    let engine = new_engine("settings_back_to_back.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    engine.book_lesson(lesson(iid, Ulid::new(), 2, 10 * H, 11 * H)).await.unwrap();
    engine
        .update_settings(SettingsPatch {
            allow_back_to_back_lessons: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();

    let conflicts = engine
        .detect_conflicts(&Proposal {
            instructor_id: iid,
            student_id: Ulid::new(),
            vehicle_id: None,
            start: dt(2, 11 * H),
            end: dt(2, 12 * H),
            exclude_booking_id: None,
        })
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}

// ── Recurrence ───────────────────────────────────────────

#[tokio::test]
async fn weekly_pattern_materializes_with_exception() {
    let engine = new_engine("pattern_weekly.wal");
    let iid = instructor_with_hours(&engine, &[1, 3], 9 * H, 18 * H).await;
    let student = Ulid::new();
    let pattern = engine
        .create_pattern(weekly_pattern(iid, student, vec![3, 1], 4))
        .await
        .unwrap();
    assert!(engine.add_exception(pattern.id, d(4), Some("school trip".into())).await.unwrap());

    let report = engine.generate_occurrences(pattern.id).await.unwrap();
    let dates: Vec<NaiveDate> = report.created.iter().map(|c| c.booking.date).collect();
    assert_eq!(dates, vec![d(2), d(9), d(11), d(16)]);
    assert_eq!(report.exceptions_skipped, 1);
    assert_eq!(report.occurrences, 4);
    assert_eq!(report.stop, StopReason::MaxOccurrences);
    assert!(report.created.iter().all(|c| c.warnings.is_empty()));

    let links = engine.pattern_links(pattern.id).await.unwrap();
    let numbers: Vec<u32> = links.iter().map(|l| l.occurrence_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    let first = engine.get_booking(links[0].booking_id).await.unwrap();
    assert_eq!(first.pattern_id, Some(pattern.id));
    assert_eq!(first.span, Span::new(16 * H, 17 * H));
    assert_eq!(first.cost_cents, Some(5000));
    assert_eq!(engine.student_bookings_on(student, d(9)).await.len(), 1);
}

#[tokio::test]
async fn generation_is_idempotent() {
    let engine = new_engine("pattern_idempotent.wal");
    let iid = instructor_with_hours(&engine, &[1, 3], 9 * H, 18 * H).await;
    let pattern = engine
        .create_pattern(weekly_pattern(iid, Ulid::new(), vec![1, 3], 4))
        .await
        .unwrap();

    assert_eq!(engine.generate_occurrences(pattern.id).await.unwrap().created.len(), 4);
    let again = engine.generate_occurrences(pattern.id).await.unwrap();
    assert!(again.created.is_empty());
    assert_eq!(again.already_materialized, 4);
    assert_eq!(engine.pattern_links(pattern.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn late_exception_keeps_existing_bookings() {
    let engine = new_engine("pattern_late_exception.wal");
    let iid = instructor_with_hours(&engine, &[1, 3], 9 * H, 18 * H).await;
    let pattern = engine
        .create_pattern(weekly_pattern(iid, Ulid::new(), vec![1, 3], 4))
        .await
        .unwrap();
    engine.generate_occurrences(pattern.id).await.unwrap();

    assert!(engine.add_exception(pattern.id, d(4), None).await.unwrap());
    assert!(!engine.add_exception(pattern.id, d(4), Some("again".into())).await.unwrap());
    assert_eq!(engine.pattern_exceptions(pattern.id).await.unwrap().len(), 1);

    let report = engine.generate_occurrences(pattern.id).await.unwrap();
    assert!(report.created.is_empty());
    assert_eq!(engine.bookings_on(iid, d(4)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn hard_conflict_leaves_occurrence_open() {
    let engine = new_engine("pattern_hard_conflict.wal");
    let iid = instructor_with_hours(&engine, &[1, 3], 9 * H, 18 * H).await;
    let blocker = engine
        .book_lesson(lesson(iid, Ulid::new(), 9, 16 * H + 30, 17 * H + 30))
        .await
        .unwrap();
    let pattern = engine
        .create_pattern(weekly_pattern(iid, Ulid::new(), vec![1, 3], 4))
        .await
        .unwrap();

    let report = engine.generate_occurrences(pattern.id).await.unwrap();
    assert_eq!(report.created.len(), 3);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].occurrence_number, 3);
    assert_eq!(report.skipped[0].date, d(9));
    assert_eq!(kinds(&report.skipped[0].conflicts), vec![ConflictKind::InstructorBusy]);
    let numbers: Vec<u32> = engine
        .pattern_links(pattern.id)
        .await
        .unwrap()
        .iter()
        .map(|l| l.occurrence_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 4]);

    // Once the clash is gone the next run fills the hole.
    engine.cancel_booking(blocker.id).await.unwrap();
    let refill = engine.generate_occurrences(pattern.id).await.unwrap();
    assert_eq!(refill.created.len(), 1);
    assert_eq!(refill.created[0].occurrence_number, 3);
    assert_eq!(refill.already_materialized, 3);
}

#[tokio::test]
async fn soft_conflicts_become_warnings() {
    let engine = new_engine("pattern_warnings.wal");
    // Works mornings only; the pattern is in the afternoon.
    let iid = instructor_with_hours(&engine, &[1, 3], 9 * H, 12 * H).await;
    let pattern = engine
        .create_pattern(weekly_pattern(iid, Ulid::new(), vec![1], 2))
        .await
        .unwrap();

    let report = engine.generate_occurrences(pattern.id).await.unwrap();
    assert_eq!(report.created.len(), 2);
    assert!(report.skipped.is_empty());
    for created in &report.created {
        assert_eq!(kinds(&created.warnings), vec![ConflictKind::OutsideWorkingHours]);
    }
}

#[tokio::test]
async fn inactive_pattern_cannot_generate() {
    let engine = new_engine("pattern_inactive.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 18 * H).await;
    let pattern = engine
        .create_pattern(weekly_pattern(iid, Ulid::new(), vec![1], 2))
        .await
        .unwrap();

    engine.deactivate_pattern(pattern.id).await.unwrap();
    engine.deactivate_pattern(pattern.id).await.unwrap();
    assert!(!engine.get_pattern(pattern.id).await.unwrap().active);
    assert!(matches!(
        engine.generate_occurrences(pattern.id).await,
        Err(EngineError::PatternInactive(id)) if id == pattern.id
    ));
    assert!(engine.generate_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn pattern_creation_errors() {
    let engine = new_engine("pattern_errors.wal");
    let missing = Ulid::new();
    assert!(matches!(
        engine.create_pattern(weekly_pattern(missing, Ulid::new(), vec![1], 2)).await,
        Err(EngineError::NotFound(id)) if id == missing
    ));

    let iid = instructor_with_hours(&engine, &[1], 9 * H, 18 * H).await;
    let mut with_vehicle = weekly_pattern(iid, Ulid::new(), vec![1], 2);
    let vid = Ulid::new();
    with_vehicle.vehicle_id = Some(vid);
    assert!(matches!(
        engine.create_pattern(with_vehicle).await,
        Err(EngineError::NotFound(id)) if id == vid
    ));

    assert!(matches!(
        engine.create_pattern(weekly_pattern(iid, Ulid::new(), vec![], 2)).await,
        Err(EngineError::InvalidInput(_))
    ));
    let mut huge = weekly_pattern(iid, Ulid::new(), vec![1], 2);
    huge.duration = u32::MAX - 100;
    let huge_id = huge.id;
    assert!(matches!(
        engine.create_pattern(huge).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(engine.get_pattern(huge_id).await.is_err());
    assert!(matches!(
        engine.generate_occurrences(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.add_exception(Ulid::new(), d(2), None).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn generate_all_covers_every_active_pattern() {
    let engine = new_engine("pattern_generate_all.wal");
    let iid = instructor_with_hours(&engine, &[1, 3], 9 * H, 18 * H).await;
    let mut daily = weekly_pattern(iid, Ulid::new(), Vec::new(), 3);
    daily.recurrence = RecurrenceType::Daily;
    daily.time_of_day = 9 * H;
    engine.create_pattern(daily).await.unwrap();
    engine
        .create_pattern(weekly_pattern(iid, Ulid::new(), vec![3], 2))
        .await
        .unwrap();
    let retired = engine
        .create_pattern(weekly_pattern(iid, Ulid::new(), vec![1], 2))
        .await
        .unwrap();
    engine.deactivate_pattern(retired.id).await.unwrap();

    let reports = engine.generate_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    let created: usize = reports.iter().map(|r| r.created.len()).sum();
    assert_eq!(created, 5);
    assert_eq!(engine.list_patterns().await.len(), 3);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let iid;
    let booking;
    let pattern;
    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        iid = instructor_with_hours(&engine, &[1, 3], 9 * H, 18 * H).await;
        engine
            .update_settings(SettingsPatch {
                buffer_between_lessons: Some(20),
                ..Default::default()
            })
            .await
            .unwrap();
        booking = engine.book_lesson(lesson(iid, Ulid::new(), 2, 9 * H, 10 * H)).await.unwrap();
        engine
            .reschedule_booking(booking.id, dt(2, 10 * H), dt(2, 11 * H))
            .await
            .unwrap();
        pattern = engine
            .create_pattern(weekly_pattern(iid, Ulid::new(), vec![1, 3], 4))
            .await
            .unwrap();
        engine.add_exception(pattern.id, d(11), None).await.unwrap();
        engine.generate_occurrences(pattern.id).await.unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.settings().await.buffer_between_lessons, 20);
    assert_eq!(engine.instructor_schedule(iid).await.unwrap().len(), 2);
    assert_eq!(engine.get_booking(booking.id).await.unwrap().span, Span::new(10 * H, 11 * H));
    assert_eq!(engine.pattern_links(pattern.id).await.unwrap().len(), 4);
    assert_eq!(engine.pattern_exceptions(pattern.id).await.unwrap().len(), 1);

    // The replayed calendar still blocks double bookings and stays idempotent.
    assert!(engine.book_lesson(lesson(iid, Ulid::new(), 2, 10 * H, 11 * H)).await.is_err());
    assert!(engine.generate_occurrences(pattern.id).await.unwrap().created.is_empty());
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let iid;
    let cancelled;
    let pattern;
    let vid = Ulid::new();
    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        iid = instructor_with_hours(&engine, &[1, 3], 9 * H, 18 * H).await;
        engine
            .register_vehicle(VehicleProfile {
                id: vid,
                ownership: VehicleOwnership::SchoolOwned,
                owner_instructor_id: None,
            })
            .await
            .unwrap();
        let mut req = lesson(iid, Ulid::new(), 2, 9 * H, 10 * H);
        req.vehicle_id = Some(vid);
        cancelled = engine.book_lesson(req).await.unwrap();
        engine.cancel_booking(cancelled.id).await.unwrap();
        for minutes in [10 * H, 11 * H, 12 * H] {
            let b = engine.book_lesson(lesson(iid, Ulid::new(), 3, minutes, minutes + 30)).await.unwrap();
            engine.cancel_booking(b.id).await.unwrap();
        }
        pattern = engine
            .create_pattern(weekly_pattern(iid, Ulid::new(), vec![1], 2))
            .await
            .unwrap();
        engine.generate_occurrences(pattern.id).await.unwrap();

        let before = engine.wal_appends_since_compact().await;
        assert!(before > 10);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.get_booking(cancelled.id).await.unwrap().status, BookingStatus::Cancelled);
    assert_eq!(engine.bookings_on(iid, d(3)).await.unwrap().len(), 3);
    let links = engine.pattern_links(pattern.id).await.unwrap();
    assert_eq!(links.len(), 2);
    assert_eq!(engine.get_booking(links[1].booking_id).await.unwrap().date, d(9));
    assert!(engine.get_vehicle_state(&vid).is_some());
    assert!(engine.generate_occurrences(pattern.id).await.unwrap().created.is_empty());
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn subscribers_see_committed_bookings() {
    let engine = new_engine("notify_booking.wal");
    let iid = instructor_with_hours(&engine, &[1], 9 * H, 17 * H).await;
    let mut rx = engine.notify.subscribe(iid);

    let booking = engine.book_lesson(lesson(iid, Ulid::new(), 2, 10 * H, 11 * H)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Event::BookingCreated(booking.clone()));

    engine.cancel_booking(booking.id).await.unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::BookingStatusChanged { id, status: BookingStatus::Cancelled, .. } if id == booking.id
    ));

    // Rejected commits publish nothing.
    engine.book_lesson(lesson(iid, Ulid::new(), 2, 12 * H, 13 * H)).await.unwrap();
    let _ = rx.recv().await.unwrap();
    let _ = engine.book_lesson(lesson(iid, Ulid::new(), 2, 12 * H, 13 * H)).await;
    assert!(rx.try_recv().is_err());
}
