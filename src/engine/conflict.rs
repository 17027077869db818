use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::time::{self, format_minutes};

use super::EngineError;

/// Everything the detector reads for one proposal. The caller holds the locks.
pub struct ConflictScope<'a> {
    pub instructor: &'a InstructorState,
    pub vehicle: Option<&'a VehicleState>,
    pub student: Option<&'a Calendar>,
    pub settings: &'a SchedulingSettings,
}

/// Date and minute span of a proposal, rejecting empty and multi-day ones.
pub(crate) fn proposal_span(proposal: &Proposal) -> Result<(NaiveDate, Span), EngineError> {
    let (date, start, end) = time::same_day_minutes(proposal.start, proposal.end)?;
    Ok((date, Span::new(start, end)))
}

/// Run all six checks. At most one conflict per kind; empty means valid.
pub fn detect(scope: &ConflictScope<'_>, date: NaiveDate, span: Span, exclude: Option<Ulid>) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    conflicts.extend(outside_working_hours(scope.instructor, date, span));
    conflicts.extend(absence(scope.instructor, date, span));
    conflicts.extend(instructor_busy(scope.instructor, date, span, exclude));
    conflicts.extend(buffer_violation(scope.instructor, scope.settings, date, span, exclude));
    conflicts.extend(vehicle_busy(scope.vehicle, date, span, exclude));
    conflicts.extend(student_busy(scope.student, date, span, exclude));
    conflicts
}

/// Only the double-booking checks. These decide whether a commit goes through.
pub fn detect_hard(scope: &ConflictScope<'_>, date: NaiveDate, span: Span, exclude: Option<Ulid>) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    conflicts.extend(instructor_busy(scope.instructor, date, span, exclude));
    conflicts.extend(vehicle_busy(scope.vehicle, date, span, exclude));
    conflicts.extend(student_busy(scope.student, date, span, exclude));
    conflicts
}

/// The collision rule shared by the instructor, vehicle and student checks.
pub fn collides(existing: &Span, proposed: &Span) -> bool {
    (existing.start <= proposed.start && existing.end > proposed.start)
        || (existing.start < proposed.end && existing.end >= proposed.end)
        || (existing.start >= proposed.start && existing.end <= proposed.end)
}

fn first_collision<'a>(
    calendar: &'a Calendar,
    date: NaiveDate,
    span: Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    calendar
        .active_on(date)
        .filter(|b| Some(b.id) != exclude)
        .find(|b| collides(&b.span, &span))
}

fn describe(span: Span) -> String {
    format!("{}-{}", format_minutes(span.start), format_minutes(span.end))
}

fn outside_working_hours(instructor: &InstructorState, date: NaiveDate, span: Span) -> Option<Conflict> {
    let dow = time::day_of_week(date);
    if instructor.blocks_on(dow).any(|b| b.span.contains_span(&span)) {
        return None;
    }
    Some(Conflict {
        kind: ConflictKind::OutsideWorkingHours,
        message: format!(
            "{} is outside the instructor's working hours on {}",
            describe(span),
            time::date_key(date)
        ),
        record: None,
    })
}

fn absence(instructor: &InstructorState, date: NaiveDate, span: Span) -> Option<Conflict> {
    let hit = instructor.absences_on(date).find(|a| match a.window {
        AbsenceWindow::AllDay => true,
        AbsenceWindow::Bounded(window) => window.overlaps(&span),
    })?;
    Some(Conflict {
        kind: ConflictKind::Absence,
        message: format!(
            "instructor is away ({:?}) from {} to {}",
            hit.reason,
            time::date_key(hit.start_date),
            time::date_key(hit.end_date)
        ),
        record: Some(ConflictRecord::Absence(hit.id)),
    })
}

fn instructor_busy(instructor: &InstructorState, date: NaiveDate, span: Span, exclude: Option<Ulid>) -> Option<Conflict> {
    let hit = first_collision(&instructor.calendar, date, span, exclude)?;
    Some(Conflict {
        kind: ConflictKind::InstructorBusy,
        message: format!("instructor already has a lesson at {}", describe(hit.span)),
        record: Some(ConflictRecord::Booking(hit.id)),
    })
}

fn buffer_violation(
    instructor: &InstructorState,
    settings: &SchedulingSettings,
    date: NaiveDate,
    span: Span,
    exclude: Option<Ulid>,
) -> Option<Conflict> {
    if settings.allow_back_to_back_lessons {
        return None;
    }
    let buffer = settings.buffer_between_lessons;
    let hit = instructor
        .calendar
        .active_on(date)
        .filter(|b| Some(b.id) != exclude)
        .find(|b| {
            let ends_just_before = b.span.end > span.start - buffer && b.span.end <= span.start;
            let starts_just_after = b.span.start >= span.end && b.span.start < span.end + buffer;
            ends_just_before || starts_just_after
        })?;
    Some(Conflict {
        kind: ConflictKind::BufferViolation,
        message: format!(
            "less than {buffer} minutes between this lesson and the one at {}",
            describe(hit.span)
        ),
        record: Some(ConflictRecord::Booking(hit.id)),
    })
}

fn vehicle_busy(vehicle: Option<&VehicleState>, date: NaiveDate, span: Span, exclude: Option<Ulid>) -> Option<Conflict> {
    let vehicle = vehicle.filter(|v| v.profile.is_pooled())?;
    let hit = first_collision(&vehicle.calendar, date, span, exclude)?;
    Some(Conflict {
        kind: ConflictKind::VehicleBusy,
        message: format!("vehicle is already in use at {}", describe(hit.span)),
        record: Some(ConflictRecord::Booking(hit.id)),
    })
}

fn student_busy(student: Option<&Calendar>, date: NaiveDate, span: Span, exclude: Option<Ulid>) -> Option<Conflict> {
    let hit = first_collision(student?, date, span, exclude)?;
    Some(Conflict {
        kind: ConflictKind::StudentBusy,
        message: format!("student already has a lesson at {}", describe(hit.span)),
        record: Some(ConflictRecord::Booking(hit.id)),
    })
}
