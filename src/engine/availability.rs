use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::time;

// ── Availability Algorithm ────────────────────────────────────────

/// Open working windows for an instructor on `date`, ordered by start.
///
/// Empty when an approved all-day absence covers the date. Time-bounded
/// absences do not remove the day; they show up in [`busy_intervals`].
pub fn open_windows(instructor: &InstructorState, date: NaiveDate) -> Vec<Span> {
    if instructor.absences_on(date).any(AbsencePeriod::is_all_day) {
        return Vec::new();
    }
    let mut windows: Vec<Span> = instructor
        .blocks_on(time::day_of_week(date))
        .map(|b| b.span)
        .collect();
    windows.sort_by_key(|s| s.start);
    windows
}

/// Intervals that block new lessons on `date`, sorted by start.
///
/// Each participating booking is extended by its own buffer override, or the
/// tenant buffer when it has none. Bounded absences are taken as-is.
pub fn busy_intervals(instructor: &InstructorState, date: NaiveDate, default_buffer: Minute) -> Vec<Span> {
    let mut busy: Vec<Span> = instructor
        .calendar
        .active_on(date)
        .map(|b| b.span.extended_by(b.buffer_after.unwrap_or(default_buffer)))
        .collect();
    for absence in instructor.absences_on(date) {
        if let AbsenceWindow::Bounded(span) = absence.window {
            busy.push(span);
        }
    }
    busy.sort_by_key(|s| s.start);
    busy
}

/// Earliest-fitting slot of `duration` in each gap of `window`.
///
/// `busy` must be sorted by start. Intervals that end before the cursor are
/// ignored, so nothing outside the window can pull the cursor backwards.
pub fn find_gaps(window: Span, busy: &[Span], duration: Minute) -> Vec<Span> {
    if duration <= 0 {
        return Vec::new();
    }
    let mut slots = Vec::new();
    let mut cursor = window.start;

    for b in busy {
        if b.end <= cursor {
            continue;
        }
        if b.start >= window.end {
            break;
        }
        if b.start - cursor >= duration {
            slots.push(Span::new(cursor, cursor + duration));
        }
        cursor = cursor.max(b.end);
    }

    if window.end - cursor >= duration {
        slots.push(Span::new(cursor, cursor + duration));
    }
    slots
}

/// All candidate slots for one instructor on one date, in window order.
pub fn slots_for_day(
    instructor: &InstructorState,
    date: NaiveDate,
    settings: &SchedulingSettings,
    duration: Minute,
    vehicle_id: Option<Ulid>,
) -> Vec<Slot> {
    let windows = open_windows(instructor, date);
    if windows.is_empty() {
        return Vec::new();
    }
    let busy = busy_intervals(instructor, date, settings.buffer_between_lessons);

    windows
        .into_iter()
        .flat_map(|w| find_gaps(w, &busy, duration))
        .map(|span| Slot {
            date,
            start: time::at(date, span.start),
            end: time::at(date, span.end),
            instructor_id: instructor.profile.id,
            vehicle_id,
            duration: span.len() as u32,
        })
        .collect()
}
