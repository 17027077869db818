use chrono::{Days, Months, NaiveDate};

use crate::limits::MAX_RECURRENCE_ITERATIONS;
use crate::model::*;
use crate::time;

/// One visited candidate date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Declared exception: consumes no occurrence number.
    Exception(NaiveDate),
    Occurrence { number: u32, date: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub stop: StopReason,
}

impl Plan {
    pub fn occurrences(&self) -> impl Iterator<Item = (u32, NaiveDate)> + '_ {
        self.steps.iter().filter_map(|s| match *s {
            Step::Occurrence { number, date } => Some((number, date)),
            Step::Exception(_) => None,
        })
    }
}

/// Walk a pattern's candidate dates and number the occurrences.
///
/// Pure: the caller decides which occurrences still need a booking.
pub fn plan(pattern: &RecurrencePattern, is_exception: impl Fn(NaiveDate) -> bool) -> Plan {
    let mut steps = Vec::new();
    let mut counter = 0u32;
    let mut iterations = 0u32;
    let mut candidate = first_candidate(pattern);

    let stop = loop {
        let Some(date) = candidate else {
            break StopReason::PastEndDate;
        };
        if pattern.max_occurrences.is_some_and(|max| counter >= max) {
            break StopReason::MaxOccurrences;
        }
        if pattern.end_date.is_some_and(|end| date > end) {
            break StopReason::PastEndDate;
        }
        if iterations >= MAX_RECURRENCE_ITERATIONS {
            break StopReason::SafetyCap;
        }
        iterations += 1;

        if is_exception(date) {
            steps.push(Step::Exception(date));
        } else {
            counter += 1;
            steps.push(Step::Occurrence { number: counter, date });
        }
        candidate = next_candidate(pattern, date, iterations);
    };

    Plan { steps, stop }
}

/// Sunday that starts the week containing `date`.
fn week_anchor(date: NaiveDate) -> NaiveDate {
    date - Days::new(time::day_of_week(date) as u64)
}

fn matches_weekday(pattern: &RecurrencePattern, date: NaiveDate) -> bool {
    if !pattern.days_of_week.contains(&time::day_of_week(date)) {
        return false;
    }
    match pattern.recurrence {
        RecurrenceType::Biweekly => {
            let weeks = (date - week_anchor(pattern.start_date)).num_days() / 7;
            weeks % 2 == 0
        }
        _ => true,
    }
}

/// First date `>= from` accepted by a weekly or biweekly rule.
fn scan_from(pattern: &RecurrencePattern, from: NaiveDate) -> Option<NaiveDate> {
    // Two weeks cover every weekday in an active week.
    (0..14u64)
        .filter_map(|offset| from.checked_add_days(Days::new(offset)))
        .find(|d| matches_weekday(pattern, *d))
}

fn first_candidate(pattern: &RecurrencePattern) -> Option<NaiveDate> {
    if pattern.recurrence.uses_days_of_week() {
        scan_from(pattern, pattern.start_date)
    } else {
        Some(pattern.start_date)
    }
}

/// Candidate after `current`; `visited` is how many dates came before it.
fn next_candidate(pattern: &RecurrencePattern, current: NaiveDate, visited: u32) -> Option<NaiveDate> {
    match pattern.recurrence {
        RecurrenceType::Daily => current.succ_opt(),
        RecurrenceType::Weekly | RecurrenceType::Biweekly => scan_from(pattern, current.succ_opt()?),
        // Always measured from the start date, so a clamped 31st -> 28th does
        // not drag later months down to the 28th.
        RecurrenceType::Monthly => pattern.start_date.checked_add_months(Months::new(visited)),
    }
}
