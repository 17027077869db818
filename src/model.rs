use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;


/// Minutes since midnight. The only time-of-day type.
pub type Minute = i32;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn len(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Same start, end pushed out by `buffer` minutes.
    pub fn extended_by(&self, buffer: Minute) -> Span {
        Span {
            start: self.start,
            end: self.end + buffer.max(0),
        }
    }
}

// ── Availability ─────────────────────────────────────────────────

/// One recurring weekly block of working time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityBlock {
    pub id: Ulid,
    pub instructor_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub span: Span,
    pub active: bool,
}

/// Which part of each covered day an absence takes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbsenceWindow {
    AllDay,
    Bounded(Span),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceReason {
    Vacation,
    Sick,
    Personal,
    Training,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsencePeriod {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
    pub window: AbsenceWindow,
    pub reason: AbsenceReason,
    pub approved: bool,
}

impl AbsencePeriod {
    /// A new absence, approved unless the caller says otherwise.
    pub fn new(
        instructor_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        window: AbsenceWindow,
        reason: AbsenceReason,
    ) -> Self {
        Self {
            id: Ulid::new(),
            instructor_id,
            start_date,
            end_date,
            window,
            reason,
            approved: true,
        }
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self.window, AbsenceWindow::AllDay)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Cancelled and no-show bookings no longer occupy anyone's time.
    pub fn occupies_time(self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::NoShow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub student_id: Ulid,
    pub vehicle_id: Option<Ulid>,
    pub date: NaiveDate,
    pub span: Span,
    /// Minutes.
    pub duration: u32,
    pub status: BookingStatus,
    /// Overrides the tenant's buffer for the gap after this booking.
    pub buffer_after: Option<Minute>,
    pub cost_cents: Option<u64>,
    /// Set when the booking was materialized from a recurrence pattern.
    pub pattern_id: Option<Ulid>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.occupies_time()
    }
}

// ── Settings ─────────────────────────────────────────────────────

/// Per-tenant scheduling parameters. Passed by value into every computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingSettings {
    pub buffer_between_lessons: Minute,
    pub buffer_before_first_lesson: Minute,
    pub buffer_after_last_lesson: Minute,
    pub min_hours_advance_booking: u32,
    pub max_days_advance_booking: u32,
    /// Minutes.
    pub default_lesson_duration: u32,
    pub allow_back_to_back_lessons: bool,
    pub default_work_window: Span,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            buffer_between_lessons: 15,
            buffer_before_first_lesson: 0,
            buffer_after_last_lesson: 0,
            min_hours_advance_booking: 24,
            max_days_advance_booking: 90,
            default_lesson_duration: 60,
            allow_back_to_back_lessons: false,
            default_work_window: Span::new(8 * 60, 18 * 60),
        }
    }
}

/// Partial settings update: only `Some` fields change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub buffer_between_lessons: Option<Minute>,
    pub buffer_before_first_lesson: Option<Minute>,
    pub buffer_after_last_lesson: Option<Minute>,
    pub min_hours_advance_booking: Option<u32>,
    pub max_days_advance_booking: Option<u32>,
    pub default_lesson_duration: Option<u32>,
    pub allow_back_to_back_lessons: Option<bool>,
    pub default_work_window: Option<Span>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }

    pub fn apply_to(&self, settings: &SchedulingSettings) -> SchedulingSettings {
        let mut next = settings.clone();
        if let Some(v) = self.buffer_between_lessons {
            next.buffer_between_lessons = v;
        }
        if let Some(v) = self.buffer_before_first_lesson {
            next.buffer_before_first_lesson = v;
        }
        if let Some(v) = self.buffer_after_last_lesson {
            next.buffer_after_last_lesson = v;
        }
        if let Some(v) = self.min_hours_advance_booking {
            next.min_hours_advance_booking = v;
        }
        if let Some(v) = self.max_days_advance_booking {
            next.max_days_advance_booking = v;
        }
        if let Some(v) = self.default_lesson_duration {
            next.default_lesson_duration = v;
        }
        if let Some(v) = self.allow_back_to_back_lessons {
            next.allow_back_to_back_lessons = v;
        }
        if let Some(v) = self.default_work_window {
            next.default_work_window = v;
        }
        next
    }
}

// ── Instructors & vehicles ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructorProfile {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub default_vehicle_id: Option<Ulid>,
    pub prefers_own_vehicle: bool,
}

impl InstructorProfile {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            name: None,
            active: true,
            default_vehicle_id: None,
            prefers_own_vehicle: false,
        }
    }

    /// The vehicle a slot gets when the caller did not pick one.
    pub fn preferred_vehicle(&self) -> Option<Ulid> {
        if self.prefers_own_vehicle {
            self.default_vehicle_id
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleOwnership {
    SchoolOwned,
    InstructorOwned,
    Leased,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleProfile {
    pub id: Ulid,
    pub ownership: VehicleOwnership,
    pub owner_instructor_id: Option<Ulid>,
}

impl VehicleProfile {
    /// Pool vehicles can be double-booked across instructors, so they get checked.
    pub fn is_pooled(&self) -> bool {
        self.ownership == VehicleOwnership::SchoolOwned || self.owner_instructor_id.is_none()
    }
}

// ── Recurrence ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceType {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
}

impl RecurrenceType {
    pub fn uses_days_of_week(self) -> bool {
        matches!(self, RecurrenceType::Weekly | RecurrenceType::Biweekly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub id: Ulid,
    pub student_id: Ulid,
    pub instructor_id: Ulid,
    pub vehicle_id: Option<Ulid>,
    pub recurrence: RecurrenceType,
    /// 0 = Sunday … 6 = Saturday. Only read for weekly and biweekly rules.
    pub days_of_week: Vec<u8>,
    #[serde(with = "crate::time::wall_clock")]
    pub time_of_day: Minute,
    /// Minutes.
    pub duration: u32,
    pub cost_cents: Option<u64>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub max_occurrences: Option<u32>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternException {
    pub pattern_id: Ulid,
    pub date: NaiveDate,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedLessonLink {
    pub pattern_id: Ulid,
    pub booking_id: Ulid,
    /// 1-based, unique per pattern.
    pub occurrence_number: u32,
    pub scheduled_date: NaiveDate,
}

// ── State ────────────────────────────────────────────────────────

/// Bookings of one party (instructor, vehicle or student), bucketed by date and
/// sorted by start within a date.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    days: BTreeMap<NaiveDate, Vec<Booking>>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a booking maintaining sort order by start minute.
    pub fn insert(&mut self, booking: Booking) {
        let day = self.days.entry(booking.date).or_default();
        let pos = day.partition_point(|b| b.span.start <= booking.span.start);
        day.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid, date: NaiveDate) -> Option<Booking> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let booking = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(booking)
    }

    pub fn get(&self, id: Ulid, date: NaiveDate) -> Option<&Booking> {
        self.days.get(&date)?.iter().find(|b| b.id == id)
    }

    /// Every booking on `date`, including cancelled ones.
    pub fn on(&self, date: NaiveDate) -> &[Booking] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Bookings on `date` that still occupy time.
    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &Booking> {
        self.on(date).iter().filter(|b| b.is_active())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flatten()
    }

    /// Apply a booking event. The caller has already routed it to this party.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingCreated(booking) | Event::OccurrenceMaterialized { booking, .. } => {
                self.insert(booking.clone());
            }
            Event::BookingStatusChanged { id, date, status } => {
                if let Some(day) = self.days.get_mut(date)
                    && let Some(b) = day.iter_mut().find(|b| b.id == *id)
                {
                    b.status = *status;
                }
            }
            Event::BookingRescheduled { id, from_date, date, span } => {
                if let Some(mut booking) = self.remove(*id, *from_date) {
                    booking.date = *date;
                    booking.span = *span;
                    booking.duration = span.len() as u32;
                    self.insert(booking);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstructorState {
    pub profile: InstructorProfile,
    pub blocks: Vec<AvailabilityBlock>,
    pub absences: Vec<AbsencePeriod>,
    pub calendar: Calendar,
}

impl InstructorState {
    pub fn new(profile: InstructorProfile) -> Self {
        Self {
            profile,
            blocks: Vec::new(),
            absences: Vec::new(),
            calendar: Calendar::new(),
        }
    }

    /// Active blocks for a weekday, in stored order.
    pub fn blocks_on(&self, day_of_week: u8) -> impl Iterator<Item = &AvailabilityBlock> {
        self.blocks
            .iter()
            .filter(move |b| b.active && b.day_of_week == day_of_week)
    }

    /// Approved absences covering `date`.
    pub fn absences_on(&self, date: NaiveDate) -> impl Iterator<Item = &AbsencePeriod> {
        self.absences
            .iter()
            .filter(move |a| a.approved && a.covers(date))
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::InstructorUpdated(profile) => self.profile = profile.clone(),
            Event::AvailabilityAdded(block) => self.blocks.push(block.clone()),
            Event::AvailabilityDeactivated { id, .. } => {
                if let Some(b) = self.blocks.iter_mut().find(|b| b.id == *id) {
                    b.active = false;
                }
            }
            Event::ScheduleReplaced { blocks, .. } => {
                for b in &mut self.blocks {
                    b.active = false;
                }
                self.blocks.extend(blocks.iter().cloned());
            }
            Event::AbsenceRecorded(absence) => self.absences.push(absence.clone()),
            Event::AbsenceApproved { id, .. } => {
                if let Some(a) = self.absences.iter_mut().find(|a| a.id == *id) {
                    a.approved = true;
                }
            }
            Event::AbsenceRemoved { id, .. } => self.absences.retain(|a| a.id != *id),
            Event::BookingCreated(_)
            | Event::OccurrenceMaterialized { .. }
            | Event::BookingStatusChanged { .. }
            | Event::BookingRescheduled { .. } => self.calendar.apply(event),
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct VehicleState {
    pub profile: VehicleProfile,
    pub calendar: Calendar,
}

impl VehicleState {
    pub fn new(profile: VehicleProfile) -> Self {
        Self {
            profile,
            calendar: Calendar::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternState {
    pub pattern: RecurrencePattern,
    pub exceptions: BTreeMap<NaiveDate, PatternException>,
    /// Keyed by occurrence number.
    pub links: BTreeMap<u32, GeneratedLessonLink>,
}

impl PatternState {
    pub fn new(pattern: RecurrencePattern) -> Self {
        Self {
            pattern,
            exceptions: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::PatternDeactivated { .. } => self.pattern.active = false,
            Event::ExceptionAdded(exception) => {
                self.exceptions
                    .entry(exception.date)
                    .or_insert_with(|| exception.clone());
            }
            Event::OccurrenceMaterialized { link, .. } => {
                self.links
                    .entry(link.occurrence_number)
                    .or_insert_with(|| link.clone());
            }
            _ => {}
        }
    }
}

/// Event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    InstructorRegistered(InstructorProfile),
    InstructorUpdated(InstructorProfile),
    VehicleRegistered(VehicleProfile),
    AvailabilityAdded(AvailabilityBlock),
    AvailabilityDeactivated {
        id: Ulid,
        instructor_id: Ulid,
    },
    ScheduleReplaced {
        instructor_id: Ulid,
        blocks: Vec<AvailabilityBlock>,
    },
    AbsenceRecorded(AbsencePeriod),
    AbsenceApproved {
        id: Ulid,
        instructor_id: Ulid,
    },
    AbsenceRemoved {
        id: Ulid,
        instructor_id: Ulid,
    },
    SettingsUpdated(SchedulingSettings),
    BookingCreated(Booking),
    BookingStatusChanged {
        id: Ulid,
        date: NaiveDate,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        from_date: NaiveDate,
        date: NaiveDate,
        span: Span,
    },
    PatternCreated(RecurrencePattern),
    PatternDeactivated {
        id: Ulid,
    },
    ExceptionAdded(PatternException),
    /// Booking and its pattern link, committed together.
    OccurrenceMaterialized {
        booking: Booking,
        link: GeneratedLessonLink,
    },
}

// ── Requests ─────────────────────────────────────────────────────

/// One weekly block as supplied by a caller, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub day_of_week: u8,
    #[serde(with = "crate::time::wall_clock")]
    pub start: Minute,
    #[serde(with = "crate::time::wall_clock")]
    pub end: Minute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotQuery {
    /// `None` searches every active instructor.
    pub instructor_id: Option<Ulid>,
    pub vehicle_id: Option<Ulid>,
    /// Informational: slots booked to other students are not filtered out.
    pub student_id: Option<Ulid>,
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
    /// Minutes.
    pub duration: u32,
}

/// A fully specified booking to check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub instructor_id: Ulid,
    pub student_id: Ulid,
    pub vehicle_id: Option<Ulid>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// The booking being edited, never compared against itself.
    pub exclude_booking_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub student_id: Ulid,
    pub vehicle_id: Option<Ulid>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub buffer_after: Option<Minute>,
    pub cost_cents: Option<u64>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub instructor_id: Ulid,
    pub vehicle_id: Option<Ulid>,
    /// Minutes.
    pub duration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    OutsideWorkingHours,
    Absence,
    InstructorBusy,
    BufferViolation,
    VehicleBusy,
    StudentBusy,
}

impl ConflictKind {
    /// Double-bookings. These are re-checked at commit and block the write;
    /// the rest are advisory.
    pub fn is_hard(self) -> bool {
        matches!(
            self,
            ConflictKind::InstructorBusy | ConflictKind::VehicleBusy | ConflictKind::StudentBusy
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ConflictKind::OutsideWorkingHours => "outside_working_hours",
            ConflictKind::Absence => "absence",
            ConflictKind::InstructorBusy => "instructor_busy",
            ConflictKind::BufferViolation => "buffer_violation",
            ConflictKind::VehicleBusy => "vehicle_busy",
            ConflictKind::StudentBusy => "student_busy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ConflictRecord {
    Booking(Ulid),
    Absence(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub message: String,
    pub record: Option<ConflictRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    pub conflicts: Vec<Conflict>,
}

impl From<Vec<Conflict>> for Validation {
    fn from(conflicts: Vec<Conflict>) -> Self {
        Self {
            valid: conflicts.is_empty(),
            conflicts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxOccurrences,
    PastEndDate,
    SafetyCap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedOccurrence {
    pub occurrence_number: u32,
    pub booking: Booking,
    /// Advisory conflicts found when the booking was written.
    pub warnings: Vec<Conflict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedOccurrence {
    pub occurrence_number: u32,
    pub date: NaiveDate,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionReport {
    pub pattern_id: Ulid,
    pub created: Vec<CreatedOccurrence>,
    /// Occurrences whose link already existed.
    pub already_materialized: u32,
    pub skipped: Vec<SkippedOccurrence>,
    pub exceptions_skipped: u32,
    /// Occurrence numbers consumed by this run.
    pub occurrences: u32,
    pub stop: StopReason,
}

impl ExpansionReport {
    pub fn truncated(&self) -> bool {
        self.stop == StopReason::SafetyCap
    }
}
