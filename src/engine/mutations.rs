use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::time;

use super::conflict::{detect, detect_hard};
use super::recurrence::{plan, Step};
use super::{Engine, EngineError, WalCommand};

fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_block(spec: &BlockSpec) -> Result<Span, EngineError> {
    if spec.day_of_week > 6 {
        return Err(EngineError::InvalidInput(format!(
            "day of week must be 0..=6, got {}",
            spec.day_of_week
        )));
    }
    if spec.start < 0 || spec.end > MINUTES_PER_DAY || spec.start >= spec.end {
        return Err(EngineError::InvalidInput(format!(
            "invalid block {}-{}",
            time::format_minutes(spec.start),
            time::format_minutes(spec.end)
        )));
    }
    Ok(Span::new(spec.start, spec.end))
}

fn validate_buffer(buffer: Minute, what: &'static str) -> Result<(), EngineError> {
    if !(0..=MAX_BUFFER_MINUTES).contains(&buffer) {
        return Err(EngineError::InvalidInput(format!("{what} out of range: {buffer}")));
    }
    Ok(())
}

fn validate_settings(s: &SchedulingSettings) -> Result<(), EngineError> {
    validate_buffer(s.buffer_between_lessons, "buffer between lessons")?;
    validate_buffer(s.buffer_before_first_lesson, "buffer before first lesson")?;
    validate_buffer(s.buffer_after_last_lesson, "buffer after last lesson")?;
    if s.default_lesson_duration == 0 {
        return Err(EngineError::InvalidInput("default lesson duration must be positive".into()));
    }
    let w = s.default_work_window;
    if w.start < 0 || w.end > MINUTES_PER_DAY || w.start >= w.end {
        return Err(EngineError::InvalidInput("work window must start before it ends".into()));
    }
    Ok(())
}

/// The daily lesson span of a pattern, if it fits inside one day.
fn pattern_span(p: &RecurrencePattern) -> Option<Span> {
    let duration = Minute::try_from(p.duration).ok()?;
    let end = p.time_of_day.checked_add(duration)?;
    (p.duration > 0 && p.time_of_day >= 0 && end <= MINUTES_PER_DAY)
        .then(|| Span::new(p.time_of_day, end))
}

fn validate_pattern(p: &mut RecurrencePattern) -> Result<(), EngineError> {
    if p.duration == 0 {
        return Err(EngineError::InvalidInput("duration must be positive".into()));
    }
    if pattern_span(p).is_none() {
        return Err(EngineError::InvalidInput(
            "lesson must start and end on the same day".into(),
        ));
    }
    if let Some(end) = p.end_date
        && end < p.start_date
    {
        return Err(EngineError::InvalidInput("end date is before start date".into()));
    }
    if p.recurrence.uses_days_of_week() {
        if p.days_of_week.is_empty() {
            return Err(EngineError::InvalidInput(
                "weekly and biweekly patterns need at least one day of week".into(),
            ));
        }
        if let Some(bad) = p.days_of_week.iter().find(|d| **d > 6) {
            return Err(EngineError::InvalidInput(format!("day of week must be 0..=6, got {bad}")));
        }
        p.days_of_week.sort_unstable();
        p.days_of_week.dedup();
    }
    Ok(())
}

impl Engine {
    // ── Instructors & vehicles ───────────────────────────

    pub async fn register_instructor(&self, profile: InstructorProfile) -> Result<(), EngineError> {
        validate_name(&profile.name)?;
        let _gate = self.commit_gate.read().await;
        if self.instructors.len() >= MAX_INSTRUCTORS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many instructors"));
        }
        if self.instructors.contains_key(&profile.id) {
            return Err(EngineError::AlreadyExists(profile.id));
        }

        let event = Event::InstructorRegistered(profile.clone());
        self.wal_append(&event).await?;
        let id = profile.id;
        self.instructors
            .insert(id, Arc::new(RwLock::new(InstructorState::new(profile))));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_instructor(&self, profile: InstructorProfile) -> Result<(), EngineError> {
        validate_name(&profile.name)?;
        let _gate = self.commit_gate.read().await;
        let st = self
            .get_instructor_state(&profile.id)
            .ok_or(EngineError::NotFound(profile.id))?;
        let mut guard = st.write().await;
        let id = profile.id;
        let event = Event::InstructorUpdated(profile);
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn register_vehicle(&self, profile: VehicleProfile) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.vehicles.len() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.vehicles.contains_key(&profile.id) {
            return Err(EngineError::AlreadyExists(profile.id));
        }

        let event = Event::VehicleRegistered(profile.clone());
        self.wal_append(&event).await?;
        self.vehicles
            .insert(profile.id, Arc::new(RwLock::new(VehicleState::new(profile))));
        Ok(())
    }

    // ── Availability & absences ──────────────────────────

    pub async fn add_availability(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        spec: BlockSpec,
    ) -> Result<AvailabilityBlock, EngineError> {
        let span = validate_block(&spec)?;
        let _gate = self.commit_gate.read().await;
        if self.entity_to_instructor.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let st = self
            .get_instructor_state(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let mut guard = st.write().await;
        if guard.blocks.len() >= MAX_BLOCKS_PER_INSTRUCTOR {
            return Err(EngineError::LimitExceeded("too many availability blocks"));
        }

        let block = AvailabilityBlock {
            id,
            instructor_id,
            day_of_week: spec.day_of_week,
            span,
            active: true,
        };
        let event = Event::AvailabilityAdded(block.clone());
        self.persist_and_apply(instructor_id, &mut guard, &event).await?;
        Ok(block)
    }

    /// Soft delete: the block stays on record but no longer opens any window.
    pub async fn deactivate_availability(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (instructor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.blocks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::AvailabilityDeactivated { id, instructor_id };
        self.persist_and_apply(instructor_id, &mut guard, &event).await?;
        Ok(instructor_id)
    }

    /// Replace the whole weekly schedule: every existing block is deactivated,
    /// then the given ones are added.
    pub async fn set_weekly_schedule(
        &self,
        instructor_id: Ulid,
        specs: &[BlockSpec],
    ) -> Result<Vec<AvailabilityBlock>, EngineError> {
        let spans = specs.iter().map(validate_block).collect::<Result<Vec<_>, _>>()?;
        let _gate = self.commit_gate.read().await;
        let st = self
            .get_instructor_state(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let mut guard = st.write().await;
        if guard.blocks.len() + specs.len() > MAX_BLOCKS_PER_INSTRUCTOR {
            return Err(EngineError::LimitExceeded("too many availability blocks"));
        }

        let blocks: Vec<AvailabilityBlock> = specs
            .iter()
            .zip(spans)
            .map(|(spec, span)| AvailabilityBlock {
                id: Ulid::new(),
                instructor_id,
                day_of_week: spec.day_of_week,
                span,
                active: true,
            })
            .collect();
        let event = Event::ScheduleReplaced {
            instructor_id,
            blocks: blocks.clone(),
        };
        self.persist_and_apply(instructor_id, &mut guard, &event).await?;
        Ok(blocks)
    }

    pub async fn record_absence(&self, absence: AbsencePeriod) -> Result<(), EngineError> {
        if absence.end_date < absence.start_date {
            return Err(EngineError::InvalidInput("absence ends before it starts".into()));
        }
        if let AbsenceWindow::Bounded(span) = absence.window
            && (span.start < 0 || span.end > MINUTES_PER_DAY || span.start >= span.end)
        {
            return Err(EngineError::InvalidInput("invalid absence time window".into()));
        }
        let _gate = self.commit_gate.read().await;
        if self.entity_to_instructor.contains_key(&absence.id) {
            return Err(EngineError::AlreadyExists(absence.id));
        }
        let instructor_id = absence.instructor_id;
        let st = self
            .get_instructor_state(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let mut guard = st.write().await;
        if guard.absences.len() >= MAX_ABSENCES_PER_INSTRUCTOR {
            return Err(EngineError::LimitExceeded("too many absences"));
        }

        let event = Event::AbsenceRecorded(absence);
        self.persist_and_apply(instructor_id, &mut guard, &event).await
    }

    pub async fn approve_absence(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (instructor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.absences.iter().any(|a| a.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::AbsenceApproved { id, instructor_id };
        self.persist_and_apply(instructor_id, &mut guard, &event).await?;
        Ok(instructor_id)
    }

    pub async fn remove_absence(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (instructor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.absences.iter().any(|a| a.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::AbsenceRemoved { id, instructor_id };
        self.persist_and_apply(instructor_id, &mut guard, &event).await?;
        Ok(instructor_id)
    }

    // ── Bookings ─────────────────────────────────────────

    /// Commit a lesson. The double-booking checks are re-run under the write
    /// locks of every party, so two racing bookings cannot both land.
    #[tracing::instrument(skip(self, req), fields(booking = %req.id, instructor = %req.instructor_id))]
    pub async fn book_lesson(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let (date, start, end) = time::same_day_minutes(req.start, req.end)?;
        if let Some(buffer) = req.buffer_after {
            validate_buffer(buffer, "buffer override")?;
        }
        let span = Span::new(start, end);
        let settings = self.settings().await;

        let _gate = self.commit_gate.read().await;
        if self.booking_index.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let mut guards = self
            .lock_booking_parties(req.instructor_id, req.vehicle_id, req.student_id)
            .await?;

        let conflicts = detect_hard(&guards.scope(&settings), date, span, None);
        if !conflicts.is_empty() {
            metrics::counter!(observability::COMMITS_REJECTED_TOTAL).increment(1);
            debug!(conflicts = conflicts.len(), "booking rejected");
            return Err(EngineError::Conflict(conflicts));
        }

        let booking = Booking {
            id: req.id,
            instructor_id: req.instructor_id,
            student_id: req.student_id,
            vehicle_id: req.vehicle_id,
            date,
            span,
            duration: span.len() as u32,
            status: BookingStatus::Scheduled,
            buffer_after: req.buffer_after,
            cost_cents: req.cost_cents,
            pattern_id: None,
        };
        let event = Event::BookingCreated(booking.clone());
        self.persist_booking(&mut guards, &event).await?;
        metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Move a booking to a new time, checked against everyone but itself.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let (date, start, end) = time::same_day_minutes(start, end)?;
        let span = Span::new(start, end);
        let settings = self.settings().await;

        let _gate = self.commit_gate.read().await;
        let loc = self.locate_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guards = self
            .lock_booking_parties(loc.instructor_id, loc.vehicle_id, loc.student_id)
            .await?;
        // Re-read under the locks: the date may have moved since the lookup.
        let loc = self.locate_booking(&id).ok_or(EngineError::NotFound(id))?;
        let current = guards
            .instructor
            .calendar
            .get(id, loc.date)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if current.is_active() {
            let conflicts = detect_hard(&guards.scope(&settings), date, span, Some(id));
            if !conflicts.is_empty() {
                metrics::counter!(observability::COMMITS_REJECTED_TOTAL).increment(1);
                return Err(EngineError::Conflict(conflicts));
            }
        }

        let event = Event::BookingRescheduled {
            id,
            from_date: loc.date,
            date,
            span,
        };
        self.persist_booking(&mut guards, &event).await?;
        guards
            .instructor
            .calendar
            .get(id, date)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Change a booking's status. Bringing a cancelled or no-show booking back
    /// re-runs the double-booking checks.
    pub async fn set_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        let settings = self.settings().await;
        let _gate = self.commit_gate.read().await;
        let loc = self.locate_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guards = self
            .lock_booking_parties(loc.instructor_id, loc.vehicle_id, loc.student_id)
            .await?;
        let loc = self.locate_booking(&id).ok_or(EngineError::NotFound(id))?;
        let current = guards
            .instructor
            .calendar
            .get(id, loc.date)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if status.occupies_time() && !current.is_active() {
            let conflicts = detect_hard(&guards.scope(&settings), loc.date, current.span, Some(id));
            if !conflicts.is_empty() {
                metrics::counter!(observability::COMMITS_REJECTED_TOTAL).increment(1);
                return Err(EngineError::Conflict(conflicts));
            }
        }

        let event = Event::BookingStatusChanged {
            id,
            date: loc.date,
            status,
        };
        self.persist_booking(&mut guards, &event).await?;
        Ok(Booking { status, ..current })
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::Cancelled).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::Completed).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::NoShow).await
    }

    // ── Settings ─────────────────────────────────────────

    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<SchedulingSettings, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::InvalidInput("empty settings update".into()));
        }
        let _gate = self.commit_gate.read().await;
        let mut guard = self.settings.write().await;
        let next = patch.apply_to(&guard.clone().unwrap_or_default());
        validate_settings(&next)?;

        let event = Event::SettingsUpdated(next.clone());
        self.wal_append(&event).await?;
        *guard = Some(next.clone());
        info!(buffer = next.buffer_between_lessons, "scheduling settings updated");
        Ok(next)
    }

    // ── Recurrence patterns ──────────────────────────────

    pub async fn create_pattern(&self, mut pattern: RecurrencePattern) -> Result<RecurrencePattern, EngineError> {
        validate_pattern(&mut pattern)?;
        pattern.active = true;

        let _gate = self.commit_gate.read().await;
        if self.patterns.len() >= MAX_PATTERNS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many recurrence patterns"));
        }
        if self.patterns.contains_key(&pattern.id) {
            return Err(EngineError::AlreadyExists(pattern.id));
        }
        if !self.instructors.contains_key(&pattern.instructor_id) {
            return Err(EngineError::NotFound(pattern.instructor_id));
        }
        if let Some(vid) = pattern.vehicle_id
            && !self.vehicles.contains_key(&vid)
        {
            return Err(EngineError::NotFound(vid));
        }

        let event = Event::PatternCreated(pattern.clone());
        self.wal_append(&event).await?;
        self.patterns
            .insert(pattern.id, Arc::new(RwLock::new(PatternState::new(pattern.clone()))));
        self.notify.send(pattern.instructor_id, &event);
        Ok(pattern)
    }

    /// Soft delete. Already materialized bookings stay.
    pub async fn deactivate_pattern(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let ps = self.get_pattern_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ps.write().await;
        if !guard.pattern.active {
            return Ok(());
        }
        let event = Event::PatternDeactivated { id };
        self.wal_append(&event).await?;
        guard.apply(&event);
        self.notify.send(guard.pattern.instructor_id, &event);
        Ok(())
    }

    /// Declare a date the pattern skips. Returns false if it was already declared.
    pub async fn add_exception(
        &self,
        pattern_id: Ulid,
        date: NaiveDate,
        reason: Option<String>,
    ) -> Result<bool, EngineError> {
        if let Some(r) = &reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let _gate = self.commit_gate.read().await;
        let ps = self
            .get_pattern_state(&pattern_id)
            .ok_or(EngineError::NotFound(pattern_id))?;
        let mut guard = ps.write().await;
        if guard.exceptions.contains_key(&date) {
            return Ok(false);
        }
        let event = Event::ExceptionAdded(PatternException {
            pattern_id,
            date,
            reason,
        });
        self.wal_append(&event).await?;
        guard.apply(&event);
        self.notify.send(guard.pattern.instructor_id, &event);
        Ok(true)
    }

    /// Materialize every occurrence of a pattern that has no booking yet.
    ///
    /// Idempotent: occurrences already linked are counted and skipped. An
    /// occurrence that would double-book someone is reported and left
    /// unlinked, so a later run fills it once the clash is gone.
    #[tracing::instrument(skip(self))]
    pub async fn generate_occurrences(&self, pattern_id: Ulid) -> Result<ExpansionReport, EngineError> {
        let settings = self.settings().await;
        let _gate = self.commit_gate.read().await;
        let ps = self
            .get_pattern_state(&pattern_id)
            .ok_or(EngineError::NotFound(pattern_id))?;
        let mut pguard = ps.write_owned().await;
        if !pguard.pattern.active {
            return Err(EngineError::PatternInactive(pattern_id));
        }

        let pattern = pguard.pattern.clone();
        let plan = plan(&pattern, |date| pguard.exceptions.contains_key(&date));
        let span = pattern_span(&pattern).ok_or_else(|| {
            EngineError::InvalidInput("lesson must start and end on the same day".into())
        })?;

        let mut report = ExpansionReport {
            pattern_id,
            created: Vec::new(),
            already_materialized: 0,
            skipped: Vec::new(),
            exceptions_skipped: 0,
            occurrences: 0,
            stop: plan.stop,
        };

        for step in plan.steps {
            let (number, date) = match step {
                Step::Exception(_) => {
                    report.exceptions_skipped += 1;
                    continue;
                }
                Step::Occurrence { number, date } => (number, date),
            };
            report.occurrences = number;
            if pguard.links.contains_key(&number) {
                report.already_materialized += 1;
                continue;
            }

            let mut guards = self
                .lock_booking_parties(pattern.instructor_id, pattern.vehicle_id, pattern.student_id)
                .await?;
            let conflicts = detect(&guards.scope(&settings), date, span, None);
            let (hard, warnings): (Vec<Conflict>, Vec<Conflict>) =
                conflicts.into_iter().partition(|c| c.kind.is_hard());
            if !hard.is_empty() {
                metrics::counter!(observability::OCCURRENCES_SKIPPED_TOTAL).increment(1);
                debug!(occurrence = number, %date, "occurrence skipped: double booking");
                report.skipped.push(SkippedOccurrence {
                    occurrence_number: number,
                    date,
                    conflicts: hard,
                });
                continue;
            }

            let booking = Booking {
                id: Ulid::new(),
                instructor_id: pattern.instructor_id,
                student_id: pattern.student_id,
                vehicle_id: pattern.vehicle_id,
                date,
                span,
                duration: pattern.duration,
                status: BookingStatus::Scheduled,
                buffer_after: None,
                cost_cents: pattern.cost_cents,
                pattern_id: Some(pattern_id),
            };
            let link = GeneratedLessonLink {
                pattern_id,
                booking_id: booking.id,
                occurrence_number: number,
                scheduled_date: date,
            };
            let event = Event::OccurrenceMaterialized {
                booking: booking.clone(),
                link,
            };
            self.persist_booking(&mut guards, &event).await?;
            pguard.apply(&event);
            metrics::counter!(observability::OCCURRENCES_GENERATED_TOTAL).increment(1);

            report.created.push(CreatedOccurrence {
                occurrence_number: number,
                booking,
                warnings,
            });
        }

        if report.truncated() {
            warn!(%pattern_id, "recurrence expansion stopped at the safety cap");
        }
        info!(
            %pattern_id,
            created = report.created.len(),
            replayed = report.already_materialized,
            skipped = report.skipped.len(),
            "pattern expanded"
        );
        Ok(report)
    }

    /// Expand every active pattern, in id order.
    pub async fn generate_all(&self) -> Result<Vec<ExpansionReport>, EngineError> {
        let mut arcs: Vec<_> = self
            .patterns
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        arcs.sort_by_key(|(id, _)| *id);

        let mut reports = Vec::new();
        for (id, ps) in arcs {
            if !ps.read().await.pattern.active {
                continue;
            }
            match self.generate_occurrences(id).await {
                Ok(report) => reports.push(report),
                // Deactivated between the check and the run.
                Err(EngineError::PatternInactive(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        debug!(events = count, "WAL compacted");
        Ok(())
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        if let Some(settings) = self.settings.read().await.clone() {
            events.push(Event::SettingsUpdated(settings));
        }

        let mut vehicles: Vec<_> = self.vehicles.iter().map(|e| (*e.key(), e.value().clone())).collect();
        vehicles.sort_by_key(|(id, _)| *id);
        for (_, vs) in &vehicles {
            events.push(Event::VehicleRegistered(vs.read().await.profile.clone()));
        }

        let mut instructors: Vec<_> = self
            .instructors
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        instructors.sort_by_key(|(id, _)| *id);
        for (_, st) in &instructors {
            let guard = st.read().await;
            events.push(Event::InstructorRegistered(guard.profile.clone()));
            events.extend(guard.blocks.iter().cloned().map(Event::AvailabilityAdded));
            events.extend(guard.absences.iter().cloned().map(Event::AbsenceRecorded));
        }

        let mut patterns: Vec<_> = self.patterns.iter().map(|e| (*e.key(), e.value().clone())).collect();
        patterns.sort_by_key(|(id, _)| *id);
        let mut links: HashMap<Ulid, GeneratedLessonLink> = HashMap::new();
        for (_, ps) in &patterns {
            let guard = ps.read().await;
            events.push(Event::PatternCreated(guard.pattern.clone()));
            events.extend(guard.exceptions.values().cloned().map(Event::ExceptionAdded));
            links.extend(guard.links.values().map(|l| (l.booking_id, l.clone())));
        }

        for (_, st) in &instructors {
            let guard = st.read().await;
            for booking in guard.calendar.iter() {
                let event = match links.remove(&booking.id) {
                    Some(link) => Event::OccurrenceMaterialized {
                        booking: booking.clone(),
                        link,
                    },
                    None => Event::BookingCreated(booking.clone()),
                };
                events.push(event);
            }
        }

        events
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
