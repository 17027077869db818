use std::time::Instant;

use chrono::NaiveDate;
use futures::future::try_join_all;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::slots_for_day;
use super::conflict::{detect, proposal_span, ConflictScope};
use super::{Engine, EngineError, SharedInstructor};

impl Engine {
    /// The tenant's settings. Defaults until the first update is committed.
    pub async fn settings(&self) -> SchedulingSettings {
        self.settings.read().await.clone().unwrap_or_default()
    }

    /// Free lesson slots over an inclusive date range.
    ///
    /// Ordered by date, then instructor (id order when searching everyone),
    /// then window. Each instructor is read concurrently; the order is rebuilt
    /// afterwards.
    #[tracing::instrument(skip(self), fields(student = ?query.student_id))]
    pub async fn find_slots(&self, query: &SlotQuery) -> Result<Vec<Slot>, EngineError> {
        if query.duration == 0 {
            return Err(EngineError::InvalidInput("duration must be positive".into()));
        }
        if query.start_date > query.end_date {
            return Err(EngineError::InvalidInput("start date is after end date".into()));
        }
        let days = (query.end_date - query.start_date).num_days() + 1;
        if days > MAX_SEARCH_DAYS {
            return Err(EngineError::LimitExceeded("search range too wide"));
        }
        let duration = Minute::try_from(query.duration)
            .map_err(|_| EngineError::InvalidInput("duration too long".into()))?;

        let started = Instant::now();
        let settings = self.settings().await;
        let instructors: Vec<SharedInstructor> = match query.instructor_id {
            Some(id) => vec![self.get_instructor_state(&id).ok_or(EngineError::NotFound(id))?],
            None => {
                let mut all: Vec<_> = self
                    .instructors
                    .iter()
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect();
                all.sort_by_key(|(id, _)| *id);
                all.into_iter().map(|(_, st)| st).collect()
            }
        };
        let dates: Vec<NaiveDate> = query.start_date.iter_days().take(days as usize).collect();
        let everyone = query.instructor_id.is_none();

        let per_instructor = try_join_all(instructors.into_iter().map(|st| {
            let dates = &dates;
            let settings = &settings;
            async move {
                let guard = st.read().await;
                if everyone && !guard.profile.active {
                    return Ok::<_, EngineError>(Vec::new());
                }
                let vehicle = query.vehicle_id.or_else(|| guard.profile.preferred_vehicle());
                Ok(dates
                    .iter()
                    .map(|&date| slots_for_day(&guard, date, settings, duration, vehicle))
                    .collect::<Vec<_>>())
            }
        }))
        .await?;

        let mut slots = Vec::new();
        for i in 0..dates.len() {
            for per_day in &per_instructor {
                if let Some(day) = per_day.get(i) {
                    slots.extend_from_slice(day);
                }
            }
        }

        metrics::counter!(observability::SLOT_SEARCHES_TOTAL).increment(1);
        metrics::histogram!(observability::SLOTS_RETURNED).record(slots.len() as f64);
        metrics::histogram!(observability::SLOT_SEARCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        tracing::debug!(days, slots = slots.len(), "slot search finished");
        Ok(slots)
    }

    /// Every conflict a proposal would cause. Advisory: nothing is locked for
    /// the caller afterwards.
    pub async fn detect_conflicts(&self, proposal: &Proposal) -> Result<Vec<Conflict>, EngineError> {
        let (date, span) = proposal_span(proposal)?;
        let settings = self.settings().await;

        let instructor = self
            .get_instructor_state(&proposal.instructor_id)
            .ok_or(EngineError::NotFound(proposal.instructor_id))?;
        let vehicle = match proposal.vehicle_id {
            Some(vid) => Some(self.get_vehicle_state(&vid).ok_or(EngineError::NotFound(vid))?),
            None => None,
        };
        let student = self.students.get(&proposal.student_id).map(|e| e.value().clone());

        let ig = instructor.read().await;
        let vg = match &vehicle {
            Some(v) => Some(v.read().await),
            None => None,
        };
        let sg = match &student {
            Some(s) => Some(s.read().await),
            None => None,
        };
        let scope = ConflictScope {
            instructor: &*ig,
            vehicle: vg.as_deref(),
            student: sg.as_deref(),
            settings: &settings,
        };
        let conflicts = detect(&scope, date, span, proposal.exclude_booking_id);

        for c in &conflicts {
            metrics::counter!(observability::CONFLICTS_TOTAL, "kind" => c.kind.label()).increment(1);
        }
        Ok(conflicts)
    }

    pub async fn validate(&self, proposal: &Proposal) -> Result<Validation, EngineError> {
        self.detect_conflicts(proposal).await.map(Validation::from)
    }

    // ── Bookings ─────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let loc = self.locate_booking(&id).ok_or(EngineError::NotFound(id))?;
        let st = self
            .get_instructor_state(&loc.instructor_id)
            .ok_or(EngineError::NotFound(loc.instructor_id))?;
        let guard = st.read().await;
        // The index may be one reschedule behind; fall back to a scan.
        guard
            .calendar
            .get(id, loc.date)
            .or_else(|| guard.calendar.iter().find(|b| b.id == id))
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// All bookings of an instructor on a date, cancelled ones included.
    pub async fn bookings_on(&self, instructor_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let st = self
            .get_instructor_state(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let guard = st.read().await;
        Ok(guard.calendar.on(date).to_vec())
    }

    pub async fn student_bookings_on(&self, student_id: Ulid, date: NaiveDate) -> Vec<Booking> {
        match self.students.get(&student_id).map(|e| e.value().clone()) {
            Some(cal) => cal.read().await.on(date).to_vec(),
            None => Vec::new(),
        }
    }

    // ── Instructors ──────────────────────────────────────

    pub async fn get_instructor(&self, id: Ulid) -> Result<InstructorProfile, EngineError> {
        let st = self.get_instructor_state(&id).ok_or(EngineError::NotFound(id))?;
        let profile = st.read().await.profile.clone();
        Ok(profile)
    }

    pub async fn list_instructors(&self) -> Vec<InstructorProfile> {
        let mut arcs: Vec<_> = self
            .instructors
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        arcs.sort_by_key(|(id, _)| *id);
        let mut profiles = Vec::with_capacity(arcs.len());
        for (_, st) in arcs {
            profiles.push(st.read().await.profile.clone());
        }
        profiles
    }

    /// Active weekly blocks, ordered by weekday then start.
    pub async fn instructor_schedule(&self, instructor_id: Ulid) -> Result<Vec<AvailabilityBlock>, EngineError> {
        let st = self
            .get_instructor_state(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let guard = st.read().await;
        let mut blocks: Vec<_> = guard.blocks.iter().filter(|b| b.active).cloned().collect();
        blocks.sort_by_key(|b| (b.day_of_week, b.span.start));
        Ok(blocks)
    }

    /// Absences overlapping `[from, to]`, approved or not, by start date.
    pub async fn absences_between(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AbsencePeriod>, EngineError> {
        let st = self
            .get_instructor_state(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let guard = st.read().await;
        let mut absences: Vec<_> = guard
            .absences
            .iter()
            .filter(|a| a.start_date <= to && a.end_date >= from)
            .cloned()
            .collect();
        absences.sort_by_key(|a| a.start_date);
        Ok(absences)
    }

    // ── Patterns ─────────────────────────────────────────

    pub async fn get_pattern(&self, id: Ulid) -> Result<RecurrencePattern, EngineError> {
        let ps = self.get_pattern_state(&id).ok_or(EngineError::NotFound(id))?;
        let pattern = ps.read().await.pattern.clone();
        Ok(pattern)
    }

    pub async fn list_patterns(&self) -> Vec<RecurrencePattern> {
        let mut arcs: Vec<_> = self.patterns.iter().map(|e| (*e.key(), e.value().clone())).collect();
        arcs.sort_by_key(|(id, _)| *id);
        let mut patterns = Vec::with_capacity(arcs.len());
        for (_, ps) in arcs {
            patterns.push(ps.read().await.pattern.clone());
        }
        patterns
    }

    /// Links in occurrence order.
    pub async fn pattern_links(&self, id: Ulid) -> Result<Vec<GeneratedLessonLink>, EngineError> {
        let ps = self.get_pattern_state(&id).ok_or(EngineError::NotFound(id))?;
        let links = ps.read().await.links.values().cloned().collect();
        Ok(links)
    }

    pub async fn pattern_exceptions(&self, id: Ulid) -> Result<Vec<PatternException>, EngineError> {
        let ps = self.get_pattern_state(&id).ok_or(EngineError::NotFound(id))?;
        let exceptions = ps.read().await.exceptions.values().cloned().collect();
        Ok(exceptions)
    }
}
