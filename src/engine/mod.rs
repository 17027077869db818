mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod recurrence;
#[cfg(test)]
mod tests;

pub use availability::{busy_intervals, find_gaps, open_windows, slots_for_day};
pub use conflict::{collides, detect, detect_hard, ConflictScope};
pub use error::EngineError;
pub use recurrence::{plan, Plan, Step};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedInstructor = Arc<RwLock<InstructorState>>;
pub type SharedVehicle = Arc<RwLock<VehicleState>>;
pub type SharedCalendar = Arc<RwLock<Calendar>>;
pub type SharedPattern = Arc<RwLock<PatternState>>;

/// Where a booking lives. Parties never change after creation; the date does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingLocation {
    pub instructor_id: Ulid,
    pub vehicle_id: Option<Ulid>,
    pub student_id: Ulid,
    pub date: NaiveDate,
}

impl BookingLocation {
    fn of(booking: &Booking) -> Self {
        Self {
            instructor_id: booking.instructor_id,
            vehicle_id: booking.vehicle_id,
            student_id: booking.student_id,
            date: booking.date,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running go out
/// together under a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut deferred = match cmd {
            WalCommand::Append { event, response } => {
                batch.push((event, response));
                None
            }
            other => Some(other),
        };

        while deferred.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => deferred = Some(other),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            commit_batch(&mut wal, &mut batch);
        }
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush regardless so a failed batch never leaks bytes into the next one.
    let flushed = wal.flush_sync();
    let result = appended.and(flushed);

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, events = batch.len(), "WAL flush failed");
    }

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

/// One tenant's scheduling state: instructors, vehicles, student calendars and
/// recurrence patterns, each behind its own lock and backed by one WAL.
pub struct Engine {
    pub(super) instructors: DashMap<Ulid, SharedInstructor>,
    pub(super) vehicles: DashMap<Ulid, SharedVehicle>,
    pub(super) students: DashMap<Ulid, SharedCalendar>,
    pub(super) patterns: DashMap<Ulid, SharedPattern>,
    pub(super) settings: RwLock<Option<SchedulingSettings>>,
    /// Reverse lookup: availability block / absence id → instructor id
    pub(super) entity_to_instructor: DashMap<Ulid, Ulid>,
    pub(super) booking_index: DashMap<Ulid, BookingLocation>,
    /// Mutations hold it shared, compaction exclusively, so a compaction
    /// snapshot never misses an event that is already in the old log.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Write guards for every party of one booking, taken instructor → vehicle → student.
pub(super) struct BookingGuards {
    pub instructor: OwnedRwLockWriteGuard<InstructorState>,
    pub vehicle: Option<OwnedRwLockWriteGuard<VehicleState>>,
    pub student: OwnedRwLockWriteGuard<Calendar>,
}

impl BookingGuards {
    pub fn scope<'a>(&'a self, settings: &'a SchedulingSettings) -> ConflictScope<'a> {
        ConflictScope {
            instructor: &*self.instructor,
            vehicle: self.vehicle.as_deref(),
            student: Some(&*self.student),
            settings,
        }
    }

    fn apply(&mut self, event: &Event) {
        self.instructor.apply(event);
        if let Some(vehicle) = self.vehicle.as_mut() {
            vehicle.calendar.apply(event);
        }
        self.student.apply(event);
    }
}

/// Keep the lookup indexes in step with an event. Shared by replay and live commits.
fn index_event(event: &Event, entities: &DashMap<Ulid, Ulid>, bookings: &DashMap<Ulid, BookingLocation>) {
    match event {
        Event::AvailabilityAdded(block) => {
            entities.insert(block.id, block.instructor_id);
        }
        Event::ScheduleReplaced { instructor_id, blocks } => {
            for block in blocks {
                entities.insert(block.id, *instructor_id);
            }
        }
        Event::AbsenceRecorded(absence) => {
            entities.insert(absence.id, absence.instructor_id);
        }
        Event::AbsenceRemoved { id, .. } => {
            entities.remove(id);
        }
        Event::BookingCreated(booking) | Event::OccurrenceMaterialized { booking, .. } => {
            bookings.insert(booking.id, BookingLocation::of(booking));
        }
        Event::BookingRescheduled { id, date, .. } => {
            if let Some(mut loc) = bookings.get_mut(id) {
                loc.date = *date;
            }
        }
        _ => {}
    }
}

/// Plain state rebuilt from the WAL before anything is shared.
#[derive(Default)]
struct Replayed {
    instructors: HashMap<Ulid, InstructorState>,
    vehicles: HashMap<Ulid, VehicleState>,
    students: HashMap<Ulid, Calendar>,
    patterns: HashMap<Ulid, PatternState>,
    settings: Option<SchedulingSettings>,
    entities: DashMap<Ulid, Ulid>,
    bookings: DashMap<Ulid, BookingLocation>,
}

impl Replayed {
    fn apply(&mut self, event: &Event) {
        index_event(event, &self.entities, &self.bookings);
        match event {
            Event::InstructorRegistered(profile) => {
                self.instructors.insert(profile.id, InstructorState::new(profile.clone()));
            }
            Event::VehicleRegistered(profile) => {
                self.vehicles.insert(profile.id, VehicleState::new(profile.clone()));
            }
            Event::SettingsUpdated(settings) => self.settings = Some(settings.clone()),
            Event::PatternCreated(pattern) => {
                self.patterns.insert(pattern.id, PatternState::new(pattern.clone()));
            }
            Event::PatternDeactivated { id } => self.apply_to_pattern(*id, event),
            Event::ExceptionAdded(exception) => self.apply_to_pattern(exception.pattern_id, event),
            Event::InstructorUpdated(InstructorProfile { id: instructor_id, .. })
            | Event::AvailabilityAdded(AvailabilityBlock { instructor_id, .. })
            | Event::AvailabilityDeactivated { instructor_id, .. }
            | Event::ScheduleReplaced { instructor_id, .. }
            | Event::AbsenceRecorded(AbsencePeriod { instructor_id, .. })
            | Event::AbsenceApproved { instructor_id, .. }
            | Event::AbsenceRemoved { instructor_id, .. } => {
                if let Some(st) = self.instructors.get_mut(instructor_id) {
                    st.apply(event);
                }
            }
            Event::BookingCreated(_)
            | Event::OccurrenceMaterialized { .. }
            | Event::BookingStatusChanged { .. }
            | Event::BookingRescheduled { .. } => self.apply_booking(event),
        }
    }

    fn apply_to_pattern(&mut self, id: Ulid, event: &Event) {
        if let Some(ps) = self.patterns.get_mut(&id) {
            ps.apply(event);
        }
    }

    fn apply_booking(&mut self, event: &Event) {
        let loc = match event {
            Event::BookingCreated(booking) | Event::OccurrenceMaterialized { booking, .. } => {
                BookingLocation::of(booking)
            }
            Event::BookingStatusChanged { id, .. } | Event::BookingRescheduled { id, .. } => {
                match self.bookings.get(id) {
                    Some(loc) => *loc,
                    None => return,
                }
            }
            _ => return,
        };
        if let Some(st) = self.instructors.get_mut(&loc.instructor_id) {
            st.apply(event);
        }
        if let Some(vid) = loc.vehicle_id
            && let Some(vs) = self.vehicles.get_mut(&vid)
        {
            vs.calendar.apply(event);
        }
        self.students.entry(loc.student_id).or_default().apply(event);
        if let Event::OccurrenceMaterialized { link, .. } = event {
            self.apply_to_pattern(link.pattern_id, event);
        }
    }
}

fn share<T>(map: HashMap<Ulid, T>) -> DashMap<Ulid, Arc<RwLock<T>>> {
    map.into_iter().map(|(id, v)| (id, Arc::new(RwLock::new(v)))).collect()
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replayed = Replayed::default();
        for event in &events {
            replayed.apply(event);
        }
        tracing::debug!(
            path = %wal_path.display(),
            events = events.len(),
            instructors = replayed.instructors.len(),
            patterns = replayed.patterns.len(),
            "replayed WAL"
        );

        Ok(Self {
            instructors: share(replayed.instructors),
            vehicles: share(replayed.vehicles),
            students: share(replayed.students),
            patterns: share(replayed.patterns),
            settings: RwLock::new(replayed.settings),
            entity_to_instructor: replayed.entities,
            booking_index: replayed.bookings,
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_instructor_state(&self, id: &Ulid) -> Option<SharedInstructor> {
        self.instructors.get(id).map(|e| e.value().clone())
    }

    pub fn get_vehicle_state(&self, id: &Ulid) -> Option<SharedVehicle> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    pub fn get_pattern_state(&self, id: &Ulid) -> Option<SharedPattern> {
        self.patterns.get(id).map(|e| e.value().clone())
    }

    pub fn get_instructor_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_instructor.get(entity_id).map(|e| *e.value())
    }

    pub fn locate_booking(&self, id: &Ulid) -> Option<BookingLocation> {
        self.booking_index.get(id).map(|e| *e.value())
    }

    /// Student calendars appear on first use.
    fn student_calendar(&self, id: Ulid) -> SharedCalendar {
        self.students
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(Calendar::new())))
            .value()
            .clone()
    }

    /// WAL-append + apply + notify for an event that touches one instructor only.
    pub(super) async fn persist_and_apply(
        &self,
        instructor_id: Ulid,
        st: &mut InstructorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        st.apply(event);
        index_event(event, &self.entity_to_instructor, &self.booking_index);
        self.notify.send(instructor_id, event);
        Ok(())
    }

    /// WAL-append + apply + notify for a booking event across all its parties.
    pub(super) async fn persist_booking(&self, guards: &mut BookingGuards, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        guards.apply(event);
        index_event(event, &self.entity_to_instructor, &self.booking_index);
        self.notify.send(guards.instructor.profile.id, event);
        Ok(())
    }

    /// Lookup entity → instructor, get instructor, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<InstructorState>), EngineError> {
        let instructor_id = self
            .get_instructor_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let st = self
            .get_instructor_state(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        Ok((instructor_id, st.write_owned().await))
    }

    /// Write-lock every party of a booking in the fixed order.
    pub(super) async fn lock_booking_parties(
        &self,
        instructor_id: Ulid,
        vehicle_id: Option<Ulid>,
        student_id: Ulid,
    ) -> Result<BookingGuards, EngineError> {
        let instructor = self
            .get_instructor_state(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let vehicle = match vehicle_id {
            Some(vid) => Some(self.get_vehicle_state(&vid).ok_or(EngineError::NotFound(vid))?),
            None => None,
        };
        let student = self.student_calendar(student_id);

        let instructor = instructor.write_owned().await;
        let vehicle = match vehicle {
            Some(v) => Some(v.write_owned().await),
            None => None,
        };
        let student = student.write_owned().await;
        Ok(BookingGuards {
            instructor,
            vehicle,
            student,
        })
    }
}
