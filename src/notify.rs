use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Change feed per instructor: every committed event that touches an
/// instructor's calendar, availability, absences or patterns.
///
/// Slow subscribers see `RecvError::Lagged` and skip ahead; the WAL is the
/// record, this is only a signal.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to an instructor's events. Creates the channel if needed.
    pub fn subscribe(&self, instructor_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(instructor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, instructor_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&instructor_id)
            && sender.send(event.clone()).is_err()
        {
            tracing::trace!(%instructor_id, "no live subscribers");
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }
}
