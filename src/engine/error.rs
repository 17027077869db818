use thiserror::Error;
use ulid::Ulid;

use crate::model::Conflict;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid time format: {0:?} (expected HH:MM or HH:MM:SS)")]
    InvalidTimeFormat(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Commit rejected: the proposal double-books someone.
    #[error("booking conflicts: {}", summarize(.0))]
    Conflict(Vec<Conflict>),
    #[error("recurrence pattern {0} is inactive")]
    PatternInactive(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn summarize(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.kind.label())
        .collect::<Vec<_>>()
        .join(", ")
}
