use crate::model::Minute;

/// Maximum number of tenant engines one process will load.
pub const MAX_TENANTS: usize = 1024;

/// Maximum length of a tenant name.
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_INSTRUCTORS_PER_TENANT: usize = 10_000;

pub const MAX_VEHICLES_PER_TENANT: usize = 10_000;

/// Active and inactive blocks together.
pub const MAX_BLOCKS_PER_INSTRUCTOR: usize = 1_000;

pub const MAX_ABSENCES_PER_INSTRUCTOR: usize = 10_000;

pub const MAX_PATTERNS_PER_TENANT: usize = 100_000;

/// Widest inclusive date range a slot search may cover.
pub const MAX_SEARCH_DAYS: i64 = 366;

/// Safety cap on candidate dates visited by one expansion run.
pub const MAX_RECURRENCE_ITERATIONS: u32 = 366;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_REASON_LEN: usize = 1024;

/// Upper bound for any buffer setting or per-booking override (one day).
pub const MAX_BUFFER_MINUTES: Minute = 24 * 60;
