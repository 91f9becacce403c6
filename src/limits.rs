use crate::model::Minute;

/// Largest party a single booking or hold may be for.
pub const MAX_PARTY_SIZE: u32 = 100;

/// Longest booking duration accepted from a caller (minutes).
pub const MAX_DURATION_MINUTES: Minute = 12 * 60;

pub const MAX_REASON_LEN: usize = 64;
pub const MAX_SLUG_LEN: usize = 128;
pub const MAX_FINGERPRINT_LEN: usize = 512;

/// Allocation retries when a concurrent commit takes the chosen table.
pub const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Alternatives per earlier/later/flexible bucket.
pub const MAX_SUGGESTIONS_PER_BUCKET: usize = 3;

/// Released lock rows older than this are pruned by the reaper.
pub const RELEASED_LOCK_RETENTION_MS: i64 = 24 * 3_600_000;

/// Bounds on a caller-chosen alternative search granularity (minutes).
pub const MIN_SEARCH_STEP_MINUTES: Minute = 15;
pub const MAX_SEARCH_STEP_MINUTES: Minute = 30;
