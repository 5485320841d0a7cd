//! Heartbeat staleness: detecting runs abandoned mid-execution.

use chrono::{DateTime, Duration, Utc};

use crate::run::RunRecord;

/// Default staleness threshold (10 minutes).
pub const DEFAULT_STALE_AFTER_SECONDS: u64 = 600;

/// Lower clamp for the staleness threshold.
pub const MIN_STALE_AFTER_SECONDS: u64 = 60;

/// Upper clamp for the staleness threshold (24 hours).
pub const MAX_STALE_AFTER_SECONDS: u64 = 86_400;

/// When to consider a running run abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub now: DateTime<Utc>,
    pub stale_after_seconds: u64,
}

impl StalenessPolicy {
    /// Build a policy, clamping the threshold to [60, 86400] seconds and
    /// defaulting to 10 minutes when unspecified.
    pub fn new(now: DateTime<Utc>, stale_after_seconds: Option<u64>) -> Self {
        let stale_after_seconds = stale_after_seconds
            .unwrap_or(DEFAULT_STALE_AFTER_SECONDS)
            .clamp(MIN_STALE_AFTER_SECONDS, MAX_STALE_AFTER_SECONDS);
        Self {
            now,
            stale_after_seconds,
        }
    }
}

/// Whether a run's last liveness signal is older than the threshold.
///
/// The last signal is `last_heartbeat_at`, falling back to `started_at`, then
/// `created_at` (first non-null in that priority order). A run is stale iff
/// `now - last_signal >= stale_after_seconds`.
pub fn is_heartbeat_stale(run: &RunRecord, policy: &StalenessPolicy) -> bool {
    let last_signal = run
        .snapshot
        .last_heartbeat_at
        .or(run.snapshot.started_at)
        .unwrap_or(run.created_at);
    policy.now.signed_duration_since(last_signal)
        >= Duration::seconds(policy.stale_after_seconds as i64)
}
