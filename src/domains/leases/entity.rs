use serde::{Deserialize, Serialize};

/// A short-lived claim over one execution held by exactly one runner.
/// Stale leases (no heartbeat within the TTL) are reclaimable by the
/// orphan sweep and by other runners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerLease {
    pub execution_id: String,
    pub device_id: String,
    /// Local pid of the supervised process, recorded so startup recovery
    /// can probe liveness after a runner restart.
    pub pid: Option<i64>,
    pub acquired_at: i64,
    pub heartbeat_at: i64,
    pub expires_at: i64,
}

impl RunnerLease {
    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at > now
    }
}
