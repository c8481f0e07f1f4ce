use super::db_leases::LeaseMethods;
use super::entity::RunnerLease;
use crate::infrastructure::database::Database;
use anyhow::Result;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Acquires and keeps execution leases alive for one device. Heartbeats run
/// at TTL/3 so a single missed beat never loses a healthy lease.
#[derive(Clone)]
pub struct LeaseManager {
    db: Database,
    device_id: String,
    ttl_ms: i64,
}

impl LeaseManager {
    pub fn new(db: Database, device_id: String, ttl_ms: i64) -> Self {
        Self {
            db,
            device_id,
            ttl_ms,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Claims the execution and starts the background heartbeat. Returns
    /// `AlreadyLeased` (inside the anyhow chain) when another device holds
    /// a fresh lease.
    pub fn acquire(&self, execution_id: &str, pid: Option<i64>) -> Result<LeaseGuard> {
        let lease = self
            .db
            .acquire_lease(execution_id, &self.device_id, pid, self.ttl_ms)?;
        Ok(LeaseGuard::start(
            self.db.clone(),
            self.device_id.clone(),
            lease,
            self.ttl_ms,
        ))
    }

    pub fn record_pid(&self, execution_id: &str, pid: i64) -> Result<()> {
        self.db.update_lease_pid(execution_id, &self.device_id, pid)
    }
}

/// Live lease over one execution. Dropping the guard stops the heartbeat;
/// `release` additionally removes the lease row as part of the terminal
/// transition.
pub struct LeaseGuard {
    db: Database,
    device_id: String,
    execution_id: String,
    heartbeat: JoinHandle<()>,
    lost: watch::Receiver<bool>,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("device_id", &self.device_id)
            .field("execution_id", &self.execution_id)
            .field("heartbeat", &self.heartbeat)
            .field("lost", &self.lost)
            .finish()
    }
}

impl LeaseGuard {
    fn start(db: Database, device_id: String, lease: RunnerLease, ttl_ms: i64) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        let execution_id = lease.execution_id.clone();
        let heartbeat = {
            let db = db.clone();
            let device_id = device_id.clone();
            let execution_id = execution_id.clone();
            let interval = Duration::from_millis((ttl_ms / 3).max(1) as u64);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match db.heartbeat_lease(&execution_id, &device_id, ttl_ms) {
                        Ok(()) => debug!("Heartbeat for execution {execution_id}"),
                        Err(e) => {
                            warn!("Lost lease on execution {execution_id}: {e}");
                            let _ = lost_tx.send(true);
                            break;
                        }
                    }
                }
            })
        };

        Self {
            db,
            device_id,
            execution_id,
            heartbeat,
            lost: lost_rx,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// True once a heartbeat failed because the lease row is gone or owned
    /// elsewhere; the orchestrator stops writing terminal state when set.
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Releases the lease row. Part of the terminal transition.
    pub fn release(self) -> Result<()> {
        self.heartbeat.abort();
        self.db.release_lease(&self.execution_id, &self.device_id)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Control-plane periodic job: reclaims expired leases and finalizes their
/// executions as `dropped`.
pub async fn run_orphan_sweep(db: Database, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match db.sweep_orphaned_executions() {
            Ok(dropped) if !dropped.is_empty() => {
                log::info!("Orphan sweep reclaimed {} execution(s)", dropped.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Orphan sweep failed: {e}"),
        }
    }
}
