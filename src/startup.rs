use crate::domains::executions::{ExecutionMethods, ExecutionStatus};
use crate::domains::leases::LeaseMethods;
use crate::domains::processes::supervisor::is_pid_alive;
use crate::domains::queue::QueueMethods;
use crate::infrastructure::database::Database;
use anyhow::Result;
use log::{info, warn};
use std::time::Duration;

/// What startup recovery decided for one execution this device still
/// leased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The supervised pid is still alive; supervision resumed via a pid
    /// watcher that finalizes once the process exits.
    Resumed { execution_id: String, pid: i64 },
    /// The pid is gone (or was never recorded); finalized as `killed`.
    Finalized { execution_id: String },
}

const RECOVERY_MESSAGE: &str = "recovered after runner restart";
const RESUMED_EXIT_MESSAGE: &str = "exit status unavailable after runner restart";
const PID_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Reconciles after a runner restart: every execution still marked
/// `running` under this device's lease is probed by pid. Dead processes
/// are finalized as `killed` and their queued follow-ups discarded;
/// live ones get a watcher that finalizes on exit.
pub async fn recover_after_restart(db: &Database, device_id: &str) -> Result<Vec<RecoveryAction>> {
    let leased = db.leased_executions_for_device(device_id)?;
    if leased.is_empty() {
        info!("Startup recovery: nothing to reconcile");
        return Ok(Vec::new());
    }

    let mut actions = Vec::with_capacity(leased.len());
    for (execution, lease) in leased {
        let alive = lease
            .pid
            .map(|pid| is_pid_alive(pid as i32))
            .unwrap_or(false);

        if let (true, Some(pid)) = (alive, lease.pid) {
            info!(
                "Startup recovery: execution {} still running as pid {pid}; resuming watch",
                execution.id
            );
            spawn_pid_watcher(db.clone(), device_id.to_string(), execution.id.clone(), pid);
            actions.push(RecoveryAction::Resumed {
                execution_id: execution.id,
                pid,
            });
        } else {
            warn!(
                "Startup recovery: execution {} has no live process; finalizing as killed",
                execution.id
            );
            db.set_execution_status(&execution.id, ExecutionStatus::Killed, Some(RECOVERY_MESSAGE))?;
            let _ = db.discard_queued_message(&execution.session_id);
            let _ = db.release_lease(&execution.id, device_id);
            actions.push(RecoveryAction::Finalized {
                execution_id: execution.id,
            });
        }
    }
    Ok(actions)
}

/// The resumed process was spawned by a previous runner incarnation, so
/// its exit status is unobservable; all the watcher can do is keep the
/// lease warm and finalize when the pid disappears.
fn spawn_pid_watcher(db: Database, device_id: String, execution_id: String, pid: i64) {
    tokio::spawn(async move {
        loop {
            if !is_pid_alive(pid as i32) {
                let _ = db.set_execution_status(
                    &execution_id,
                    ExecutionStatus::Failed,
                    Some(RESUMED_EXIT_MESSAGE),
                );
                let _ = db.discard_queued_message(
                    &db.get_execution(&execution_id)
                        .map(|e| e.session_id)
                        .unwrap_or_default(),
                );
                let _ = db.release_lease(&execution_id, &device_id);
                return;
            }
            if let Err(e) = db.heartbeat_lease(&execution_id, &device_id, 30_000) {
                warn!("Recovery watcher lost lease for {execution_id}: {e}");
                return;
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
    });
}
