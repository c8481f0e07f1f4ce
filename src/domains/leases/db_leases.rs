use super::entity::RunnerLease;
use crate::domains::executions::db_executions::ExecutionMethods;
use crate::domains::executions::entity::{ExecutionProcess, ExecutionStatus};
use crate::domains::queue::QueueMethods;
use crate::errors::RunnerError;
use crate::events::StoreEvent;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::{Result, anyhow};
use log::{info, warn};
use rusqlite::{OptionalExtension, Row, params};

fn row_to_lease(row: &Row) -> rusqlite::Result<RunnerLease> {
    Ok(RunnerLease {
        execution_id: row.get("execution_id")?,
        device_id: row.get("device_id")?,
        pid: row.get("pid")?,
        acquired_at: row.get("acquired_at")?,
        heartbeat_at: row.get("heartbeat_at")?,
        expires_at: row.get("expires_at")?,
    })
}

pub trait LeaseMethods {
    /// Atomically claims the execution for `device_id`. A fresh lease held
    /// by another device fails with [`RunnerError::AlreadyLeased`]; a stale
    /// one is overwritten; re-acquiring an own lease refreshes it.
    fn acquire_lease(
        &self,
        execution_id: &str,
        device_id: &str,
        pid: Option<i64>,
        ttl_ms: i64,
    ) -> Result<RunnerLease>;
    fn heartbeat_lease(&self, execution_id: &str, device_id: &str, ttl_ms: i64) -> Result<()>;
    fn update_lease_pid(&self, execution_id: &str, device_id: &str, pid: i64) -> Result<()>;
    fn release_lease(&self, execution_id: &str, device_id: &str) -> Result<()>;
    fn get_lease(&self, execution_id: &str) -> Result<Option<RunnerLease>>;
    /// Control-plane sweep: every non-terminal execution whose lease has
    /// expired is finalized as `dropped` and its session's queued follow-up
    /// is discarded. Returns the affected execution ids.
    fn sweep_orphaned_executions(&self) -> Result<Vec<String>>;
    /// Running executions still leased to this device, used for startup
    /// recovery after a runner restart.
    fn leased_executions_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<(ExecutionProcess, RunnerLease)>>;
}

impl LeaseMethods for Database {
    fn acquire_lease(
        &self,
        execution_id: &str,
        device_id: &str,
        pid: Option<i64>,
        ttl_ms: i64,
    ) -> Result<RunnerLease> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();

        let existing = tx
            .query_row(
                "SELECT * FROM runner_leases WHERE execution_id = ?1",
                params![execution_id],
                row_to_lease,
            )
            .optional()?;

        if let Some(lease) = existing {
            if lease.device_id != device_id && lease.is_fresh(now) {
                return Err(anyhow!(RunnerError::AlreadyLeased {
                    execution_id: execution_id.to_string(),
                    holder_device_id: lease.device_id,
                }));
            }
            if lease.device_id != device_id {
                info!(
                    "Reclaiming stale lease on execution {execution_id} from device {}",
                    lease.device_id
                );
            }
            tx.execute("DELETE FROM runner_leases WHERE execution_id = ?1", params![execution_id])?;
        }

        tx.execute(
            "INSERT INTO runner_leases (execution_id, device_id, pid, acquired_at, heartbeat_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
            params![execution_id, device_id, pid, now, now + ttl_ms],
        )?;
        let lease = tx.query_row(
            "SELECT * FROM runner_leases WHERE execution_id = ?1",
            params![execution_id],
            row_to_lease,
        )?;
        tx.commit()?;
        Ok(lease)
    }

    fn heartbeat_lease(&self, execution_id: &str, device_id: &str, ttl_ms: i64) -> Result<()> {
        let conn = self.get_conn()?;
        let now = now_ms();
        let updated = conn.execute(
            "UPDATE runner_leases SET heartbeat_at = ?3, expires_at = ?4
             WHERE execution_id = ?1 AND device_id = ?2",
            params![execution_id, device_id, now, now + ttl_ms],
        )?;
        if updated == 0 {
            return Err(anyhow!(RunnerError::LeaseLost {
                execution_id: execution_id.to_string(),
            }));
        }
        Ok(())
    }

    fn update_lease_pid(&self, execution_id: &str, device_id: &str, pid: i64) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE runner_leases SET pid = ?3 WHERE execution_id = ?1 AND device_id = ?2",
            params![execution_id, device_id, pid],
        )?;
        Ok(())
    }

    fn release_lease(&self, execution_id: &str, device_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM runner_leases WHERE execution_id = ?1 AND device_id = ?2",
            params![execution_id, device_id],
        )?;
        Ok(())
    }

    fn get_lease(&self, execution_id: &str) -> Result<Option<RunnerLease>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT * FROM runner_leases WHERE execution_id = ?1",
                params![execution_id],
                row_to_lease,
            )
            .optional()?)
    }

    fn sweep_orphaned_executions(&self) -> Result<Vec<String>> {
        let now = now_ms();
        let orphaned: Vec<(String, String)> = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(
                "SELECT e.id, e.session_id
                 FROM execution_processes e
                 JOIN runner_leases l ON l.execution_id = e.id
                 WHERE e.status IN ('pending', 'running') AND l.expires_at < ?1",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut dropped = Vec::with_capacity(orphaned.len());
        for (execution_id, session_id) in orphaned {
            warn!("Orphan sweep: dropping execution {execution_id} with expired lease");
            self.set_execution_status(&execution_id, ExecutionStatus::Dropped, None)?;
            if self.discard_queued_message(&session_id)?.is_some() {
                info!("Orphan sweep: discarded queued follow-up of session {session_id}");
            }
            let conn = self.get_conn()?;
            conn.execute(
                "DELETE FROM runner_leases WHERE execution_id = ?1",
                params![execution_id],
            )?;
            drop(conn);
            self.events.publish(StoreEvent::LeaseReclaimed {
                execution_id: execution_id.clone(),
            });
            dropped.push(execution_id);
        }
        Ok(dropped)
    }

    fn leased_executions_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<(ExecutionProcess, RunnerLease)>> {
        let ids: Vec<String> = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(
                "SELECT e.id
                 FROM execution_processes e
                 JOIN runner_leases l ON l.execution_id = e.id
                 WHERE l.device_id = ?1 AND e.status = 'running'
                 ORDER BY e.started_at",
            )?;
            let rows = stmt.query_map(params![device_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let execution = self.get_execution(&id)?;
            if let Some(lease) = self.get_lease(&id)? {
                out.push((execution, lease));
            }
        }
        Ok(out)
    }
}
