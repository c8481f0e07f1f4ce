use super::entity::{
    ExecutionProcess, ExecutionRepoState, ExecutionStatus, RepoStatePatch, RunReason,
};
use crate::domains::workspaces::SessionMethods;
use crate::events::StoreEvent;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::{Result, anyhow};
use log::warn;
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

pub(crate) fn row_to_execution(row: &Row) -> rusqlite::Result<ExecutionProcess> {
    let run_reason: String = row.get("run_reason")?;
    let status: String = row.get("status")?;
    Ok(ExecutionProcess {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        session_id: row.get("session_id")?,
        run_reason: RunReason::parse(&run_reason).unwrap_or(RunReason::System),
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Pending),
        executor: row.get("executor")?,
        queued_follow_up_consumed: row.get("queued_follow_up_consumed")?,
        cancel_requested: row.get("cancel_requested")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        error_message: row.get("error_message")?,
    })
}

fn row_to_repo_state(row: &Row) -> rusqlite::Result<ExecutionRepoState> {
    Ok(ExecutionRepoState {
        id: row.get("id")?,
        execution_id: row.get("execution_id")?,
        workspace_repo_id: row.get("workspace_repo_id")?,
        before_head_commit: row.get("before_head_commit")?,
        after_head_commit: row.get("after_head_commit")?,
        repo_state: row.get("repo_state")?,
    })
}

pub trait ExecutionMethods {
    /// Inserts a `pending` execution with a caller-chosen id. Used when the
    /// control plane mints the execution id inside a dispatch intent; the
    /// runner later claims it via [`ExecutionMethods::mark_execution_running`].
    fn create_pending_execution(
        &self,
        id: &str,
        workspace_id: &str,
        session_id: &str,
        run_reason: RunReason,
        executor: Option<&str>,
    ) -> Result<ExecutionProcess>;
    /// Creates an execution directly in `running` and projects session and
    /// workspace status. Used for runner-initiated executions (chained
    /// actions, queue follow-ups, session reset).
    fn start_execution(
        &self,
        workspace_id: &str,
        session_id: &str,
        run_reason: RunReason,
        executor: Option<&str>,
    ) -> Result<ExecutionProcess>;
    fn mark_execution_running(&self, id: &str) -> Result<bool>;
    /// Applies a status transition. Identical (execution, status) pairs are
    /// idempotent no-ops; a second, different terminal status is discarded
    /// so every execution has exactly one terminal transition. Returns
    /// whether the write was applied.
    fn set_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;
    fn get_execution(&self, id: &str) -> Result<ExecutionProcess>;
    fn list_session_executions(&self, session_id: &str) -> Result<Vec<ExecutionProcess>>;
    fn latest_execution(&self, session_id: &str) -> Result<Option<ExecutionProcess>>;
    fn non_terminal_executions(&self, session_id: &str) -> Result<Vec<ExecutionProcess>>;
    fn set_queued_follow_up_consumed(&self, id: &str) -> Result<()>;
    fn request_cancellation(&self, id: &str) -> Result<()>;
    fn upsert_execution_repo_state(
        &self,
        execution_id: &str,
        workspace_repo_id: &str,
        patch: &RepoStatePatch,
    ) -> Result<ExecutionRepoState>;
    fn execution_repo_states(&self, execution_id: &str) -> Result<Vec<ExecutionRepoState>>;
    fn get_execution_repo_state(
        &self,
        execution_id: &str,
        workspace_repo_id: &str,
    ) -> Result<Option<ExecutionRepoState>>;
    /// Latest `after_head_commit` recorded for this repo by an execution
    /// that started strictly before `before_started_at`. Session reset
    /// falls back to this when the target execution has no before-snapshot.
    fn prior_after_head_commit(
        &self,
        session_id: &str,
        before_started_at: i64,
        workspace_repo_id: &str,
    ) -> Result<Option<String>>;
    /// Marks the given execution and everything the session started at or
    /// after it as `dropped`, superseding their history after a session
    /// reset. This deliberately overwrites terminal statuses; it is not a
    /// lifecycle transition.
    fn supersede_executions_since(
        &self,
        session_id: &str,
        since_started_at: i64,
    ) -> Result<Vec<String>>;
}

impl ExecutionMethods for Database {
    fn create_pending_execution(
        &self,
        id: &str,
        workspace_id: &str,
        session_id: &str,
        run_reason: RunReason,
        executor: Option<&str>,
    ) -> Result<ExecutionProcess> {
        let conn = self.get_conn()?;
        let now = now_ms();
        conn.execute(
            "INSERT INTO execution_processes (id, workspace_id, session_id, run_reason, status, executor, started_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
            params![id, workspace_id, session_id, run_reason.as_str(), executor, now],
        )?;
        self.get_execution(id)
    }

    fn start_execution(
        &self,
        workspace_id: &str,
        session_id: &str,
        run_reason: RunReason,
        executor: Option<&str>,
    ) -> Result<ExecutionProcess> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();
        let id = Uuid::new_v4().to_string();

        tx.execute(
            "INSERT INTO execution_processes (id, workspace_id, session_id, run_reason, status, executor, started_at)
             VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6)",
            params![id, workspace_id, session_id, run_reason.as_str(), executor, now],
        )?;
        tx.execute(
            "UPDATE sessions SET status = 'running', last_used_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![session_id, now],
        )?;
        tx.execute(
            "UPDATE workspaces SET status = 'running', updated_at = ?2 WHERE id = ?1",
            params![workspace_id, now],
        )?;
        let execution = tx.query_row(
            "SELECT * FROM execution_processes WHERE id = ?1",
            params![id],
            row_to_execution,
        )?;
        tx.commit()?;

        self.events.publish(StoreEvent::ExecutionStarted {
            execution_id: execution.id.clone(),
            session_id: session_id.to_string(),
        });
        Ok(execution)
    }

    fn mark_execution_running(&self, id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE execution_processes SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        drop(conn);
        if updated > 0 {
            let execution = self.get_execution(id)?;
            self.touch_session(&execution.session_id)?;
            self.refresh_session_projection(&execution.session_id)?;
            self.events.publish(StoreEvent::ExecutionStarted {
                execution_id: id.to_string(),
                session_id: execution.session_id,
            });
        }
        Ok(updated > 0)
    }

    fn set_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        let current = tx.query_row(
            "SELECT * FROM execution_processes WHERE id = ?1",
            params![id],
            row_to_execution,
        )?;

        if current.status == status {
            return Ok(false);
        }
        if current.status.is_terminal() {
            warn!(
                "Discarding duplicate terminal report for execution {id}: {} -> {}",
                current.status.as_str(),
                status.as_str()
            );
            return Ok(false);
        }

        let now = now_ms();
        if status.is_terminal() {
            tx.execute(
                "UPDATE execution_processes
                 SET status = ?2, completed_at = ?3, error_message = COALESCE(?4, error_message)
                 WHERE id = ?1",
                params![id, status.as_str(), now, error_message],
            )?;
        } else {
            tx.execute(
                "UPDATE execution_processes SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
        }
        tx.commit()?;

        self.refresh_session_projection(&current.session_id)?;
        self.events.publish(StoreEvent::ExecutionStatusChanged {
            execution_id: id.to_string(),
            session_id: current.session_id,
            status,
        });
        Ok(true)
    }

    fn get_execution(&self, id: &str) -> Result<ExecutionProcess> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT * FROM execution_processes WHERE id = ?1",
            params![id],
            row_to_execution,
        )
        .map_err(|e| anyhow!("Failed to get execution '{id}': {e}"))
    }

    fn list_session_executions(&self, session_id: &str) -> Result<Vec<ExecutionProcess>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM execution_processes WHERE session_id = ?1 ORDER BY started_at, rowid",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_execution)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn latest_execution(&self, session_id: &str) -> Result<Option<ExecutionProcess>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT * FROM execution_processes WHERE session_id = ?1
                 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                params![session_id],
                row_to_execution,
            )
            .optional()?)
    }

    fn non_terminal_executions(&self, session_id: &str) -> Result<Vec<ExecutionProcess>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM execution_processes
             WHERE session_id = ?1 AND status IN ('pending', 'running')
             ORDER BY started_at",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_execution)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn set_queued_follow_up_consumed(&self, id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE execution_processes SET queued_follow_up_consumed = TRUE WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn request_cancellation(&self, id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE execution_processes SET cancel_requested = TRUE
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id],
        )?;
        drop(conn);
        self.events.publish(StoreEvent::ExecutionCancelRequested {
            execution_id: id.to_string(),
        });
        Ok(())
    }

    fn upsert_execution_repo_state(
        &self,
        execution_id: &str,
        workspace_repo_id: &str,
        patch: &RepoStatePatch,
    ) -> Result<ExecutionRepoState> {
        let conn = self.get_conn()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO execution_process_repo_states
                 (id, execution_id, workspace_repo_id, before_head_commit, after_head_commit, repo_state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(execution_id, workspace_repo_id) DO UPDATE SET
                 before_head_commit = COALESCE(excluded.before_head_commit, before_head_commit),
                 after_head_commit = COALESCE(excluded.after_head_commit, after_head_commit),
                 repo_state = COALESCE(excluded.repo_state, repo_state)",
            params![
                id,
                execution_id,
                workspace_repo_id,
                patch.before_head_commit,
                patch.after_head_commit,
                patch.repo_state
            ],
        )?;
        let state = conn.query_row(
            "SELECT * FROM execution_process_repo_states
             WHERE execution_id = ?1 AND workspace_repo_id = ?2",
            params![execution_id, workspace_repo_id],
            row_to_repo_state,
        )?;
        drop(conn);
        self.events.publish(StoreEvent::RepoStateRecorded {
            execution_id: execution_id.to_string(),
            workspace_repo_id: workspace_repo_id.to_string(),
        });
        Ok(state)
    }

    fn execution_repo_states(&self, execution_id: &str) -> Result<Vec<ExecutionRepoState>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM execution_process_repo_states WHERE execution_id = ?1",
        )?;
        let rows = stmt.query_map(params![execution_id], row_to_repo_state)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_execution_repo_state(
        &self,
        execution_id: &str,
        workspace_repo_id: &str,
    ) -> Result<Option<ExecutionRepoState>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT * FROM execution_process_repo_states
                 WHERE execution_id = ?1 AND workspace_repo_id = ?2",
                params![execution_id, workspace_repo_id],
                row_to_repo_state,
            )
            .optional()?)
    }

    fn prior_after_head_commit(
        &self,
        session_id: &str,
        before_started_at: i64,
        workspace_repo_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT rs.after_head_commit
                 FROM execution_process_repo_states rs
                 JOIN execution_processes e ON e.id = rs.execution_id
                 WHERE e.session_id = ?1
                   AND e.started_at < ?2
                   AND rs.workspace_repo_id = ?3
                   AND rs.after_head_commit IS NOT NULL
                 ORDER BY e.started_at DESC, e.rowid DESC
                 LIMIT 1",
                params![session_id, before_started_at, workspace_repo_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn supersede_executions_since(
        &self,
        session_id: &str,
        since_started_at: i64,
    ) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM execution_processes
                 WHERE session_id = ?1 AND started_at >= ?2 AND status != 'dropped'
                 ORDER BY started_at",
            )?;
            let rows = stmt.query_map(params![session_id, since_started_at], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let now = now_ms();
        tx.execute(
            "UPDATE execution_processes
             SET status = 'dropped', completed_at = COALESCE(completed_at, ?3)
             WHERE session_id = ?1 AND started_at >= ?2 AND status != 'dropped'",
            params![session_id, since_started_at, now],
        )?;
        tx.commit()?;

        for id in &ids {
            self.events.publish(StoreEvent::ExecutionStatusChanged {
                execution_id: id.clone(),
                session_id: session_id.to_string(),
                status: ExecutionStatus::Dropped,
            });
        }
        Ok(ids)
    }
}
