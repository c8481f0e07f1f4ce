use super::entity::{Approval, ApprovalStatus};
use crate::domains::workspaces::SessionMethods;
use crate::events::StoreEvent;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::{Result, anyhow};
use rusqlite::{Row, params};
use uuid::Uuid;

fn row_to_approval(row: &Row) -> rusqlite::Result<Approval> {
    let status: String = row.get("status")?;
    Ok(Approval {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        session_id: row.get("session_id")?,
        execution_id: row.get("execution_id")?,
        kind: row.get("kind")?,
        prompt: row.get("prompt")?,
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
        requested_at: row.get("requested_at")?,
        expires_at: row.get("expires_at")?,
        responded_at: row.get("responded_at")?,
        responded_by: row.get("responded_by")?,
    })
}

pub trait ApprovalMethods {
    /// Inserts a pending approval and flips session and workspace to
    /// `needs_attention` in the same transaction.
    fn request_approval(
        &self,
        workspace_id: &str,
        session_id: &str,
        execution_id: &str,
        kind: &str,
        prompt: &str,
        expires_at: Option<i64>,
    ) -> Result<Approval>;
    /// Resolves a pending approval with `approved` or `rejected`. Fails if
    /// the approval is no longer pending.
    fn respond_approval(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        responded_by: &str,
    ) -> Result<Approval>;
    fn get_approval(&self, id: &str) -> Result<Approval>;
    fn pending_approvals_for_execution(&self, execution_id: &str) -> Result<Vec<Approval>>;
    fn pending_approvals_for_session(&self, session_id: &str) -> Result<Vec<Approval>>;
    fn resolved_approvals_for_execution(&self, execution_id: &str) -> Result<Vec<Approval>>;
    /// Cancels every pending approval of an execution, used when the
    /// execution is killed or dropped while a gate is open.
    fn cancel_pending_approvals(&self, execution_id: &str) -> Result<Vec<Approval>>;
    /// Reaper entry point: transitions every pending approval whose
    /// `expires_at` has passed to `expired` and re-projects the sessions.
    fn expire_due_approvals(&self, now: i64) -> Result<Vec<Approval>>;
}

impl ApprovalMethods for Database {
    fn request_approval(
        &self,
        workspace_id: &str,
        session_id: &str,
        execution_id: &str,
        kind: &str,
        prompt: &str,
        expires_at: Option<i64>,
    ) -> Result<Approval> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();
        let id = Uuid::new_v4().to_string();

        tx.execute(
            "INSERT INTO approvals
                 (id, workspace_id, session_id, execution_id, kind, prompt, status, requested_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
            params![id, workspace_id, session_id, execution_id, kind, prompt, now, expires_at],
        )?;
        tx.execute(
            "UPDATE sessions SET status = 'needs_attention', updated_at = ?2 WHERE id = ?1",
            params![session_id, now],
        )?;
        tx.execute(
            "UPDATE workspaces SET status = 'needs_attention', updated_at = ?2 WHERE id = ?1",
            params![workspace_id, now],
        )?;

        let approval = tx.query_row(
            "SELECT * FROM approvals WHERE id = ?1",
            params![id],
            row_to_approval,
        )?;
        tx.commit()?;

        self.events.publish(StoreEvent::ApprovalRequested {
            approval_id: approval.id.clone(),
            session_id: session_id.to_string(),
            execution_id: execution_id.to_string(),
        });
        Ok(approval)
    }

    fn respond_approval(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        responded_by: &str,
    ) -> Result<Approval> {
        if !matches!(status, ApprovalStatus::Approved | ApprovalStatus::Rejected) {
            return Err(anyhow!(
                "Approvals can only be responded with approved or rejected, got '{}'",
                status.as_str()
            ));
        }

        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();

        let updated = tx.execute(
            "UPDATE approvals
             SET status = ?2, responded_at = ?3, responded_by = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![approval_id, status.as_str(), now, responded_by],
        )?;
        if updated == 0 {
            return Err(anyhow!("Approval '{approval_id}' is not pending"));
        }

        let approval = tx.query_row(
            "SELECT * FROM approvals WHERE id = ?1",
            params![approval_id],
            row_to_approval,
        )?;
        tx.commit()?;

        self.refresh_session_projection(&approval.session_id)?;
        self.events.publish(StoreEvent::ApprovalResolved {
            approval_id: approval.id.clone(),
            execution_id: approval.execution_id.clone(),
            status,
        });
        Ok(approval)
    }

    fn get_approval(&self, id: &str) -> Result<Approval> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT * FROM approvals WHERE id = ?1",
            params![id],
            row_to_approval,
        )
        .map_err(|e| anyhow!("Failed to get approval '{id}': {e}"))
    }

    fn pending_approvals_for_execution(&self, execution_id: &str) -> Result<Vec<Approval>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM approvals
             WHERE execution_id = ?1 AND status = 'pending'
             ORDER BY requested_at",
        )?;
        let rows = stmt.query_map(params![execution_id], row_to_approval)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn pending_approvals_for_session(&self, session_id: &str) -> Result<Vec<Approval>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM approvals
             WHERE session_id = ?1 AND status = 'pending'
             ORDER BY requested_at",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_approval)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn resolved_approvals_for_execution(&self, execution_id: &str) -> Result<Vec<Approval>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM approvals
             WHERE execution_id = ?1 AND status != 'pending'
             ORDER BY requested_at",
        )?;
        let rows = stmt.query_map(params![execution_id], row_to_approval)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn cancel_pending_approvals(&self, execution_id: &str) -> Result<Vec<Approval>> {
        let pending = self.pending_approvals_for_execution(execution_id)?;
        if pending.is_empty() {
            return Ok(pending);
        }

        let conn = self.get_conn()?;
        let now = now_ms();
        conn.execute(
            "UPDATE approvals SET status = 'cancelled', responded_at = ?2
             WHERE execution_id = ?1 AND status = 'pending'",
            params![execution_id, now],
        )?;
        drop(conn);

        let mut cancelled = Vec::with_capacity(pending.len());
        for approval in pending {
            self.refresh_session_projection(&approval.session_id)?;
            self.events.publish(StoreEvent::ApprovalResolved {
                approval_id: approval.id.clone(),
                execution_id: approval.execution_id.clone(),
                status: ApprovalStatus::Cancelled,
            });
            cancelled.push(Approval {
                status: ApprovalStatus::Cancelled,
                responded_at: Some(now),
                ..approval
            });
        }
        Ok(cancelled)
    }

    fn expire_due_approvals(&self, now: i64) -> Result<Vec<Approval>> {
        let conn = self.get_conn()?;
        let due: Vec<Approval> = {
            let mut stmt = conn.prepare(
                "SELECT * FROM approvals
                 WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
            )?;
            let rows = stmt.query_map(params![now], row_to_approval)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if due.is_empty() {
            return Ok(Vec::new());
        }

        conn.execute(
            "UPDATE approvals SET status = 'expired', responded_at = ?1
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        drop(conn);

        let mut expired = Vec::with_capacity(due.len());
        for approval in due {
            self.refresh_session_projection(&approval.session_id)?;
            self.events.publish(StoreEvent::ApprovalResolved {
                approval_id: approval.id.clone(),
                execution_id: approval.execution_id.clone(),
                status: ApprovalStatus::Expired,
            });
            expired.push(Approval {
                status: ApprovalStatus::Expired,
                responded_at: Some(now),
                ..approval
            });
        }
        Ok(expired)
    }
}
