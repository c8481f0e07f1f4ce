use super::entity::{Session, SessionStatus, project_session_status};
use crate::domains::executions::entity::ExecutionStatus;
use crate::events::StoreEvent;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

pub(crate) fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let status: String = row.get("status")?;
    Ok(Session {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        title: row.get("title")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Idle),
        last_used_at: row.get("last_used_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub trait SessionMethods {
    fn create_session(&self, workspace_id: &str, title: Option<&str>) -> Result<Session>;
    fn get_session(&self, id: &str) -> Result<Session>;
    fn list_sessions(&self, workspace_id: &str) -> Result<Vec<Session>>;
    fn touch_session(&self, id: &str) -> Result<()>;
    /// Recomputes the session status from pending approvals and the most
    /// recent execution, and mirrors the result onto the owning workspace.
    /// This is the single place session status is derived.
    fn refresh_session_projection(&self, session_id: &str) -> Result<SessionStatus>;
}

impl SessionMethods for Database {
    fn create_session(&self, workspace_id: &str, title: Option<&str>) -> Result<Session> {
        let conn = self.get_conn()?;
        let now = now_ms();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sessions (id, workspace_id, title, status, last_used_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'idle', ?4, ?4, ?4)",
            params![id, workspace_id, title, now],
        )?;
        let session = conn.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )?;
        self.events.publish(StoreEvent::SessionAdded {
            workspace_id: workspace_id.to_string(),
            session_id: session.id.clone(),
        });
        Ok(session)
    }

    fn get_session(&self, id: &str) -> Result<Session> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .map_err(|e| anyhow!("Failed to get session '{id}': {e}"))
    }

    fn list_sessions(&self, workspace_id: &str) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM sessions WHERE workspace_id = ?1 ORDER BY last_used_at DESC",
        )?;
        let rows = stmt.query_map(params![workspace_id], row_to_session)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn touch_session(&self, id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = now_ms();
        conn.execute(
            "UPDATE sessions SET last_used_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    fn refresh_session_projection(&self, session_id: &str) -> Result<SessionStatus> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        let pending_approvals: i64 = tx.query_row(
            "SELECT COUNT(*) FROM approvals WHERE session_id = ?1 AND status = 'pending'",
            params![session_id],
            |row| row.get(0),
        )?;

        let latest: Option<String> = tx
            .query_row(
                "SELECT status FROM execution_processes
                 WHERE session_id = ?1
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT 1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        let projected = if pending_approvals > 0 {
            SessionStatus::NeedsAttention
        } else {
            latest
                .as_deref()
                .and_then(ExecutionStatus::parse)
                .map(project_session_status)
                .unwrap_or(SessionStatus::Idle)
        };

        let now = now_ms();
        tx.execute(
            "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![session_id, projected.as_str(), now],
        )?;
        tx.execute(
            "UPDATE workspaces SET status = ?2, updated_at = ?3
             WHERE id = (SELECT workspace_id FROM sessions WHERE id = ?1)",
            params![session_id, projected.as_str(), now],
        )?;
        tx.commit()?;

        self.events.publish(StoreEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            status: projected,
        });
        Ok(projected)
    }
}
