use super::envelope::ExecutionIntent;
use crate::domains::executions::entity::RunReason;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEnrollment {
    pub device_id: String,
    pub owning_principal: String,
    pub public_key: String,
    pub enrolled_at: i64,
    pub revoked_at: Option<i64>,
}

impl DeviceEnrollment {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAuditEntry {
    pub id: String,
    pub intent_id: String,
    pub reason: String,
    pub detail: String,
    pub rejected_at: i64,
}

fn row_to_enrollment(row: &Row) -> rusqlite::Result<DeviceEnrollment> {
    Ok(DeviceEnrollment {
        device_id: row.get("device_id")?,
        owning_principal: row.get("owning_principal")?,
        public_key: row.get("public_key")?,
        enrolled_at: row.get("enrolled_at")?,
        revoked_at: row.get("revoked_at")?,
    })
}

fn row_to_intent(row: &Row) -> rusqlite::Result<ExecutionIntent> {
    let run_reason: String = row.get("run_reason")?;
    let params_json: String = row.get("params")?;
    Ok(ExecutionIntent {
        intent_id: row.get("id")?,
        nonce: row.get("nonce")?,
        target_device_id: row.get("target_device_id")?,
        issued_at: row.get("issued_at")?,
        ttl_ms: row.get("ttl_ms")?,
        workspace_id: row.get("workspace_id")?,
        session_id: row.get("session_id")?,
        execution_id: row.get("execution_id")?,
        run_reason: RunReason::parse(&run_reason).unwrap_or(RunReason::System),
        command_kind: row.get("command_kind")?,
        params: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
        principal: row.get("principal")?,
        signature: row.get("signature")?,
    })
}

fn row_to_audit(row: &Row) -> rusqlite::Result<DispatchAuditEntry> {
    Ok(DispatchAuditEntry {
        id: row.get("id")?,
        intent_id: row.get("intent_id")?,
        reason: row.get("reason")?,
        detail: row.get("detail")?,
        rejected_at: row.get("rejected_at")?,
    })
}

pub trait DispatchMethods {
    fn enroll_device(
        &self,
        device_id: &str,
        owning_principal: &str,
        public_key: &str,
    ) -> Result<DeviceEnrollment>;
    fn get_enrollment(&self, device_id: &str) -> Result<Option<DeviceEnrollment>>;
    fn revoke_device(&self, device_id: &str) -> Result<()>;
    /// True when the principal may act on the workspace. Org-level grants
    /// live in the identity provider; the store only knows owners.
    fn is_principal_authorized(&self, principal: &str, workspace_id: &str) -> Result<bool>;
    /// Control-plane side: persists the intent and creates the referenced
    /// execution in `pending`, atomically.
    fn submit_intent(&self, intent: &ExecutionIntent) -> Result<()>;
    fn pending_intents_for_device(&self, device_id: &str, limit: u32)
    -> Result<Vec<ExecutionIntent>>;
    /// Idempotent acknowledgement keyed by (intent, nonce). Returns `false`
    /// when the intent was already acked, without touching anything.
    fn ack_intent(&self, intent_id: &str, nonce: &str) -> Result<bool>;
    /// NACK with a classified reason; writes the audit entry in the same
    /// transaction. Already-acked intents are left untouched.
    fn reject_intent(&self, intent_id: &str, reason: &str, detail: &str) -> Result<()>;
    fn dispatch_audit_entries(&self, intent_id: &str) -> Result<Vec<DispatchAuditEntry>>;
}

impl DispatchMethods for Database {
    fn enroll_device(
        &self,
        device_id: &str,
        owning_principal: &str,
        public_key: &str,
    ) -> Result<DeviceEnrollment> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO device_enrollments (device_id, owning_principal, public_key, enrolled_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id) DO UPDATE SET
                 owning_principal = excluded.owning_principal,
                 public_key = excluded.public_key,
                 revoked_at = NULL",
            params![device_id, owning_principal, public_key, now_ms()],
        )?;
        conn.query_row(
            "SELECT * FROM device_enrollments WHERE device_id = ?1",
            params![device_id],
            row_to_enrollment,
        )
        .map_err(Into::into)
    }

    fn get_enrollment(&self, device_id: &str) -> Result<Option<DeviceEnrollment>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT * FROM device_enrollments WHERE device_id = ?1",
                params![device_id],
                row_to_enrollment,
            )
            .optional()?)
    }

    fn revoke_device(&self, device_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE device_enrollments SET revoked_at = ?2 WHERE device_id = ?1",
            params![device_id, now_ms()],
        )?;
        Ok(())
    }

    fn is_principal_authorized(&self, principal: &str, workspace_id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let owner: Option<String> = conn
            .query_row(
                "SELECT owner FROM workspaces WHERE id = ?1",
                params![workspace_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner.as_deref() == Some(principal))
    }

    fn submit_intent(&self, intent: &ExecutionIntent) -> Result<()> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO execution_intents
                 (id, nonce, target_device_id, issued_at, ttl_ms, workspace_id, session_id,
                  execution_id, run_reason, command_kind, params, principal, signature, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'pending')",
            params![
                intent.intent_id,
                intent.nonce,
                intent.target_device_id,
                intent.issued_at,
                intent.ttl_ms,
                intent.workspace_id,
                intent.session_id,
                intent.execution_id,
                intent.run_reason.as_str(),
                intent.command_kind,
                intent.params.to_string(),
                intent.principal,
                intent.signature
            ],
        )?;
        tx.execute(
            "INSERT INTO execution_processes (id, workspace_id, session_id, run_reason, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                intent.execution_id,
                intent.workspace_id,
                intent.session_id,
                intent.run_reason.as_str(),
                now_ms()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn pending_intents_for_device(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionIntent>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM execution_intents
             WHERE target_device_id = ?1 AND state = 'pending'
             ORDER BY issued_at
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit], row_to_intent)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn ack_intent(&self, intent_id: &str, nonce: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT nonce, state FROM execution_intents WHERE id = ?1",
                params![intent_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((stored_nonce, state)) = row else {
            return Err(anyhow!("Intent '{intent_id}' not found"));
        };
        if stored_nonce != nonce {
            return Err(anyhow!("Nonce mismatch acknowledging intent '{intent_id}'"));
        }
        if state == "acked" {
            return Ok(false);
        }

        tx.execute(
            "UPDATE execution_intents SET state = 'acked', acked_at = ?2 WHERE id = ?1",
            params![intent_id, now_ms()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn reject_intent(&self, intent_id: &str, reason: &str, detail: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE execution_intents SET state = 'rejected' WHERE id = ?1 AND state = 'pending'",
            params![intent_id],
        )?;
        tx.execute(
            "INSERT INTO dispatch_audit (id, intent_id, reason, detail, rejected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Uuid::new_v4().to_string(), intent_id, reason, detail, now_ms()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn dispatch_audit_entries(&self, intent_id: &str) -> Result<Vec<DispatchAuditEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM dispatch_audit WHERE intent_id = ?1 ORDER BY rejected_at",
        )?;
        let rows = stmt.query_map(params![intent_id], row_to_audit)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
