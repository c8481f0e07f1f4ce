use super::entity::{QueuedMessage, QueuedMessageState};
use crate::events::StoreEvent;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

fn row_to_queued_message(row: &Row) -> rusqlite::Result<QueuedMessage> {
    let state: String = row.get("state")?;
    Ok(QueuedMessage {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        message: row.get("message")?,
        executor: row.get("executor")?,
        variant: row.get("variant")?,
        enqueueing_execution_id: row.get("enqueueing_execution_id")?,
        state: QueuedMessageState::parse(&state).unwrap_or(QueuedMessageState::Queued),
        queued_at: row.get("queued_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}

pub trait QueueMethods {
    /// Enqueue a follow-up for the session. If an active `queued` row
    /// exists its fields are overwritten and `queued_at` refreshed; a later
    /// message supersedes the earlier one instead of stacking behind it.
    fn enqueue_follow_up(
        &self,
        session_id: &str,
        message: &str,
        executor: Option<&str>,
        variant: Option<&str>,
        enqueueing_execution_id: Option<&str>,
    ) -> Result<QueuedMessage>;
    fn get_queue_status(&self, session_id: &str) -> Result<Option<QueuedMessage>>;
    fn consume_queued_message(&self, session_id: &str) -> Result<Option<QueuedMessage>>;
    fn discard_queued_message(&self, session_id: &str) -> Result<Option<QueuedMessage>>;
}

impl QueueMethods for Database {
    fn enqueue_follow_up(
        &self,
        session_id: &str,
        message: &str,
        executor: Option<&str>,
        variant: Option<&str>,
        enqueueing_execution_id: Option<&str>,
    ) -> Result<QueuedMessage> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();

        let updated = tx.execute(
            "UPDATE queued_messages
             SET message = ?2, executor = ?3, variant = ?4, enqueueing_execution_id = ?5, queued_at = ?6
             WHERE session_id = ?1 AND state = 'queued'",
            params![session_id, message, executor, variant, enqueueing_execution_id, now],
        )?;

        if updated == 0 {
            tx.execute(
                "INSERT INTO queued_messages
                     (id, session_id, message, executor, variant, enqueueing_execution_id, state, queued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    session_id,
                    message,
                    executor,
                    variant,
                    enqueueing_execution_id,
                    now
                ],
            )?;
        }

        let queued = tx.query_row(
            "SELECT * FROM queued_messages WHERE session_id = ?1 AND state = 'queued'",
            params![session_id],
            row_to_queued_message,
        )?;
        tx.commit()?;

        self.events.publish(StoreEvent::QueueUpdated {
            session_id: session_id.to_string(),
        });
        Ok(queued)
    }

    fn get_queue_status(&self, session_id: &str) -> Result<Option<QueuedMessage>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT * FROM queued_messages WHERE session_id = ?1 AND state = 'queued'",
                params![session_id],
                row_to_queued_message,
            )
            .optional()?)
    }

    fn consume_queued_message(&self, session_id: &str) -> Result<Option<QueuedMessage>> {
        let resolved = self.resolve_queue_slot(session_id, QueuedMessageState::Consumed)?;
        if resolved.is_some() {
            self.events.publish(StoreEvent::QueueConsumed {
                session_id: session_id.to_string(),
            });
        }
        Ok(resolved)
    }

    fn discard_queued_message(&self, session_id: &str) -> Result<Option<QueuedMessage>> {
        let resolved = self.resolve_queue_slot(session_id, QueuedMessageState::Discarded)?;
        if resolved.is_some() {
            self.events.publish(StoreEvent::QueueDiscarded {
                session_id: session_id.to_string(),
            });
        }
        Ok(resolved)
    }
}

impl Database {
    fn resolve_queue_slot(
        &self,
        session_id: &str,
        target: QueuedMessageState,
    ) -> Result<Option<QueuedMessage>> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        let queued = tx
            .query_row(
                "SELECT * FROM queued_messages WHERE session_id = ?1 AND state = 'queued'",
                params![session_id],
                row_to_queued_message,
            )
            .optional()?;

        let Some(mut queued) = queued else {
            return Ok(None);
        };

        let now = now_ms();
        tx.execute(
            "UPDATE queued_messages SET state = ?2, resolved_at = ?3 WHERE id = ?1",
            params![queued.id, target.as_str(), now],
        )?;
        tx.commit()?;

        queued.state = target;
        queued.resolved_at = Some(now);
        Ok(Some(queued))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::workspaces::db_workspaces::WorkspaceMethods;
    use crate::domains::workspaces::entity::{NewWorkspace, NewWorkspaceRepo};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Database, String) {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        let (_workspace, session) = db
            .create_workspace(&NewWorkspace {
                owner: "alice".into(),
                org: None,
                project: None,
                name: "W1".into(),
                branch: "feat/x".into(),
                repos: vec![NewWorkspaceRepo {
                    repo_id: "r-app".into(),
                    repo_name: "app".into(),
                    target_branch: "main".into(),
                    enabled: true,
                }],
                initial_session_title: None,
            })
            .unwrap();
        (tmp, db, session.id)
    }

    fn queued_rows(db: &Database, session_id: &str) -> i64 {
        db.get_conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM queued_messages WHERE session_id = ?1 AND state = 'queued'",
                params![session_id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn later_message_overwrites_the_slot() {
        let (_tmp, db, session_id) = fixture();

        db.enqueue_follow_up(&session_id, "also update README", None, None, None)
            .unwrap();
        assert_eq!(queued_rows(&db, &session_id), 1);

        let replaced = db
            .enqueue_follow_up(&session_id, "and bump version", None, None, None)
            .unwrap();
        assert_eq!(queued_rows(&db, &session_id), 1);
        assert_eq!(replaced.message, "and bump version");
    }

    #[test]
    fn consume_empties_the_slot() {
        let (_tmp, db, session_id) = fixture();
        db.enqueue_follow_up(&session_id, "follow up", Some("claude"), None, None)
            .unwrap();

        let consumed = db.consume_queued_message(&session_id).unwrap().unwrap();
        assert_eq!(consumed.message, "follow up");
        assert_eq!(consumed.state, QueuedMessageState::Consumed);
        assert!(consumed.resolved_at.is_some());

        assert!(db.get_queue_status(&session_id).unwrap().is_none());
        assert!(db.consume_queued_message(&session_id).unwrap().is_none());
    }

    #[test]
    fn discard_is_terminal_and_preserves_history() {
        let (_tmp, db, session_id) = fixture();
        db.enqueue_follow_up(&session_id, "throwaway", None, None, None)
            .unwrap();
        let discarded = db.discard_queued_message(&session_id).unwrap().unwrap();
        assert_eq!(discarded.state, QueuedMessageState::Discarded);

        // The terminal row stays on disk for history.
        let total: i64 = db
            .get_conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM queued_messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn enqueue_after_consume_creates_a_fresh_row() {
        let (_tmp, db, session_id) = fixture();
        db.enqueue_follow_up(&session_id, "first", None, None, None)
            .unwrap();
        db.consume_queued_message(&session_id).unwrap();
        db.enqueue_follow_up(&session_id, "second", None, None, None)
            .unwrap();

        assert_eq!(queued_rows(&db, &session_id), 1);
        let active = db.get_queue_status(&session_id).unwrap().unwrap();
        assert_eq!(active.message, "second");
    }
}
