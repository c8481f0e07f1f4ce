use super::db_approvals::ApprovalMethods;
use super::entity::Approval;
use crate::events::StoreEvent;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::Result;
use log::{debug, info};
use std::time::Duration;

/// What the open gates of an execution resolved to.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub denied: Vec<Approval>,
}

impl ApprovalOutcome {
    pub fn all_approved(&self) -> bool {
        self.denied.is_empty()
    }

    /// Short message for the execution document when a gate was denied.
    pub fn denial_message(&self) -> Option<String> {
        self.denied.first().map(|approval| {
            format!(
                "approval '{}' was {}",
                approval.kind,
                approval.status.as_str()
            )
        })
    }
}

const RESOLUTION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Brokers the durable request/response cycle. Requesting is a plain store
/// write; this type only adds the waiting and the expiry reaper.
#[derive(Clone)]
pub struct ApprovalBroker {
    db: Database,
}

impl ApprovalBroker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Blocks until no approval of `execution_id` is pending anymore and
    /// reports which ones resolved to a denial (rejected, expired, or
    /// cancelled). Resolutions arrive via store events; a poll fallback
    /// covers events lost to channel lag.
    pub async fn wait_for_resolution(&self, execution_id: &str) -> Result<ApprovalOutcome> {
        let mut events = self.db.events.subscribe();
        loop {
            let pending = self.db.pending_approvals_for_execution(execution_id)?;
            if pending.is_empty() {
                let denied = self
                    .db
                    .resolved_approvals_for_execution(execution_id)?
                    .into_iter()
                    .filter(|approval| approval.status.is_denial())
                    .collect();
                return Ok(ApprovalOutcome { denied });
            }

            debug!(
                "Execution {execution_id} suspended on {} pending approval(s)",
                pending.len()
            );
            match tokio::time::timeout(RESOLUTION_POLL_INTERVAL, events.recv()).await {
                Ok(Ok(StoreEvent::ApprovalResolved { execution_id: id, .. }))
                    if id == execution_id => {}
                // Any other event, lag, or timeout: re-check the store.
                _ => {}
            }
        }
    }
}

/// Background reaper transitioning overdue pending approvals to `expired`.
/// Runs control-plane-side for the life of the process.
pub async fn run_approval_reaper(db: Database, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match db.expire_due_approvals(now_ms()) {
            Ok(expired) if !expired.is_empty() => {
                info!("Expired {} overdue approval(s)", expired.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("Approval reaper sweep failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::approvals::entity::ApprovalStatus;
    use crate::domains::executions::db_executions::ExecutionMethods;
    use crate::domains::executions::entity::RunReason;
    use crate::domains::workspaces::db_workspaces::WorkspaceMethods;
    use crate::domains::workspaces::entity::{NewWorkspace, NewWorkspaceRepo};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Database, String, String, String) {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        let (workspace, session) = db
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
        let execution = db
            .start_execution(&workspace.id, &session.id, RunReason::CodingAgent, None)
            .unwrap();
        (tmp, db, workspace.id, session.id, execution.id)
    }

    #[tokio::test]
    async fn resolution_without_gates_is_immediate() {
        let (_tmp, db, _, _, execution_id) = fixture();
        let broker = ApprovalBroker::new(db);
        let outcome = broker.wait_for_resolution(&execution_id).await.unwrap();
        assert!(outcome.all_approved());
    }

    #[tokio::test]
    async fn waits_for_rejection_and_reports_denial() {
        let (_tmp, db, workspace_id, session_id, execution_id) = fixture();
        let approval = db
            .request_approval(
                &workspace_id,
                &session_id,
                &execution_id,
                "dangerous_write",
                "ok?",
                None,
            )
            .unwrap();

        let broker = ApprovalBroker::new(db.clone());
        let responder = {
            let db = db.clone();
            let approval_id = approval.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                db.respond_approval(&approval_id, ApprovalStatus::Rejected, "alice")
                    .unwrap();
            })
        };

        let outcome = broker.wait_for_resolution(&execution_id).await.unwrap();
        responder.await.unwrap();

        assert!(!outcome.all_approved());
        let message = outcome.denial_message().unwrap();
        assert!(message.contains("dangerous_write"));
        assert!(message.contains("rejected"));
    }

    #[tokio::test]
    async fn expiry_counts_as_denial() {
        let (_tmp, db, workspace_id, session_id, execution_id) = fixture();
        db.request_approval(
            &workspace_id,
            &session_id,
            &execution_id,
            "k",
            "p",
            Some(now_ms() - 1),
        )
        .unwrap();
        db.expire_due_approvals(now_ms()).unwrap();

        let broker = ApprovalBroker::new(db);
        let outcome = broker.wait_for_resolution(&execution_id).await.unwrap();
        assert!(!outcome.all_approved());
        assert_eq!(outcome.denied[0].status, ApprovalStatus::Expired);
    }
}
