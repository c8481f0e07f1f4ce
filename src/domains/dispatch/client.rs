use super::db_dispatch::{DeviceEnrollment, DispatchMethods};
use super::envelope::ExecutionIntent;
use super::nonce::NonceCache;
use crate::errors::RunnerError;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::{Arc, Mutex};

/// Everything the dispatch client needs from the control plane, behind one
/// seam. The production implementation is the store itself; the runner only
/// ever calls outward through this trait.
#[async_trait]
pub trait IntentTransport: Send + Sync {
    async fn pull(&self, device_id: &str, limit: u32) -> Result<Vec<ExecutionIntent>>;
    async fn ack(&self, intent_id: &str, nonce: &str) -> Result<()>;
    async fn nack(&self, intent_id: &str, reason: &str, detail: &str) -> Result<()>;
    async fn enrollment(&self, device_id: &str) -> Result<Option<DeviceEnrollment>>;
    async fn authorized(&self, principal: &str, workspace_id: &str) -> Result<bool>;
}

#[async_trait]
impl IntentTransport for Database {
    async fn pull(&self, device_id: &str, limit: u32) -> Result<Vec<ExecutionIntent>> {
        self.pending_intents_for_device(device_id, limit)
    }

    async fn ack(&self, intent_id: &str, nonce: &str) -> Result<()> {
        self.ack_intent(intent_id, nonce).map(|_| ())
    }

    async fn nack(&self, intent_id: &str, reason: &str, detail: &str) -> Result<()> {
        self.reject_intent(intent_id, reason, detail)
    }

    async fn enrollment(&self, device_id: &str) -> Result<Option<DeviceEnrollment>> {
        self.get_enrollment(device_id)
    }

    async fn authorized(&self, principal: &str, workspace_id: &str) -> Result<bool> {
        self.is_principal_authorized(principal, workspace_id)
    }
}

const PULL_BATCH: u32 = 16;
pub const NONCE_WINDOW: usize = 1024;

/// Pulls execution intents, enforces the envelope policy, and hands the
/// survivors to the orchestrator. Rejections are NACKed with a classified
/// reason; the control plane writes the audit entry.
pub struct DispatchClient {
    transport: Arc<dyn IntentTransport>,
    device_id: String,
    nonces: Mutex<NonceCache>,
}

impl DispatchClient {
    pub fn new(transport: Arc<dyn IntentTransport>, device_id: String) -> Self {
        Self {
            transport,
            device_id,
            nonces: Mutex::new(NonceCache::new(NONCE_WINDOW)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// One pull cycle: fetch pending intents for this device, validate each
    /// envelope, NACK failures. Returns the intents that passed and are
    /// ready to be claimed.
    pub async fn poll_once(&self) -> Result<Vec<ExecutionIntent>> {
        let intents = self.transport.pull(&self.device_id, PULL_BATCH).await?;
        let mut accepted = Vec::with_capacity(intents.len());

        for intent in intents {
            match self.validate(&intent).await {
                Ok(()) => {
                    debug!("Accepted intent {} ({})", intent.intent_id, intent.command_kind);
                    accepted.push(intent);
                }
                Err(error) => {
                    warn!("Rejecting intent {}: {error}", intent.intent_id);
                    self.transport
                        .nack(&intent.intent_id, error.kind(), &error.to_string())
                        .await?;
                }
            }
        }
        Ok(accepted)
    }

    /// Acknowledge after the lease was acquired. Safe to call again on
    /// re-delivery; the store treats repeated (intentId, nonce) acks as
    /// no-ops.
    pub async fn acknowledge(&self, intent: &ExecutionIntent) -> Result<()> {
        self.transport.ack(&intent.intent_id, &intent.nonce).await
    }

    async fn validate(&self, intent: &ExecutionIntent) -> Result<(), RunnerError> {
        let enrollment = self
            .transport
            .enrollment(&self.device_id)
            .await
            .map_err(|e| RunnerError::transient("load enrollment", e))?;
        let Some(enrollment) = enrollment else {
            return Err(RunnerError::DeviceNotEnrolled {
                device_id: self.device_id.clone(),
            });
        };
        if enrollment.is_revoked() {
            return Err(RunnerError::DeviceNotEnrolled {
                device_id: self.device_id.clone(),
            });
        }

        if intent.target_device_id != self.device_id {
            return Err(RunnerError::DeviceMismatch {
                expected: intent.target_device_id.clone(),
                actual: self.device_id.clone(),
            });
        }

        if !intent.verify_signature(&enrollment.public_key) {
            return Err(RunnerError::NotAuthorized {
                principal: intent.principal.clone(),
                workspace_id: intent.workspace_id.clone(),
            });
        }

        let authorized = self
            .transport
            .authorized(&intent.principal, &intent.workspace_id)
            .await
            .map_err(|e| RunnerError::transient("check authorization", e))?;
        if !authorized {
            return Err(RunnerError::NotAuthorized {
                principal: intent.principal.clone(),
                workspace_id: intent.workspace_id.clone(),
            });
        }

        let Some(kind) = crate::domains::processes::operation::CommandKind::parse(&intent.command_kind)
        else {
            return Err(RunnerError::fatal(
                "validate command kind",
                format!("unknown command kind '{}'", intent.command_kind),
            ));
        };
        if let Err(e) = crate::domains::processes::operation::validate_params(kind, &intent.params)
        {
            return Err(RunnerError::fatal("validate params", e));
        }

        if intent.is_expired(now_ms()) {
            return Err(RunnerError::TtlExpired {
                intent_id: intent.intent_id.clone(),
            });
        }

        let mut nonces = self.nonces.lock().expect("nonce cache poisoned");
        if !nonces.insert(&intent.nonce) {
            return Err(RunnerError::ReplayedNonce {
                nonce: intent.nonce.clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::dispatch::envelope::test_intent;
    use crate::domains::workspaces::db_workspaces::WorkspaceMethods;
    use crate::domains::workspaces::entity::{NewWorkspace, NewWorkspaceRepo};
    use tempfile::TempDir;

    const DEVICE_KEY: &str = "device-key";

    fn fixture() -> (TempDir, Database, String, String) {
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
        db.enroll_device("d-1", "alice", DEVICE_KEY).unwrap();
        (tmp, db, workspace.id, session.id)
    }

    fn submit(db: &Database, workspace_id: &str, session_id: &str, intent_id: &str, nonce: &str, device: &str) -> ExecutionIntent {
        let mut intent = test_intent(intent_id, nonce, device);
        intent.workspace_id = workspace_id.to_string();
        intent.session_id = session_id.to_string();
        intent.execution_id = format!("e-{intent_id}");
        let intent = intent.sign(DEVICE_KEY);
        db.submit_intent(&intent).unwrap();
        intent
    }

    fn client(db: &Database) -> DispatchClient {
        DispatchClient::new(Arc::new(db.clone()), "d-1".into())
    }

    #[tokio::test]
    async fn valid_intent_passes_and_acks() {
        let (_tmp, db, workspace_id, session_id) = fixture();
        let intent = submit(&db, &workspace_id, &session_id, "i-1", "n-1", "d-1");

        let client = client(&db);
        let accepted = client.poll_once().await.unwrap();
        assert_eq!(accepted.len(), 1);

        client.acknowledge(&intent).await.unwrap();
        // Idempotent re-ack.
        client.acknowledge(&intent).await.unwrap();
        assert!(client.poll_once().await.unwrap().is_empty());
    }

    /// Transport that hands out whatever it was seeded with, for the
    /// misrouted-delivery cases the store-backed pull can never produce.
    struct StubTransport {
        intents: Mutex<Vec<ExecutionIntent>>,
        nacks: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl IntentTransport for StubTransport {
        async fn pull(&self, _device_id: &str, _limit: u32) -> Result<Vec<ExecutionIntent>> {
            Ok(self.intents.lock().unwrap().drain(..).collect())
        }

        async fn ack(&self, _intent_id: &str, _nonce: &str) -> Result<()> {
            Ok(())
        }

        async fn nack(&self, intent_id: &str, reason: &str, _detail: &str) -> Result<()> {
            self.nacks
                .lock()
                .unwrap()
                .push((intent_id.to_string(), reason.to_string()));
            Ok(())
        }

        async fn enrollment(&self, device_id: &str) -> Result<Option<DeviceEnrollment>> {
            Ok(Some(DeviceEnrollment {
                device_id: device_id.to_string(),
                owning_principal: "alice".into(),
                public_key: DEVICE_KEY.into(),
                enrolled_at: 0,
                revoked_at: None,
            }))
        }

        async fn authorized(&self, _principal: &str, _workspace_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn cross_device_intent_is_nacked() {
        // An intent for d-2 misdelivered to the d-1 runner.
        let intent = test_intent("i-1", "n-1", "d-2").sign(DEVICE_KEY);
        let transport = Arc::new(StubTransport {
            intents: Mutex::new(vec![intent]),
            nacks: Mutex::new(Vec::new()),
        });

        let client = DispatchClient::new(transport.clone(), "d-1".into());
        let accepted = client.poll_once().await.unwrap();
        assert!(accepted.is_empty());

        let nacks = transport.nacks.lock().unwrap();
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0], ("i-1".to_string(), "device_mismatch".to_string()));
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected() {
        let (_tmp, db, workspace_id, session_id) = fixture();
        submit(&db, &workspace_id, &session_id, "i-1", "n-dup", "d-1");

        let client = client(&db);
        assert_eq!(client.poll_once().await.unwrap().len(), 1);

        // A second intent reusing the nonce is a replay.
        submit(&db, &workspace_id, &session_id, "i-2", "n-dup", "d-1");
        assert!(client.poll_once().await.unwrap().is_empty());
        assert_eq!(
            db.dispatch_audit_entries("i-2").unwrap()[0].reason,
            "replayed_nonce"
        );
    }

    #[tokio::test]
    async fn expired_ttl_is_rejected() {
        let (_tmp, db, workspace_id, session_id) = fixture();
        let mut intent = test_intent("i-1", "n-1", "d-1");
        intent.workspace_id = workspace_id;
        intent.session_id = session_id;
        intent.issued_at = now_ms() - 120_000;
        intent.ttl_ms = 1_000;
        db.submit_intent(&intent.sign(DEVICE_KEY)).unwrap();

        assert!(client(&db).poll_once().await.unwrap().is_empty());
        assert_eq!(
            db.dispatch_audit_entries("i-1").unwrap()[0].reason,
            "ttl_expired"
        );
    }

    #[tokio::test]
    async fn unauthorized_principal_is_rejected() {
        let (_tmp, db, workspace_id, session_id) = fixture();
        let mut intent = test_intent("i-1", "n-1", "d-1");
        intent.workspace_id = workspace_id;
        intent.session_id = session_id;
        intent.principal = "mallory".into();
        db.submit_intent(&intent.sign(DEVICE_KEY)).unwrap();

        assert!(client(&db).poll_once().await.unwrap().is_empty());
        assert_eq!(
            db.dispatch_audit_entries("i-1").unwrap()[0].reason,
            "not_authorized"
        );
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (_tmp, db, workspace_id, session_id) = fixture();
        let mut intent = test_intent("i-1", "n-1", "d-1");
        intent.workspace_id = workspace_id;
        intent.session_id = session_id;
        db.submit_intent(&intent.sign("wrong-key")).unwrap();

        assert!(client(&db).poll_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoked_device_accepts_nothing() {
        let (_tmp, db, workspace_id, session_id) = fixture();
        submit(&db, &workspace_id, &session_id, "i-1", "n-1", "d-1");
        db.revoke_device("d-1").unwrap();

        assert!(client(&db).poll_once().await.unwrap().is_empty());
        assert_eq!(
            db.dispatch_audit_entries("i-1").unwrap()[0].reason,
            "device_not_enrolled"
        );
    }
}
