use crate::domains::executions::entity::RunReason;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The dispatch envelope the control plane hands to a runner. Every field
/// participates in the digest, so a tampered envelope fails verification
/// before any other check runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionIntent {
    pub intent_id: String,
    pub nonce: String,
    pub target_device_id: String,
    pub issued_at: i64,
    pub ttl_ms: i64,
    pub workspace_id: String,
    pub session_id: String,
    pub execution_id: String,
    pub run_reason: RunReason,
    pub command_kind: String,
    pub params: serde_json::Value,
    pub principal: String,
    pub signature: String,
}

impl ExecutionIntent {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.issued_at + self.ttl_ms
    }

    fn canonical_string(&self) -> String {
        [
            self.intent_id.as_str(),
            self.nonce.as_str(),
            self.target_device_id.as_str(),
            &self.issued_at.to_string(),
            &self.ttl_ms.to_string(),
            self.workspace_id.as_str(),
            self.session_id.as_str(),
            self.execution_id.as_str(),
            self.run_reason.as_str(),
            self.command_kind.as_str(),
            &self.params.to_string(),
            self.principal.as_str(),
        ]
        .join("\n")
    }

    /// Digest over the canonical fields keyed by the device enrollment key.
    pub fn compute_signature(&self, device_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(device_key.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.canonical_string().as_bytes());
        BASE64.encode(hasher.finalize())
    }

    pub fn sign(mut self, device_key: &str) -> Self {
        self.signature = self.compute_signature(device_key);
        self
    }

    pub fn verify_signature(&self, device_key: &str) -> bool {
        !self.signature.is_empty() && self.signature == self.compute_signature(device_key)
    }
}

#[cfg(test)]
pub(crate) fn test_intent(intent_id: &str, nonce: &str, device_id: &str) -> ExecutionIntent {
    ExecutionIntent {
        intent_id: intent_id.to_string(),
        nonce: nonce.to_string(),
        target_device_id: device_id.to_string(),
        issued_at: crate::infrastructure::database::now_ms(),
        ttl_ms: 60_000,
        workspace_id: "w-1".to_string(),
        session_id: "s-1".to_string(),
        execution_id: "e-1".to_string(),
        run_reason: RunReason::CodingAgent,
        command_kind: "run_coding_agent".to_string(),
        params: serde_json::json!({ "prompt": "hello" }),
        principal: "alice".to_string(),
        signature: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let intent = test_intent("i-1", "n-1", "d-1").sign("secret");
        assert!(intent.verify_signature("secret"));
        assert!(!intent.verify_signature("other"));
    }

    #[test]
    fn tampered_fields_break_the_signature() {
        let mut intent = test_intent("i-1", "n-1", "d-1").sign("secret");
        intent.params = serde_json::json!({ "prompt": "rm -rf /" });
        assert!(!intent.verify_signature("secret"));
    }

    #[test]
    fn unsigned_envelope_never_verifies() {
        let intent = test_intent("i-1", "n-1", "d-1");
        assert!(!intent.verify_signature("secret"));
    }

    #[test]
    fn expiry_uses_issued_at_plus_ttl() {
        let mut intent = test_intent("i-1", "n-1", "d-1");
        intent.issued_at = 1_000;
        intent.ttl_ms = 500;
        assert!(!intent.is_expired(1_500));
        assert!(intent.is_expired(1_501));
    }
}
