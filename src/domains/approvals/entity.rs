use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            "expired" => Some(ApprovalStatus::Expired),
            "cancelled" => Some(ApprovalStatus::Cancelled),
            _ => None,
        }
    }

    /// Expiry counts as a denial when the orchestrator decides how the
    /// gated execution proceeds.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            ApprovalStatus::Rejected | ApprovalStatus::Expired | ApprovalStatus::Cancelled
        )
    }
}

/// A durable human-approval gate. While one is pending the owning session
/// shows `needs_attention` and the gated execution stays `running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub workspace_id: String,
    pub session_id: String,
    pub execution_id: String,
    pub kind: String,
    pub prompt: String,
    pub status: ApprovalStatus,
    pub requested_at: i64,
    pub expires_at: Option<i64>,
    pub responded_at: Option<i64>,
    pub responded_by: Option<String>,
}
