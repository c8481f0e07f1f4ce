use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedMessageState {
    Queued,
    Consumed,
    Discarded,
}

impl QueuedMessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuedMessageState::Queued => "queued",
            QueuedMessageState::Consumed => "consumed",
            QueuedMessageState::Discarded => "discarded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(QueuedMessageState::Queued),
            "consumed" => Some(QueuedMessageState::Consumed),
            "discarded" => Some(QueuedMessageState::Discarded),
            _ => None,
        }
    }
}

/// The single follow-up slot of a session. A newer message overwrites the
/// active one; there is never more than one `queued` row per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub session_id: String,
    pub message: String,
    pub executor: Option<String>,
    pub variant: Option<String>,
    pub enqueueing_execution_id: Option<String>,
    pub state: QueuedMessageState,
    pub queued_at: i64,
    pub resolved_at: Option<i64>,
}
