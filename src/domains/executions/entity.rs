use serde::{Deserialize, Serialize};

/// Why an execution was started. Each link of the setup → coding_agent →
/// cleanup → archive chain is its own execution with its own reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    Setup,
    CodingAgent,
    Cleanup,
    Archive,
    DevServer,
    Review,
    System,
}

impl RunReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunReason::Setup => "setup",
            RunReason::CodingAgent => "coding_agent",
            RunReason::Cleanup => "cleanup",
            RunReason::Archive => "archive",
            RunReason::DevServer => "dev_server",
            RunReason::Review => "review",
            RunReason::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "setup" => Some(RunReason::Setup),
            "coding_agent" => Some(RunReason::CodingAgent),
            "cleanup" => Some(RunReason::Cleanup),
            "archive" => Some(RunReason::Archive),
            "dev_server" => Some(RunReason::DevServer),
            "review" => Some(RunReason::Review),
            "system" => Some(RunReason::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Killed,
    Dropped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Killed => "killed",
            ExecutionStatus::Dropped => "dropped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "killed" => Some(ExecutionStatus::Killed),
            "dropped" => Some(ExecutionStatus::Dropped),
            _ => None,
        }
    }

    /// Terminal statuses are sinks; the store rejects any further status
    /// write once one is recorded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Killed
                | ExecutionStatus::Dropped
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProcess {
    pub id: String,
    pub workspace_id: String,
    pub session_id: String,
    pub run_reason: RunReason,
    pub status: ExecutionStatus,
    pub executor: Option<String>,
    pub queued_follow_up_consumed: bool,
    pub cancel_requested: bool,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Per-repo HEAD snapshot of one execution. `before_head_commit` is written
/// before any mutation, `after_head_commit` after terminal exit; together
/// they make session reset deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRepoState {
    pub id: String,
    pub execution_id: String,
    pub workspace_repo_id: String,
    pub before_head_commit: Option<String>,
    pub after_head_commit: Option<String>,
    pub repo_state: Option<String>,
}

/// Partial upsert for a repo-state row; `None` fields keep prior values.
#[derive(Debug, Clone, Default)]
pub struct RepoStatePatch {
    pub before_head_commit: Option<String>,
    pub after_head_commit: Option<String>,
    pub repo_state: Option<String>,
}
