use crate::domains::executions::entity::ExecutionStatus;
use serde::{Deserialize, Serialize};

/// Activity status shared by sessions and workspaces. A session's value is
/// always a projection of its most recent execution (plus pending
/// approvals); it is never written free-hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Idle,
    NeedsAttention,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::NeedsAttention => "needs_attention",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(SessionStatus::Running),
            "idle" => Some(SessionStatus::Idle),
            "needs_attention" => Some(SessionStatus::NeedsAttention),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// Pure projection of an execution status onto the owning session. Keeping
/// this a total function makes the monotonicity invariant checkable: a
/// terminal execution can only map to `idle` or `needs_attention`, never
/// back to `running`.
pub fn project_session_status(execution: ExecutionStatus) -> SessionStatus {
    match execution {
        ExecutionStatus::Pending | ExecutionStatus::Running => SessionStatus::Running,
        ExecutionStatus::Failed | ExecutionStatus::Killed => SessionStatus::NeedsAttention,
        ExecutionStatus::Completed | ExecutionStatus::Dropped => SessionStatus::Idle,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub owner: String,
    pub org: Option<String>,
    pub project: Option<String>,
    pub name: String,
    /// Branch checked out in every worktree of this workspace.
    pub branch: String,
    pub status: SessionStatus,
    pub archived: bool,
    pub pinned: bool,
    pub active_session_id: Option<String>,
    pub active_workspace_repo_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRepo {
    pub id: String,
    pub workspace_id: String,
    pub repo_id: String,
    pub repo_name: String,
    /// Branch the workspace branch is created from.
    pub target_branch: String,
    pub enabled: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub last_used_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for the atomic workspace-creation transaction.
#[derive(Debug, Clone)]
pub struct NewWorkspace {
    pub owner: String,
    pub org: Option<String>,
    pub project: Option<String>,
    pub name: String,
    pub branch: String,
    pub repos: Vec<NewWorkspaceRepo>,
    pub initial_session_title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewWorkspaceRepo {
    pub repo_id: String,
    pub repo_name: String,
    pub target_branch: String,
    pub enabled: bool,
}

/// Partial patch for `update_workspace`; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceUpdate {
    pub name: Option<String>,
    pub archived: Option<bool>,
    pub pinned: Option<bool>,
    pub status: Option<SessionStatus>,
    pub active_session_id: Option<Option<String>>,
    pub active_workspace_repo_id: Option<Option<String>>,
}
