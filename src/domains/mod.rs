pub mod approvals;
pub mod commands;
pub mod dispatch;
pub mod executions;
pub mod git;
pub mod leases;
pub mod orchestrator;
pub mod processes;
pub mod queue;
pub mod workspaces;
pub mod worktrees;
