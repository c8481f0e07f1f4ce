use crate::domains::executions::{ExecutionMethods, ExecutionStatus, RunReason};
use crate::domains::git::cli as git_cli;
use crate::domains::git::repository::is_clean;
use crate::domains::workspaces::WorkspaceMethods;
use crate::domains::worktrees::WorktreeManager;
use crate::errors::RunnerError;
use crate::infrastructure::database::Database;
use anyhow::{Result, anyhow};
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;

/// Result of a session reset: the recorded `system` execution, the
/// superseded executions, and the HEAD each repo was reset to.
#[derive(Debug, Clone)]
pub struct ResetOutcome {
    pub system_execution_id: String,
    pub dropped_execution_ids: Vec<String>,
    pub targets: HashMap<String, String>,
}

/// Resets the session's repos to the state before execution `target`.
///
/// The target HEAD per repo is `target.before_head_commit`, falling back
/// to the latest prior execution's `after_head_commit`. Dirty worktrees
/// abort the whole reset (unless forced) before any repo is touched. The
/// target and every later execution are superseded as `dropped`, and the
/// reset itself is recorded as a `system` execution.
pub async fn reset_session(
    db: &Database,
    worktrees: &WorktreeManager,
    session_id: &str,
    target_execution_id: &str,
    force: bool,
) -> Result<ResetOutcome> {
    let target = db.get_execution(target_execution_id)?;
    if target.session_id != session_id {
        return Err(anyhow!(
            "Execution '{target_execution_id}' does not belong to session '{session_id}'"
        ));
    }
    let open = db.non_terminal_executions(session_id)?;
    if !open.is_empty() {
        return Err(anyhow!(
            "Session '{session_id}' has {} running execution(s); cancel them before resetting",
            open.len()
        ));
    }

    let workspace = db.get_workspace(&target.workspace_id)?;
    let repos = db.enabled_workspace_repos(&workspace.id)?;
    if repos.is_empty() {
        return Err(anyhow!("Workspace '{}' has no enabled repos", workspace.id));
    }

    // Resolve every target commit and checkout before mutating anything.
    let mut plan: Vec<(String, String, PathBuf, String)> = Vec::with_capacity(repos.len());
    for repo in &repos {
        let commit = match db.get_execution_repo_state(target_execution_id, &repo.id)? {
            Some(state) if state.before_head_commit.is_some() => state.before_head_commit.unwrap(),
            _ => db
                .prior_after_head_commit(session_id, target.started_at, &repo.id)?
                .ok_or_else(|| {
                    anyhow!(
                        "No snapshot to reset repo '{}' to before execution '{target_execution_id}'",
                        repo.repo_name
                    )
                })?,
        };

        let path = worktrees.worktree_path(&workspace.id, &repo.repo_name)?;
        if !path.exists() {
            return Err(anyhow!(
                "Worktree for repo '{}' is missing at {}",
                repo.repo_name,
                path.display()
            ));
        }

        if !force {
            let check_path = path.clone();
            let clean = tokio::task::spawn_blocking(move || is_clean(&check_path))
                .await
                .map_err(|e| anyhow!("Cleanliness check join error: {e}"))??;
            if !clean {
                return Err(anyhow!(RunnerError::DirtyWorktree {
                    repo_name: repo.repo_name.clone(),
                    path: path.display().to_string(),
                }));
            }
        }

        plan.push((repo.id.clone(), repo.repo_name.clone(), path, commit));
    }

    for (_, repo_name, path, commit) in &plan {
        git_cli::reset_hard(path, commit).await?;
        info!("Reset '{repo_name}' to {commit}");
    }

    let dropped = db.supersede_executions_since(session_id, target.started_at)?;

    let system = db.start_execution(&workspace.id, session_id, RunReason::System, None)?;
    db.set_execution_status(
        &system.id,
        ExecutionStatus::Completed,
        Some(&format!("session reset to execution {target_execution_id}")),
    )?;

    Ok(ResetOutcome {
        system_execution_id: system.id,
        dropped_execution_ids: dropped,
        targets: plan
            .into_iter()
            .map(|(repo_id, _, _, commit)| (repo_id, commit))
            .collect(),
    })
}
