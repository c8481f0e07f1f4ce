use crate::errors::RunnerError;
use anyhow::{Result, anyhow};
use log::debug;
use std::path::Path;
use tokio::process::Command;

/// Run one git CLI invocation in `cwd` and return trimmed stdout. All
/// repo-mutating operations go through here; read-only queries use git2 in
/// `repository.rs`.
pub async fn git(cwd: &Path, args: &[&str]) -> Result<String> {
    debug!("git {} (in {})", args.join(" "), cwd.display());
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn git {}: {e}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let operation = format!("git {}", args.first().copied().unwrap_or("?"));
        return Err(anyhow!(classify_git_failure(&operation, &stderr)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Map a git CLI failure onto the runner error taxonomy. Lock contention is
/// retryable; checked-out branches are policy conflicts; the rest is fatal.
pub(crate) fn classify_git_failure(operation: &str, stderr: &str) -> RunnerError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("index.lock")
        || lowered.contains("could not lock")
        || lowered.contains("cannot lock ref")
        || lowered.contains("resource temporarily unavailable")
    {
        return RunnerError::transient(operation, stderr.trim());
    }
    if lowered.contains("already checked out") || lowered.contains("already used by worktree") {
        return RunnerError::BranchConflict {
            branch: String::new(),
            message: stderr.trim().to_string(),
        };
    }
    RunnerError::fatal(operation, stderr.trim())
}

/// `git worktree add -b <branch> <path> <start_point>`; falls back to
/// attaching the existing branch when it is already there but not checked
/// out anywhere.
pub async fn worktree_add(
    repo_path: &Path,
    branch: &str,
    worktree_path: &Path,
    start_point: &str,
) -> Result<()> {
    let path_str = worktree_path.to_string_lossy().to_string();
    let created = git(
        repo_path,
        &["worktree", "add", "-b", branch, &path_str, start_point],
    )
    .await;

    match created {
        Ok(_) => Ok(()),
        Err(error) => {
            let branch_taken = error
                .to_string()
                .to_lowercase()
                .contains("already exists");
            if !branch_taken {
                return Err(error);
            }
            git(repo_path, &["worktree", "add", &path_str, branch])
                .await
                .map(|_| ())
        }
    }
}

pub async fn worktree_remove(repo_path: &Path, worktree_path: &Path) -> Result<()> {
    let path_str = worktree_path.to_string_lossy().to_string();
    git(repo_path, &["worktree", "remove", "--force", &path_str])
        .await
        .map(|_| ())
}

pub async fn worktree_prune(repo_path: &Path) -> Result<()> {
    git(repo_path, &["worktree", "prune"]).await.map(|_| ())
}

pub async fn delete_branch(repo_path: &Path, branch: &str) -> Result<()> {
    git(repo_path, &["branch", "-D", branch]).await.map(|_| ())
}

pub async fn reset_hard(worktree_path: &Path, commit: &str) -> Result<()> {
    git(worktree_path, &["reset", "--hard", commit])
        .await
        .map(|_| ())
}

/// Stage everything and commit. Fails when there is nothing to commit.
pub async fn commit_all(worktree_path: &Path, message: &str) -> Result<()> {
    git(worktree_path, &["add", "-A"]).await?;
    git(worktree_path, &["commit", "-m", message])
        .await
        .map(|_| ())
}

pub async fn push(worktree_path: &Path, branch: &str) -> Result<()> {
    git(worktree_path, &["push", "-u", "origin", branch])
        .await
        .map(|_| ())
}
