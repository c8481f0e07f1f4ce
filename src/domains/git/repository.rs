use anyhow::{Context, Result, anyhow};
use git2::{BranchType, Repository, StatusOptions};
use serde::Serialize;
use std::path::Path;

/// Read-only repository queries. These run through git2; anything that
/// mutates repo state lives in `cli.rs`.
pub fn head_commit(path: &Path) -> Result<String> {
    let repo = Repository::open(path)
        .with_context(|| format!("Failed to open repository at {}", path.display()))?;
    let head = repo.head()?;
    let oid = head
        .target()
        .ok_or_else(|| anyhow!("HEAD of {} has no target", path.display()))?;
    Ok(oid.to_string())
}

pub fn current_branch(path: &Path) -> Result<String> {
    let repo = Repository::open(path)?;
    let head = repo.head()?;
    head.shorthand()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("HEAD of {} is not on a branch", path.display()))
}

/// A worktree is clean when neither the index nor the working tree carries
/// changes, untracked files included.
pub fn is_clean(path: &Path) -> Result<bool> {
    let repo = Repository::open(path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses.is_empty())
}

pub fn branch_exists(repo_path: &Path, branch: &str) -> Result<bool> {
    let repo = Repository::open(repo_path)?;
    Ok(repo.find_branch(branch, BranchType::Local).is_ok())
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffTotals {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

/// Uncommitted delta of a worktree against its own HEAD, the read path
/// behind `/diff`.
pub fn diff_summary(worktree_path: &Path) -> Result<DiffTotals> {
    let repo = Repository::open(worktree_path)?;
    let head_tree = match repo.head() {
        Ok(head) => Some(head.peel_to_tree()?),
        Err(_) => None,
    };

    let mut opts = git2::DiffOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let diff = repo.diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;
    let stats = diff.stats()?;

    Ok(DiffTotals {
        files_changed: stats.files_changed(),
        insertions: stats.insertions(),
        deletions: stats.deletions(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoStateSummary {
    pub branch: String,
    pub clean: bool,
}

/// Compact JSON snapshot stored next to the HEAD commits in
/// `execution_process_repo_states.repo_state`.
pub fn repo_state_summary(worktree_path: &Path) -> Result<RepoStateSummary> {
    Ok(RepoStateSummary {
        branch: current_branch(worktree_path)?,
        clean: is_clean(worktree_path)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::cli::test_support::{init_repo, run_git};

    #[test]
    fn head_commit_matches_rev_parse() {
        let (_tmp, repo) = init_repo();
        let via_git2 = head_commit(&repo).unwrap();
        let via_cli = std::process::Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert_eq!(
            via_git2,
            String::from_utf8_lossy(&via_cli.stdout).trim().to_string()
        );
    }

    #[test]
    fn cleanliness_tracks_untracked_files() {
        let (_tmp, repo) = init_repo();
        assert!(is_clean(&repo).unwrap());

        std::fs::write(repo.join("scratch.txt"), "wip\n").unwrap();
        assert!(!is_clean(&repo).unwrap());

        std::fs::remove_file(repo.join("scratch.txt")).unwrap();
        assert!(is_clean(&repo).unwrap());
    }

    #[test]
    fn branch_queries() {
        let (_tmp, repo) = init_repo();
        assert_eq!(current_branch(&repo).unwrap(), "main");
        assert!(branch_exists(&repo, "main").unwrap());
        assert!(!branch_exists(&repo, "feat/missing").unwrap());
    }

    #[test]
    fn diff_summary_counts_modified_and_untracked() {
        let (_tmp, repo) = init_repo();
        std::fs::write(repo.join("README.md"), "initial\nmore\n").unwrap();
        std::fs::write(repo.join("new.txt"), "brand new\n").unwrap();

        let totals = diff_summary(&repo).unwrap();
        assert_eq!(totals.files_changed, 2);
        assert!(totals.insertions >= 2);
    }

    #[test]
    fn repo_state_summary_serializes() {
        let (_tmp, repo) = init_repo();
        run_git(&repo, &["checkout", "-b", "feat/x"]);
        let summary = repo_state_summary(&repo).unwrap();
        assert_eq!(summary.branch, "feat/x");
        assert!(summary.clean);

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"branch\":\"feat/x\""));
    }
}
