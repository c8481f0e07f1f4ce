use super::repository::{head_commit, repo_state_summary};
use crate::domains::executions::db_executions::ExecutionMethods;
use crate::domains::executions::entity::RepoStatePatch;
use crate::infrastructure::database::Database;
use anyhow::{Context, Result};
use log::warn;
use std::path::PathBuf;

/// One enabled repo of the execution's workspace, resolved to its worktree.
#[derive(Debug, Clone)]
pub struct RepoCheckout {
    pub workspace_repo_id: String,
    pub repo_name: String,
    pub path: PathBuf,
}

/// Records per-repo HEAD commits around an execution. Both writes are
/// idempotent upserts keyed by (execution, repo), so crash-retry never
/// produces duplicate rows or clobbers the earlier snapshot.
#[derive(Clone)]
pub struct SnapshotService {
    db: Database,
}

impl SnapshotService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Capture `before_head_commit` for every repo. Must run before any
    /// action that may mutate repo state.
    pub async fn record_before(&self, execution_id: &str, repos: &[RepoCheckout]) -> Result<()> {
        for repo in repos {
            let (head, state) = Self::read_repo(repo).await?;
            self.db.upsert_execution_repo_state(
                execution_id,
                &repo.workspace_repo_id,
                &RepoStatePatch {
                    before_head_commit: Some(head),
                    repo_state: state,
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    /// Capture `after_head_commit` for every repo once the execution
    /// reached a terminal status.
    pub async fn record_after(&self, execution_id: &str, repos: &[RepoCheckout]) -> Result<()> {
        for repo in repos {
            let (head, state) = Self::read_repo(repo).await?;
            self.db.upsert_execution_repo_state(
                execution_id,
                &repo.workspace_repo_id,
                &RepoStatePatch {
                    after_head_commit: Some(head),
                    repo_state: state,
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    async fn read_repo(repo: &RepoCheckout) -> Result<(String, Option<String>)> {
        let path = repo.path.clone();
        let repo_name = repo.repo_name.clone();
        tokio::task::spawn_blocking(move || {
            let head = head_commit(&path)
                .with_context(|| format!("Failed to read HEAD of '{repo_name}'"))?;
            let state = match repo_state_summary(&path) {
                Ok(summary) => serde_json::to_string(&summary).ok(),
                Err(e) => {
                    warn!("Could not summarize repo state of '{repo_name}': {e}");
                    None
                }
            };
            Ok::<_, anyhow::Error>((head, state))
        })
        .await
        .map_err(|e| anyhow::anyhow!("Snapshot task join error: {e}"))?
    }
}
