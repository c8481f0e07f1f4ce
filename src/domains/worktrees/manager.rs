use super::paths::{ensure_within_root, validate_path_component};
use crate::domains::git::cli as git_cli;
use crate::domains::git::repository::current_branch;
use crate::domains::workspaces::entity::{Workspace, WorkspaceRepo};
use crate::errors::RunnerError;
use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const LOGS_DIR: &str = ".logs";

/// Owns the filesystem under the managed root: one directory per workspace,
/// one git worktree per (workspace, repo). Mutations for the same pair
/// serialize on a per-pair lock; distinct pairs proceed in parallel.
pub struct WorktreeManager {
    managed_root: PathBuf,
    /// Local clone per repo id; worktrees share its object store.
    repo_sources: HashMap<String, PathBuf>,
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl WorktreeManager {
    pub fn new(managed_root: PathBuf, repo_sources: HashMap<String, PathBuf>) -> Self {
        Self {
            managed_root,
            repo_sources,
            locks: DashMap::new(),
        }
    }

    pub fn managed_root(&self) -> &Path {
        &self.managed_root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.managed_root.join(LOGS_DIR)
    }

    pub fn workspace_dir(&self, workspace_id: &str) -> Result<PathBuf> {
        validate_path_component(workspace_id)?;
        Ok(self.managed_root.join(workspace_id))
    }

    pub fn worktree_path(&self, workspace_id: &str, repo_name: &str) -> Result<PathBuf> {
        validate_path_component(workspace_id)?;
        validate_path_component(repo_name)?;
        Ok(self.managed_root.join(workspace_id).join(repo_name))
    }

    fn source_for(&self, repo: &WorkspaceRepo) -> Result<&PathBuf> {
        self.repo_sources.get(&repo.repo_id).ok_or_else(|| {
            anyhow!(RunnerError::fatal(
                "resolve repo source",
                format!("no local clone configured for repo '{}'", repo.repo_id),
            ))
        })
    }

    fn pair_lock(&self, workspace_id: &str, repo_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((workspace_id.to_string(), repo_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Idempotently materializes the worktree for (workspace, repo) and
    /// returns its path. An existing checkout on the right branch is reused;
    /// anything else is torn down and recreated from the repo's target
    /// branch. On failure no partial worktree is left registered.
    pub async fn ensure_worktree(
        &self,
        workspace: &Workspace,
        repo: &WorkspaceRepo,
    ) -> Result<PathBuf> {
        let path = self.worktree_path(&workspace.id, &repo.repo_name)?;
        ensure_within_root(&self.managed_root, &path)?;
        let source = self.source_for(repo)?.clone();

        let lock = self.pair_lock(&workspace.id, &repo.id);
        let _guard = lock.lock().await;

        if path.exists() {
            let check_path = path.clone();
            let branch = tokio::task::spawn_blocking(move || current_branch(&check_path))
                .await
                .map_err(|e| anyhow!("Branch check join error: {e}"))?;
            match branch {
                Ok(branch) if branch == workspace.branch => {
                    return Ok(path);
                }
                Ok(branch) => {
                    info!(
                        "Worktree {} is on '{branch}', expected '{}'; recreating",
                        path.display(),
                        workspace.branch
                    );
                }
                Err(e) => {
                    warn!("Worktree {} is unreadable ({e}); recreating", path.display());
                }
            }
            self.teardown(&source, &path).await?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let created = git_cli::worktree_add(&source, &workspace.branch, &path, &repo.target_branch)
            .await;
        if let Err(error) = created {
            // Leave nothing half-registered for the retry.
            self.teardown(&source, &path).await.ok();
            return Err(error.context(format!(
                "Failed to create worktree for '{}' in workspace '{}'",
                repo.repo_name, workspace.id
            )));
        }

        info!(
            "Created worktree {} on branch {}",
            path.display(),
            workspace.branch
        );
        Ok(path)
    }

    /// Removes the worktree directory and its git metadata. Missing
    /// worktrees are fine.
    pub async fn remove_worktree(&self, workspace_id: &str, repo: &WorkspaceRepo) -> Result<()> {
        let path = self.worktree_path(workspace_id, &repo.repo_name)?;
        ensure_within_root(&self.managed_root, &path)?;
        let source = self.source_for(repo)?.clone();

        let lock = self.pair_lock(workspace_id, &repo.id);
        let _guard = lock.lock().await;
        self.teardown(&source, &path).await
    }

    /// Removes every repo worktree of the workspace, then its directory.
    /// Only called for hard workspace deletion; archiving keeps worktrees.
    pub async fn remove_workspace(
        &self,
        workspace_id: &str,
        repos: &[WorkspaceRepo],
    ) -> Result<()> {
        for repo in repos {
            self.remove_worktree(workspace_id, repo).await?;
        }

        let dir = self.workspace_dir(workspace_id)?;
        let dir = match ensure_within_root(&self.managed_root, &dir) {
            Ok(dir) => dir,
            // Already gone.
            Err(_) if !dir.exists() => return Ok(()),
            Err(e) => return Err(e),
        };
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        info!("Removed workspace directory {}", dir.display());
        Ok(())
    }

    async fn teardown(&self, source: &Path, path: &Path) -> Result<()> {
        if path.exists() {
            if let Err(e) = git_cli::worktree_remove(source, path).await {
                warn!("git worktree remove failed for {}: {e}", path.display());
            }
            if path.exists() {
                std::fs::remove_dir_all(path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        git_cli::worktree_prune(source).await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::cli::test_support::{init_repo, run_git};
    use crate::domains::worktrees::paths::resolve_managed_root;
    use crate::domains::workspaces::entity::SessionStatus;
    use crate::errors::as_runner_error;
    use crate::infrastructure::database::now_ms;
    use tempfile::TempDir;

    fn workspace(id: &str, branch: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            owner: "alice".into(),
            org: None,
            project: None,
            name: "W1".into(),
            branch: branch.to_string(),
            status: SessionStatus::Idle,
            archived: false,
            pinned: false,
            active_session_id: None,
            active_workspace_repo_id: None,
            created_at: now_ms(),
            updated_at: now_ms(),
        }
    }

    fn workspace_repo(repo_id: &str, repo_name: &str) -> WorkspaceRepo {
        WorkspaceRepo {
            id: format!("wr-{repo_id}"),
            workspace_id: "w-1".into(),
            repo_id: repo_id.to_string(),
            repo_name: repo_name.to_string(),
            target_branch: "main".into(),
            enabled: true,
            sort_order: 0,
        }
    }

    fn manager_with_repo() -> (TempDir, TempDir, Arc<WorktreeManager>, Workspace, WorkspaceRepo) {
        let root_tmp = TempDir::new().unwrap();
        let managed_root = resolve_managed_root(Some(root_tmp.path())).unwrap();
        let (repo_tmp, repo_path) = init_repo();

        let mut sources = HashMap::new();
        sources.insert("r-app".to_string(), repo_path);
        let manager = Arc::new(WorktreeManager::new(managed_root, sources));
        (
            root_tmp,
            repo_tmp,
            manager,
            workspace("w-1", "feat/x"),
            workspace_repo("r-app", "app"),
        )
    }

    #[tokio::test]
    async fn ensure_creates_the_expected_layout() {
        let (_root, _repo, manager, workspace, repo) = manager_with_repo();
        let path = manager.ensure_worktree(&workspace, &repo).await.unwrap();

        assert_eq!(path, manager.managed_root().join("w-1").join("app"));
        assert!(path.join("README.md").exists());
        assert_eq!(current_branch(&path).unwrap(), "feat/x");
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let (_root, _repo, manager, workspace, repo) = manager_with_repo();
        let first = manager.ensure_worktree(&workspace, &repo).await.unwrap();
        let marker = first.join("marker.txt");
        std::fs::write(&marker, "keep me\n").unwrap();

        let second = manager.ensure_worktree(&workspace, &repo).await.unwrap();
        assert_eq!(first, second);
        assert!(marker.exists(), "idempotent ensure must not recreate");
    }

    #[tokio::test]
    async fn stale_directory_is_recreated() {
        let (_root, _repo, manager, workspace, repo) = manager_with_repo();
        let path = manager.worktree_path(&workspace.id, &repo.repo_name).unwrap();
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("junk.txt"), "stale\n").unwrap();

        let created = manager.ensure_worktree(&workspace, &repo).await.unwrap();
        assert!(!created.join("junk.txt").exists());
        assert_eq!(current_branch(&created).unwrap(), "feat/x");
    }

    #[tokio::test]
    async fn wrong_branch_checkout_is_recreated() {
        let (_root, _repo, manager, workspace, repo) = manager_with_repo();
        let path = manager.ensure_worktree(&workspace, &repo).await.unwrap();
        run_git(&path, &["checkout", "-b", "detour"]);

        let recreated = manager.ensure_worktree(&workspace, &repo).await.unwrap();
        assert_eq!(current_branch(&recreated).unwrap(), "feat/x");
    }

    #[tokio::test]
    async fn unsafe_identifiers_are_refused() {
        let (_root, _repo, manager, mut workspace, repo) = manager_with_repo();
        workspace.id = "../escape".into();
        let error = manager.ensure_worktree(&workspace, &repo).await.unwrap_err();
        assert!(matches!(
            as_runner_error(&error),
            Some(RunnerError::UnsafePath { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_ensures_serialize_per_pair() {
        let (_root, _repo, manager, workspace, repo) = manager_with_repo();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let workspace = workspace.clone();
                let repo = repo.clone();
                tokio::spawn(async move { manager.ensure_worktree(&workspace, &repo).await })
            })
            .collect();

        let mut paths = Vec::new();
        for task in tasks {
            paths.push(task.await.unwrap().unwrap());
        }
        assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(current_branch(&paths[0]).unwrap(), "feat/x");
    }

    #[tokio::test]
    async fn remove_workspace_clears_the_directory() {
        let (_root, _repo, manager, workspace, repo) = manager_with_repo();
        manager.ensure_worktree(&workspace, &repo).await.unwrap();

        manager
            .remove_workspace(&workspace.id, std::slice::from_ref(&repo))
            .await
            .unwrap();
        assert!(!manager.managed_root().join("w-1").exists());

        // Removing an absent workspace is fine.
        manager
            .remove_workspace(&workspace.id, std::slice::from_ref(&repo))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_source_is_fatal() {
        let (_root, _repo, manager, workspace, mut repo) = manager_with_repo();
        repo.repo_id = "r-unknown".into();
        let error = manager.ensure_worktree(&workspace, &repo).await.unwrap_err();
        assert!(matches!(
            as_runner_error(&error),
            Some(RunnerError::Fatal { .. })
        ));
    }
}
