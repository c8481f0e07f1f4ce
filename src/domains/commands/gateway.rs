use super::parser::{ParsedCommand, SlashCommand, parse_slash_command};
use crate::config::DEFAULT_INTENT_TTL_MS;
use crate::domains::dispatch::{DispatchMethods, ExecutionIntent};
use crate::domains::executions::{ExecutionMethods, ExecutionProcess, RunReason};
use crate::domains::git::repository::{DiffTotals, RepoStateSummary, diff_summary, repo_state_summary};
use crate::domains::processes::operation::CommandKind;
use crate::domains::queue::{QueueMethods, QueuedMessage};
use crate::domains::workspaces::{
    Session, SessionMethods, Workspace, WorkspaceMethods, WorkspaceRepo, WorkspaceUpdate,
};
use crate::domains::worktrees::WorktreeManager;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use uuid::Uuid;

/// What a slash command produced: either an immediate store mutation, a
/// read-path answer, or a dispatched execution intent.
#[derive(Debug)]
pub enum CommandOutcome {
    SessionCreated(Session),
    FollowUpQueued(QueuedMessage),
    IntentSubmitted {
        intent_id: String,
        execution_id: String,
        command_kind: CommandKind,
    },
    ActiveRepoSet(WorkspaceRepo),
    Diff(DiffTotals),
    GitStatus(RepoStateSummary),
    Summary(Vec<ExecutionProcess>),
}

/// Thin translator from the slash-command surface onto control-plane
/// mutations. Run-type commands become signed execution intents for the
/// workspace's device; reads answer directly from the worktree.
pub struct CommandGateway {
    db: Database,
    worktrees: Arc<WorktreeManager>,
    device_id: String,
    device_key: String,
}

impl CommandGateway {
    pub fn new(
        db: Database,
        worktrees: Arc<WorktreeManager>,
        device_id: String,
        device_key: String,
    ) -> Self {
        Self {
            db,
            worktrees,
            device_id,
            device_key,
        }
    }

    pub async fn apply(&self, workspace_id: &str, input: &str) -> Result<CommandOutcome> {
        let workspace = self.db.get_workspace(workspace_id)?;
        let repos = self.db.list_workspace_repos(workspace_id)?;
        let known: Vec<String> = repos.iter().map(|repo| repo.repo_name.clone()).collect();
        let ParsedCommand { repo_name, command } =
            parse_slash_command(input, &known).map_err(|e| anyhow!(e))?;

        let session_id = workspace
            .active_session_id
            .clone()
            .ok_or_else(|| anyhow!("Workspace '{workspace_id}' has no active session"))?;
        let target_repo = self.resolve_repo(&workspace, &repos, repo_name.as_deref())?;

        match command {
            SlashCommand::NewSession { title } => {
                let session = self.db.create_session(workspace_id, title.as_deref())?;
                self.db.update_workspace(
                    workspace_id,
                    &WorkspaceUpdate {
                        active_session_id: Some(Some(session.id.clone())),
                        ..Default::default()
                    },
                )?;
                Ok(CommandOutcome::SessionCreated(session))
            }
            SlashCommand::FollowUp { message } => {
                let queued = self
                    .db
                    .enqueue_follow_up(&session_id, &message, None, None, None)?;
                Ok(CommandOutcome::FollowUpQueued(queued))
            }
            SlashCommand::Summary => Ok(CommandOutcome::Summary(
                self.db.list_session_executions(&session_id)?,
            )),
            SlashCommand::Run => self.submit(
                &workspace,
                &session_id,
                CommandKind::RunDevServer,
                RunReason::DevServer,
                serde_json::json!({}),
            ),
            SlashCommand::Commit { message } => self.submit(
                &workspace,
                &session_id,
                CommandKind::GitCommit,
                RunReason::System,
                serde_json::json!({
                    "message": message.unwrap_or_else(|| format!("Update {}", workspace.name))
                }),
            ),
            SlashCommand::Pr { title } => self.submit(
                &workspace,
                &session_id,
                CommandKind::OpenPr,
                RunReason::System,
                serde_json::json!({
                    "title": title.unwrap_or_else(|| workspace.name.clone())
                }),
            ),
            SlashCommand::Attach { pr_number } => self.submit(
                &workspace,
                &session_id,
                CommandKind::AttachPr,
                RunReason::System,
                serde_json::json!({ "prNumber": pr_number }),
            ),
            SlashCommand::Diff => {
                let path = self
                    .worktrees
                    .worktree_path(&workspace.id, &target_repo.repo_name)?;
                let totals = tokio::task::spawn_blocking(move || diff_summary(&path))
                    .await
                    .map_err(|e| anyhow!("Diff task join error: {e}"))??;
                Ok(CommandOutcome::Diff(totals))
            }
            SlashCommand::GitStatus => {
                let path = self
                    .worktrees
                    .worktree_path(&workspace.id, &target_repo.repo_name)?;
                let summary = tokio::task::spawn_blocking(move || repo_state_summary(&path))
                    .await
                    .map_err(|e| anyhow!("Status task join error: {e}"))??;
                Ok(CommandOutcome::GitStatus(summary))
            }
            SlashCommand::SetActiveRepo { repo_name } => {
                let repo = self.db.get_workspace_repo_by_name(workspace_id, &repo_name)?;
                self.db.update_workspace(
                    workspace_id,
                    &WorkspaceUpdate {
                        active_workspace_repo_id: Some(Some(repo.id.clone())),
                        ..Default::default()
                    },
                )?;
                Ok(CommandOutcome::ActiveRepoSet(repo))
            }
        }
    }

    fn resolve_repo(
        &self,
        workspace: &Workspace,
        repos: &[WorkspaceRepo],
        prefix: Option<&str>,
    ) -> Result<WorkspaceRepo> {
        if let Some(name) = prefix {
            return repos
                .iter()
                .find(|repo| repo.repo_name == name)
                .cloned()
                .ok_or_else(|| anyhow!("No repo '{name}' in workspace '{}'", workspace.id));
        }
        workspace
            .active_workspace_repo_id
            .as_ref()
            .and_then(|id| repos.iter().find(|repo| &repo.id == id))
            .or_else(|| repos.first())
            .cloned()
            .ok_or_else(|| anyhow!("Workspace '{}' has no repos", workspace.id))
    }

    fn submit(
        &self,
        workspace: &Workspace,
        session_id: &str,
        kind: CommandKind,
        run_reason: RunReason,
        params: serde_json::Value,
    ) -> Result<CommandOutcome> {
        let intent = ExecutionIntent {
            intent_id: Uuid::new_v4().to_string(),
            nonce: Uuid::new_v4().to_string(),
            target_device_id: self.device_id.clone(),
            issued_at: now_ms(),
            ttl_ms: DEFAULT_INTENT_TTL_MS,
            workspace_id: workspace.id.clone(),
            session_id: session_id.to_string(),
            execution_id: Uuid::new_v4().to_string(),
            run_reason,
            command_kind: kind.as_str().to_string(),
            params,
            principal: workspace.owner.clone(),
            signature: String::new(),
        }
        .sign(&self.device_key);

        self.db.submit_intent(&intent)?;
        Ok(CommandOutcome::IntentSubmitted {
            intent_id: intent.intent_id,
            execution_id: intent.execution_id,
            command_kind: kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::cli::test_support::run_git;
    use crate::domains::workspaces::entity::{NewWorkspace, NewWorkspaceRepo};
    use crate::domains::worktrees::resolve_managed_root;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn fixture() -> (
        TempDir,
        TempDir,
        Database,
        CommandGateway,
        Workspace,
        Arc<WorktreeManager>,
    ) {
        let db_tmp = TempDir::new().unwrap();
        let db = Database::new(Some(db_tmp.path().join("test.db"))).unwrap();
        let (workspace, _) = db
            .create_workspace(&NewWorkspace {
                owner: "alice".into(),
                org: None,
                project: None,
                name: "W1".into(),
                branch: "feat/x".into(),
                repos: vec![
                    NewWorkspaceRepo {
                        repo_id: "r-app".into(),
                        repo_name: "app".into(),
                        target_branch: "main".into(),
                        enabled: true,
                    },
                    NewWorkspaceRepo {
                        repo_id: "r-docs".into(),
                        repo_name: "docs".into(),
                        target_branch: "main".into(),
                        enabled: true,
                    },
                ],
                initial_session_title: None,
            })
            .unwrap();

        let root_tmp = TempDir::new().unwrap();
        let managed_root = resolve_managed_root(Some(root_tmp.path())).unwrap();
        let worktrees = Arc::new(WorktreeManager::new(managed_root, HashMap::new()));
        let gateway =
            CommandGateway::new(db.clone(), worktrees.clone(), "d-1".into(), "key".into());
        (db_tmp, root_tmp, db, gateway, workspace, worktrees)
    }

    #[tokio::test]
    async fn follow_up_lands_in_the_session_slot() {
        let (_a, _b, db, gateway, workspace, _worktrees) = fixture();
        let outcome = gateway
            .apply(&workspace.id, "/follow-up bump the version")
            .await
            .unwrap();

        match outcome {
            CommandOutcome::FollowUpQueued(queued) => {
                assert_eq!(queued.message, "bump the version");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let session_id = workspace.active_session_id.unwrap();
        assert!(db.get_queue_status(&session_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn new_session_becomes_active() {
        let (_a, _b, db, gateway, workspace, _worktrees) = fixture();
        let outcome = gateway
            .apply(&workspace.id, "/new-session refactor pass")
            .await
            .unwrap();

        let CommandOutcome::SessionCreated(session) = outcome else {
            panic!("expected SessionCreated");
        };
        assert_eq!(session.title.as_deref(), Some("refactor pass"));
        assert_eq!(
            db.get_workspace(&workspace.id)
                .unwrap()
                .active_session_id
                .as_deref(),
            Some(session.id.as_str())
        );
    }

    #[tokio::test]
    async fn commit_submits_a_signed_intent() {
        let (_a, _b, db, gateway, workspace, _worktrees) = fixture();
        let outcome = gateway
            .apply(&workspace.id, "/commit polish error copy")
            .await
            .unwrap();

        let CommandOutcome::IntentSubmitted {
            execution_id,
            command_kind,
            ..
        } = outcome
        else {
            panic!("expected IntentSubmitted");
        };
        assert_eq!(command_kind, CommandKind::GitCommit);

        let pending = db.pending_intents_for_device("d-1", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].verify_signature("key"));
        assert_eq!(pending[0].params["message"], "polish error copy");
        assert_eq!(
            db.get_execution(&execution_id).unwrap().status,
            crate::domains::executions::ExecutionStatus::Pending
        );
    }

    #[tokio::test]
    async fn set_active_repo_then_unprefixed_commands_use_it() {
        let (_a, _b, db, gateway, workspace, _worktrees) = fixture();
        let outcome = gateway
            .apply(&workspace.id, "/set-active-repo docs")
            .await
            .unwrap();
        let CommandOutcome::ActiveRepoSet(repo) = outcome else {
            panic!("expected ActiveRepoSet");
        };
        assert_eq!(repo.repo_name, "docs");
        assert_eq!(
            db.get_workspace(&workspace.id)
                .unwrap()
                .active_workspace_repo_id,
            Some(repo.id)
        );

        assert!(
            gateway
                .apply(&workspace.id, "/set-active-repo missing")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn repo_scoped_git_status_reads_the_worktree() {
        let (_a, _b, _db, gateway, workspace, worktrees) = fixture();

        // Materialize a repo where the worktree for "app" would live.
        let path = worktrees.worktree_path(&workspace.id, "app").unwrap();
        std::fs::create_dir_all(&path).unwrap();
        run_git(&path, &["init", "-b", "feat/x"]);
        run_git(&path, &["config", "user.email", "t@example.com"]);
        run_git(&path, &["config", "user.name", "T"]);
        std::fs::write(path.join("a.txt"), "a\n").unwrap();
        run_git(&path, &["add", "."]);
        run_git(&path, &["commit", "-m", "init"]);

        let outcome = gateway
            .apply(&workspace.id, "/app git-status")
            .await
            .unwrap();
        let CommandOutcome::GitStatus(summary) = outcome else {
            panic!("expected GitStatus");
        };
        assert_eq!(summary.branch, "feat/x");
        assert!(summary.clean);

        std::fs::write(path.join("dirty.txt"), "wip\n").unwrap();
        let outcome = gateway.apply(&workspace.id, "/app diff").await.unwrap();
        let CommandOutcome::Diff(totals) = outcome else {
            panic!("expected Diff");
        };
        assert_eq!(totals.files_changed, 1);
    }

    #[tokio::test]
    async fn summary_lists_session_executions() {
        let (_a, _b, db, gateway, workspace, _worktrees) = fixture();
        let session_id = workspace.active_session_id.clone().unwrap();
        db.start_execution(&workspace.id, &session_id, RunReason::CodingAgent, None)
            .unwrap();

        let outcome = gateway.apply(&workspace.id, "/summary").await.unwrap();
        let CommandOutcome::Summary(executions) = outcome else {
            panic!("expected Summary");
        };
        assert_eq!(executions.len(), 1);
    }
}
