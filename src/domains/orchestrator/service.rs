use super::chain::{ChainStep, SetupMode, plan_chain};
use crate::config::RunnerConfig;
use crate::domains::approvals::{ApprovalBroker, ApprovalMethods};
use crate::domains::dispatch::{DispatchClient, ExecutionIntent};
use crate::domains::executions::{ExecutionMethods, ExecutionStatus, RunReason};
use crate::domains::git::{RepoCheckout, SnapshotService};
use crate::domains::leases::{LeaseGuard, LeaseManager};
use crate::domains::processes::operation::{
    CommandKind, ExecutionEnv, OperationParams, RepoScripts, build_command_spec, validate_params,
};
use crate::domains::processes::supervisor::{ExecutionHandle, ProcessSupervisor, StdinPolicy};
use crate::domains::queue::QueueMethods;
use crate::domains::workspaces::{Workspace, WorkspaceMethods, WorkspaceRepo};
use crate::errors::{RunnerError, as_runner_error, with_backoff};
use crate::events::StoreEvent;
use crate::infrastructure::database::Database;
use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Drives the execution state machine: claims dispatched intents, chains
/// setup → coding_agent → cleanup → archive actions, consumes the
/// follow-up queue, and brokers cancellation.
pub struct Orchestrator {
    db: Database,
    worktrees: Arc<crate::domains::worktrees::WorktreeManager>,
    supervisor: Arc<ProcessSupervisor>,
    snapshots: SnapshotService,
    leases: LeaseManager,
    approvals: ApprovalBroker,
    config: RunnerConfig,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        worktrees: Arc<crate::domains::worktrees::WorktreeManager>,
        supervisor: Arc<ProcessSupervisor>,
        config: RunnerConfig,
    ) -> Arc<Self> {
        let leases = LeaseManager::new(db.clone(), config.device_id.clone(), config.lease_ttl_ms);
        Arc::new(Self {
            snapshots: SnapshotService::new(db.clone()),
            approvals: ApprovalBroker::new(db.clone()),
            leases,
            db,
            worktrees,
            supervisor,
            config,
        })
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Claims a validated intent: lease first, then the idempotent ack,
    /// then the pending → running transition, and finally the chain is
    /// driven on its own task. `AlreadyLeased` means another runner owns
    /// the execution and is not an error.
    pub async fn handle_intent(
        self: &Arc<Self>,
        client: &DispatchClient,
        intent: ExecutionIntent,
    ) -> Result<()> {
        let kind = CommandKind::parse(&intent.command_kind)
            .ok_or_else(|| anyhow!("Unknown command kind '{}'", intent.command_kind))?;
        let params = validate_params(kind, &intent.params)?;

        let lease = match self.leases.acquire(&intent.execution_id, None) {
            Ok(lease) => lease,
            Err(error) => {
                if matches!(
                    as_runner_error(&error),
                    Some(RunnerError::AlreadyLeased { .. })
                ) {
                    debug!(
                        "Execution {} is leased by another runner; skipping",
                        intent.execution_id
                    );
                    return Ok(());
                }
                return Err(error);
            }
        };

        client.acknowledge(&intent).await?;
        self.db.mark_execution_running(&intent.execution_id)?;
        let workspace = self.db.get_workspace(&intent.workspace_id)?;

        info!(
            "Claimed execution {} ({} in workspace {})",
            intent.execution_id, intent.command_kind, workspace.id
        );

        let this = Arc::clone(self);
        let session_id = intent.session_id.clone();
        let execution_id = intent.execution_id;
        tokio::spawn(async move {
            this.drive_chain(workspace, session_id, kind, params, execution_id, lease)
                .await;
        });
        Ok(())
    }

    /// Runs the whole action chain rooted at one dispatched execution.
    /// Terminal bookkeeping for the entry execution is always performed,
    /// even when an inner step errors out.
    pub async fn drive_chain(
        self: Arc<Self>,
        workspace: Workspace,
        session_id: String,
        entry_kind: CommandKind,
        params: OperationParams,
        entry_execution_id: String,
        entry_lease: LeaseGuard,
    ) {
        let scripts = match self.active_repo_scripts(&workspace) {
            Ok((_, scripts)) => scripts,
            Err(error) => {
                self.fail_entry(&entry_execution_id, entry_lease, &error).await;
                return;
            }
        };
        let plan = plan_chain(entry_kind, &scripts);

        match entry_kind {
            CommandKind::RunCodingAgent => {
                self.drive_coding_chain(
                    &workspace,
                    &session_id,
                    &scripts,
                    plan.setup_mode,
                    &plan.steps,
                    entry_execution_id,
                    entry_lease,
                    params,
                )
                .await;
            }
            CommandKind::RunArchiveScript => {
                if plan.steps.contains(&ChainStep::Cleanup) {
                    self.run_chained_step(&workspace, &session_id, ChainStep::Cleanup)
                        .await;
                }
                if scripts.archive_script.is_none() {
                    self.fail_entry(
                        &entry_execution_id,
                        entry_lease,
                        &anyhow!("No archive script configured"),
                    )
                    .await;
                    return;
                }
                let _ = self
                    .run_single(
                        &entry_execution_id,
                        &workspace,
                        &session_id,
                        CommandKind::RunArchiveScript,
                        &OperationParams::Script,
                        0,
                        entry_lease,
                    )
                    .await;
            }
            _ => {
                let _ = self
                    .run_single(
                        &entry_execution_id,
                        &workspace,
                        &session_id,
                        entry_kind,
                        &params,
                        0,
                        entry_lease,
                    )
                    .await;
            }
        }
    }

    /// Setup actions, the coding action, the follow-up loop, and trailing
    /// cleanup. Sequential setups gate the coding action; parallel setups
    /// start independently alongside it.
    #[allow(clippy::too_many_arguments)]
    async fn drive_coding_chain(
        self: &Arc<Self>,
        workspace: &Workspace,
        session_id: &str,
        scripts: &RepoScripts,
        setup_mode: SetupMode,
        steps: &[ChainStep],
        entry_execution_id: String,
        entry_lease: LeaseGuard,
        params: OperationParams,
    ) {
        match setup_mode {
            SetupMode::None => {}
            SetupMode::Parallel => {
                for step in steps.iter().copied() {
                    if let ChainStep::Setup(index) = step {
                        let this = Arc::clone(self);
                        let workspace = workspace.clone();
                        let session_id = session_id.to_string();
                        tokio::spawn(async move {
                            this.run_chained_setup(&workspace, &session_id, index).await;
                        });
                    }
                }
            }
            SetupMode::Sequential => {
                for step in steps.iter().copied() {
                    let ChainStep::Setup(index) = step else { continue };
                    let status = self.run_chained_setup(workspace, session_id, index).await;
                    if status != Some(ExecutionStatus::Completed) {
                        warn!("Setup script {index} did not complete; aborting chain");
                        self.fail_entry(
                            &entry_execution_id,
                            entry_lease,
                            &anyhow!("setup script {index} failed"),
                        )
                        .await;
                        let _ = self.db.discard_queued_message(session_id);
                        return;
                    }
                }
            }
        }

        // Coding action plus the follow-up loop: a completed coding
        // execution consumes the queued message and starts a successor.
        let mut execution_id = entry_execution_id;
        let mut lease = entry_lease;
        let mut params = params;
        loop {
            let status = self
                .run_single(
                    &execution_id,
                    workspace,
                    session_id,
                    CommandKind::RunCodingAgent,
                    &params,
                    0,
                    lease,
                )
                .await;

            match status {
                Ok(ExecutionStatus::Completed) => {
                    let consumed_already = self
                        .db
                        .get_execution(&execution_id)
                        .map(|e| e.queued_follow_up_consumed)
                        .unwrap_or(true);
                    if consumed_already {
                        break;
                    }
                    let queued = match self.db.consume_queued_message(session_id) {
                        Ok(queued) => queued,
                        Err(error) => {
                            warn!("Queue consumption failed: {error}");
                            break;
                        }
                    };
                    let Some(message) = queued else { break };
                    let _ = self.db.set_queued_follow_up_consumed(&execution_id);

                    info!("Starting follow-up coding execution for session {session_id}");
                    let next = match self.db.start_execution(
                        &workspace.id,
                        session_id,
                        RunReason::CodingAgent,
                        message.executor.as_deref(),
                    ) {
                        Ok(next) => next,
                        Err(error) => {
                            warn!("Could not start follow-up execution: {error}");
                            break;
                        }
                    };
                    lease = match self.leases.acquire(&next.id, None) {
                        Ok(lease) => lease,
                        Err(error) => {
                            warn!("Could not lease follow-up execution: {error}");
                            let _ = self.db.set_execution_status(
                                &next.id,
                                ExecutionStatus::Failed,
                                Some("could not acquire lease"),
                            );
                            break;
                        }
                    };
                    params = OperationParams::CodingAgent {
                        prompt: message.message,
                        executor: message.executor,
                    };
                    execution_id = next.id;
                }
                Ok(_) | Err(_) => {
                    // Failed, killed, or dropped: the queued message is
                    // discarded, never consumed.
                    let _ = self.db.discard_queued_message(session_id);
                    break;
                }
            }
        }

        if steps.contains(&ChainStep::Cleanup) {
            self.run_chained_step(workspace, session_id, ChainStep::Cleanup)
                .await;
        }
    }

    async fn run_chained_setup(
        &self,
        workspace: &Workspace,
        session_id: &str,
        index: usize,
    ) -> Option<ExecutionStatus> {
        let execution = match self.db.start_execution(
            &workspace.id,
            session_id,
            RunReason::Setup,
            None,
        ) {
            Ok(execution) => execution,
            Err(error) => {
                warn!("Could not start setup execution: {error}");
                return None;
            }
        };
        let lease = match self.leases.acquire(&execution.id, None) {
            Ok(lease) => lease,
            Err(error) => {
                warn!("Could not lease setup execution: {error}");
                return None;
            }
        };
        self.run_single(
            &execution.id,
            workspace,
            session_id,
            CommandKind::RunSetupScript,
            &OperationParams::Script,
            index,
            lease,
        )
        .await
        .ok()
    }

    async fn run_chained_step(
        &self,
        workspace: &Workspace,
        session_id: &str,
        step: ChainStep,
    ) -> Option<ExecutionStatus> {
        let (kind, reason) = match step {
            ChainStep::Cleanup => (CommandKind::RunCleanupScript, RunReason::Cleanup),
            ChainStep::Archive => (CommandKind::RunArchiveScript, RunReason::Archive),
            ChainStep::Setup(index) => {
                return self.run_chained_setup(workspace, session_id, index).await;
            }
            ChainStep::CodingAgent => return None,
        };

        let execution = match self
            .db
            .start_execution(&workspace.id, session_id, reason, None)
        {
            Ok(execution) => execution,
            Err(error) => {
                warn!("Could not start {} execution: {error}", reason.as_str());
                return None;
            }
        };
        let lease = match self.leases.acquire(&execution.id, None) {
            Ok(lease) => lease,
            Err(error) => {
                warn!("Could not lease {} execution: {error}", reason.as_str());
                return None;
            }
        };
        self.run_single(
            &execution.id,
            workspace,
            session_id,
            kind,
            &OperationParams::Script,
            0,
            lease,
        )
        .await
        .ok()
    }

    /// One execution, start to terminal: worktrees, before-snapshot,
    /// supervised process, approval gates, after-snapshot, terminal write,
    /// lease release. When the lease was lost mid-run the terminal write is
    /// left to the orphan sweep.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_single(
        &self,
        execution_id: &str,
        workspace: &Workspace,
        session_id: &str,
        kind: CommandKind,
        params: &OperationParams,
        setup_index: usize,
        lease: LeaseGuard,
    ) -> Result<ExecutionStatus> {
        let supervised = self
            .execute_supervised(execution_id, workspace, session_id, kind, params, setup_index)
            .await;

        let status = match supervised {
            Ok((status, message)) => {
                if lease.is_lost() {
                    warn!(
                        "Lease lost for execution {execution_id}; leaving terminal state to the sweep"
                    );
                    ExecutionStatus::Dropped
                } else {
                    self.db
                        .set_execution_status(execution_id, status, message.as_deref())?;
                    status
                }
            }
            Err(error) => {
                error!("Execution {execution_id} errored: {error:#}");
                if !lease.is_lost() {
                    let message = short_error_message(&error);
                    let _ = self.db.set_execution_status(
                        execution_id,
                        ExecutionStatus::Failed,
                        Some(&message),
                    );
                }
                ExecutionStatus::Failed
            }
        };

        if status != ExecutionStatus::Completed {
            let _ = self.db.cancel_pending_approvals(execution_id);
        }
        let _ = lease.release();
        Ok(status)
    }

    async fn execute_supervised(
        &self,
        execution_id: &str,
        workspace: &Workspace,
        session_id: &str,
        kind: CommandKind,
        params: &OperationParams,
        setup_index: usize,
    ) -> Result<(ExecutionStatus, Option<String>)> {
        let repos = self.db.enabled_workspace_repos(&workspace.id)?;
        if repos.is_empty() {
            return Err(anyhow!("Workspace '{}' has no enabled repos", workspace.id));
        }

        let mut checkouts = Vec::with_capacity(repos.len());
        for repo in &repos {
            let path = with_backoff("ensure worktree", self.config.retry_attempts, || {
                self.worktrees.ensure_worktree(workspace, repo)
            })
            .await?;
            checkouts.push(RepoCheckout {
                workspace_repo_id: repo.id.clone(),
                repo_name: repo.repo_name.clone(),
                path,
            });
        }

        let (active_repo, scripts) = self.active_repo_scripts(workspace)?;
        let cwd = checkouts
            .iter()
            .find(|checkout| checkout.workspace_repo_id == active_repo.id)
            .map(|checkout| checkout.path.clone())
            .unwrap_or_else(|| checkouts[0].path.clone());

        self.snapshots.record_before(execution_id, &checkouts).await?;

        let env = ExecutionEnv {
            workspace_id: workspace.id.clone(),
            workspace_branch: workspace.branch.clone(),
            session_id: session_id.to_string(),
        };
        let spec = build_command_spec(kind, params, &scripts, &env, &cwd, setup_index)?;
        let handle = self.supervisor.run(execution_id, spec, StdinPolicy::Null)?;
        if let Some(pid) = handle.pid() {
            let _ = self.leases.record_pid(execution_id, pid as i64);
        }

        let watcher = spawn_cancel_watcher(self.db.clone(), execution_id.to_string(), handle.clone());
        let outcome = handle.wait().await;
        watcher.abort();

        let (mut status, mut message) = if outcome.cancelled {
            (ExecutionStatus::Killed, Some("cancelled by user".to_string()))
        } else if outcome.success() {
            (ExecutionStatus::Completed, None)
        } else {
            let detail = match outcome.code {
                Some(code) => format!("process exited with code {code}"),
                None => "process terminated by signal".to_string(),
            };
            (ExecutionStatus::Failed, Some(detail))
        };

        // Exit code 0 alone is not completion: open approval gates must
        // all resolve in favor first.
        if status == ExecutionStatus::Completed {
            let gates = self.approvals.wait_for_resolution(execution_id).await?;
            if !gates.all_approved() {
                status = ExecutionStatus::Failed;
                message = gates.denial_message();
            }
        }

        self.snapshots.record_after(execution_id, &checkouts).await?;
        Ok((status, message))
    }

    async fn fail_entry(&self, execution_id: &str, lease: LeaseGuard, error: &anyhow::Error) {
        error!("Chain for execution {execution_id} aborted: {error:#}");
        if !lease.is_lost() {
            let message = short_error_message(error);
            let _ = self
                .db
                .set_execution_status(execution_id, ExecutionStatus::Failed, Some(&message));
        }
        let _ = lease.release();
    }

    /// Hard workspace deletion: filesystem first (guarded by the managed
    /// root), then the store rows. Archiving never comes through here;
    /// archived workspaces keep their worktrees and remain recoverable.
    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        let repos = self.db.list_workspace_repos(workspace_id)?;
        self.worktrees.remove_workspace(workspace_id, &repos).await?;
        self.db.delete_workspace(workspace_id)
    }

    fn active_repo_scripts(&self, workspace: &Workspace) -> Result<(WorkspaceRepo, RepoScripts)> {
        let repos = self.db.enabled_workspace_repos(&workspace.id)?;
        let active = workspace
            .active_workspace_repo_id
            .as_ref()
            .and_then(|id| repos.iter().find(|repo| &repo.id == id))
            .or_else(|| repos.first())
            .cloned()
            .ok_or_else(|| anyhow!("Workspace '{}' has no enabled repos", workspace.id))?;
        let scripts = self.config.scripts_for(&active.repo_id);
        Ok((active, scripts))
    }
}

/// Short, user-facing failure text for the execution document. Full chains
/// stay in the runner log.
fn short_error_message(error: &anyhow::Error) -> String {
    let text = match as_runner_error(error) {
        Some(typed) => typed.to_string(),
        None => error.to_string(),
    };
    if text.chars().count() > 200 {
        let mut truncated: String = text.chars().take(199).collect();
        truncated.push('…');
        truncated
    } else {
        text
    }
}

/// Forwards a control-plane cancellation mutation to the supervised
/// process. The initial flag check covers cancels that landed before the
/// watcher subscribed.
fn spawn_cancel_watcher(
    db: Database,
    execution_id: String,
    handle: ExecutionHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = db.events.subscribe();
        let already = db
            .get_execution(&execution_id)
            .map(|execution| execution.cancel_requested)
            .unwrap_or(false);
        if already {
            handle.cancel();
            return;
        }

        loop {
            match events.recv().await {
                Ok(StoreEvent::ExecutionCancelRequested { execution_id: id })
                    if id == execution_id =>
                {
                    info!("Cancelling execution {execution_id}");
                    handle.cancel();
                    return;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Missed events; re-check the durable flag.
                    let requested = db
                        .get_execution(&execution_id)
                        .map(|execution| execution.cancel_requested)
                        .unwrap_or(false);
                    if requested {
                        handle.cancel();
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
