use crate::cli::{Cli, apply_cli_overrides};
use crate::config::RunnerConfig;
use crate::domains::approvals::run_approval_reaper;
use crate::domains::dispatch::{DispatchClient, DispatchMethods};
use crate::domains::leases::run_orphan_sweep;
use crate::domains::orchestrator::Orchestrator;
use crate::domains::processes::supervisor::{ProcessSupervisor, SUPERVISOR, ShutdownGuard};
use crate::domains::worktrees::{WorktreeManager, resolve_managed_root};
use crate::infrastructure::database::Database;
use crate::startup::recover_after_restart;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Process exit codes of the runner binary.
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const FATAL_CONFIG: i32 = 64;
    pub const UNSAFE_MANAGED_ROOT: i32 = 65;
    pub const DEVICE_NOT_ENROLLED: i32 = 69;
    pub const INTERNAL_ERROR: i32 = 70;
}

fn default_config_path() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|dir| dir.join("leitwerk").join("leitwerk.toml"))
}

/// Full runner lifecycle: config, store, recovery, background sweeps, and
/// the dispatch loop. Returns the process exit code.
pub async fn run(cli: Cli) -> i32 {
    let mut config = match &cli.config {
        Some(path) => match RunnerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{e:#}");
                return exit_codes::FATAL_CONFIG;
            }
        },
        None => match default_config_path().filter(|path| path.exists()) {
            Some(path) => match RunnerConfig::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    error!("{e:#}");
                    return exit_codes::FATAL_CONFIG;
                }
            },
            None => RunnerConfig::default(),
        },
    };
    apply_cli_overrides(&mut config, &cli);
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e:#}");
        return exit_codes::FATAL_CONFIG;
    }

    let managed_root = match resolve_managed_root(config.managed_root.as_deref()) {
        Ok(root) => root,
        Err(e) => {
            error!("Managed root is unusable: {e:#}");
            return exit_codes::UNSAFE_MANAGED_ROOT;
        }
    };
    info!("Managed root: {}", managed_root.display());

    let db = match Database::new(config.db_path.clone()) {
        Ok(db) => db,
        Err(e) => {
            error!("Could not open control-plane store: {e:#}");
            return exit_codes::INTERNAL_ERROR;
        }
    };

    match db.get_enrollment(&config.device_id) {
        Ok(Some(enrollment)) if !enrollment.is_revoked() => {
            info!("Device {} enrolled to {}", config.device_id, enrollment.owning_principal);
        }
        Ok(_) => {
            error!("Device '{}' is not enrolled (or revoked)", config.device_id);
            return exit_codes::DEVICE_NOT_ENROLLED;
        }
        Err(e) => {
            error!("Enrollment lookup failed: {e:#}");
            return exit_codes::INTERNAL_ERROR;
        }
    }

    let worktrees = Arc::new(WorktreeManager::new(
        managed_root.clone(),
        config.repo_sources(),
    ));
    let supervisor = ProcessSupervisor::new(
        worktrees.logs_dir(),
        Duration::from_millis(config.cancel_grace_ms),
        config.log_ring_bytes,
    );
    let _ = SUPERVISOR.set(supervisor.clone());
    let _shutdown_guard = ShutdownGuard;

    let orchestrator = Orchestrator::new(db.clone(), worktrees, supervisor, config.clone());

    match recover_after_restart(&db, &config.device_id).await {
        Ok(actions) if !actions.is_empty() => {
            info!("Startup recovery handled {} execution(s)", actions.len());
        }
        Ok(_) => {}
        Err(e) => warn!("Startup recovery failed: {e:#}"),
    }

    let sweep_interval = Duration::from_millis((config.lease_ttl_ms / 2).max(1_000) as u64);
    tokio::spawn(run_orphan_sweep(db.clone(), sweep_interval));
    tokio::spawn(run_approval_reaper(db.clone(), Duration::from_secs(1)));

    let client = DispatchClient::new(Arc::new(db.clone()), config.device_id.clone());
    let poll_interval = Duration::from_millis(config.dispatch_poll_ms);
    info!("Runner ready; polling dispatch every {poll_interval:?}");

    loop {
        match client.poll_once().await {
            Ok(intents) => {
                for intent in intents {
                    if let Err(e) = orchestrator.handle_intent(&client, intent).await {
                        warn!("Intent handling failed: {e:#}");
                    }
                }
            }
            Err(e) => warn!("Dispatch pull failed: {e:#}"),
        }

        if cli.once {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received; shutting down");
                break;
            }
        }
    }

    exit_codes::OK
}
