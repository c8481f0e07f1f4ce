use crate::domains::processes::operation::RepoScripts;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_LEASE_TTL_MS: i64 = 30_000;
pub const DEFAULT_DISPATCH_POLL_MS: u64 = 1_000;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;
pub const DEFAULT_LOG_RING_BYTES: usize = 256 * 1024;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_INTENT_TTL_MS: i64 = 60_000;

/// One locally cloned repository the runner may create worktrees from,
/// with its operator-configured scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub source_path: PathBuf,
    #[serde(flatten)]
    pub scripts: RepoScripts,
}

/// Runner configuration, loaded from a TOML file with CLI overrides on
/// top. The device identity is required; everything else has defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub device_id: String,
    /// Shared enrollment key used to verify intent envelope digests.
    pub device_key: String,
    /// Operator override; the managed root nests a well-known
    /// subdirectory beneath it and never uses the override itself.
    pub managed_root: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub lease_ttl_ms: i64,
    pub dispatch_poll_ms: u64,
    pub cancel_grace_ms: u64,
    pub log_ring_bytes: usize,
    pub retry_attempts: u32,
    /// Repo id -> local clone + scripts.
    pub repos: HashMap<String, RepoConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_key: String::new(),
            managed_root: None,
            db_path: None,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            dispatch_poll_ms: DEFAULT_DISPATCH_POLL_MS,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            log_ring_bytes: DEFAULT_LOG_RING_BYTES,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            repos: HashMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Fatal-config validation; failures map to exit code 64.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(anyhow!("device_id must be configured"));
        }
        if self.lease_ttl_ms <= 0 {
            return Err(anyhow!("lease_ttl_ms must be positive"));
        }
        for (repo_id, repo) in &self.repos {
            if !repo.source_path.is_dir() {
                return Err(anyhow!(
                    "Repo '{repo_id}' source path {} is not a directory",
                    repo.source_path.display()
                ));
            }
        }
        Ok(())
    }

    pub fn repo_sources(&self) -> HashMap<String, PathBuf> {
        self.repos
            .iter()
            .map(|(id, repo)| (id.clone(), repo.source_path.clone()))
            .collect()
    }

    pub fn scripts_for(&self, repo_id: &str) -> RepoScripts {
        self.repos
            .get(repo_id)
            .map(|repo| repo.scripts.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn minimal_toml_gets_defaults() {
        let config: RunnerConfig = toml::from_str(
            r#"
            device_id = "d-1"
            device_key = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.device_id, "d-1");
        assert_eq!(config.lease_ttl_ms, DEFAULT_LEASE_TTL_MS);
        assert_eq!(config.dispatch_poll_ms, DEFAULT_DISPATCH_POLL_MS);
        assert!(config.repos.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn repo_sections_parse_scripts_inline() {
        let tmp = TempDir::new().unwrap();
        let toml = format!(
            r#"
            device_id = "d-1"
            device_key = "secret"

            [repos.r-app]
            source_path = "{}"
            agent_command = "claude --permission-mode plan"
            cleanup_script = "make clean"

            [[repos.r-app.setup_scripts]]
            command = "npm install"
            parallel = true
            "#,
            tmp.path().display()
        );
        let config: RunnerConfig = toml::from_str(&toml).unwrap();
        config.validate().unwrap();

        let scripts = config.scripts_for("r-app");
        assert_eq!(scripts.setup_scripts.len(), 1);
        assert!(scripts.setup_scripts[0].parallel);
        assert_eq!(scripts.cleanup_script.as_deref(), Some("make clean"));
        assert_eq!(
            config.repo_sources().get("r-app"),
            Some(&tmp.path().to_path_buf())
        );
        // Unconfigured repos fall back to empty scripts.
        assert!(config.scripts_for("r-other").setup_scripts.is_empty());
    }

    #[test]
    fn validation_catches_fatal_config() {
        let mut config = RunnerConfig::default();
        assert!(config.validate().is_err());

        config.device_id = "d-1".into();
        config.lease_ttl_ms = 0;
        assert!(config.validate().is_err());

        config.lease_ttl_ms = 30_000;
        config.repos.insert(
            "r-x".into(),
            RepoConfig {
                source_path: PathBuf::from("/definitely/not/here"),
                scripts: RepoScripts::default(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_round_trips_through_a_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("leitwerk.toml");
        std::fs::write(&path, "device_id = \"d-9\"\ndevice_key = \"k\"\n").unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.device_id, "d-9");
        assert!(RunnerConfig::load(&tmp.path().join("missing.toml")).is_err());
    }
}
