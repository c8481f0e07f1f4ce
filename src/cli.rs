use crate::config::RunnerConfig;
use clap::Parser;
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Workspace execution runner: pulls typed execution intents from the
/// control plane and runs them in managed git worktrees.
#[derive(Debug, Parser)]
#[command(name = "leitwerk", version = VERSION)]
pub struct Cli {
    /// Path to the runner configuration file (TOML).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the managed-root parent directory; the runner nests its
    /// own well-known subdirectory beneath it.
    #[arg(long)]
    pub managed_root: Option<PathBuf>,

    /// Override the enrolled device id from the config file.
    #[arg(long)]
    pub device_id: Option<String>,

    /// Override the control-plane store location.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Run a single dispatch cycle and exit instead of polling forever.
    #[arg(long)]
    pub once: bool,
}

pub fn apply_cli_overrides(config: &mut RunnerConfig, cli: &Cli) {
    if let Some(managed_root) = &cli.managed_root {
        config.managed_root = Some(managed_root.clone());
    }
    if let Some(device_id) = &cli.device_id {
        config.device_id = device_id.clone();
    }
    if let Some(db_path) = &cli.db_path {
        config.db_path = Some(db_path.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_config_values() {
        let cli = Cli::parse_from([
            "leitwerk",
            "--device-id",
            "d-override",
            "--managed-root",
            "/srv/agents",
        ]);
        let mut config = RunnerConfig {
            device_id: "d-file".into(),
            ..Default::default()
        };
        apply_cli_overrides(&mut config, &cli);

        assert_eq!(config.device_id, "d-override");
        assert_eq!(config.managed_root, Some(PathBuf::from("/srv/agents")));
        assert!(config.db_path.is_none());
    }

    #[test]
    fn once_flag_defaults_off() {
        let cli = Cli::parse_from(["leitwerk"]);
        assert!(!cli.once);
        let cli = Cli::parse_from(["leitwerk", "--once"]);
        assert!(cli.once);
    }
}
