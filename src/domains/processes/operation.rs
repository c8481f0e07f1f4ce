use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The closed set of operations a runner will execute. Dispatch intents
/// name one of these; there is no raw-shell passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    RunSetupScript,
    RunCleanupScript,
    RunArchiveScript,
    RunDevServer,
    RunCodingAgent,
    GitCommit,
    GitPush,
    OpenPr,
    AttachPr,
    TerminalSession,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::RunSetupScript => "run_setup_script",
            CommandKind::RunCleanupScript => "run_cleanup_script",
            CommandKind::RunArchiveScript => "run_archive_script",
            CommandKind::RunDevServer => "run_dev_server",
            CommandKind::RunCodingAgent => "run_coding_agent",
            CommandKind::GitCommit => "git_commit",
            CommandKind::GitPush => "git_push",
            CommandKind::OpenPr => "open_pr",
            CommandKind::AttachPr => "attach_pr",
            CommandKind::TerminalSession => "terminal_session",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run_setup_script" => Some(CommandKind::RunSetupScript),
            "run_cleanup_script" => Some(CommandKind::RunCleanupScript),
            "run_archive_script" => Some(CommandKind::RunArchiveScript),
            "run_dev_server" => Some(CommandKind::RunDevServer),
            "run_coding_agent" => Some(CommandKind::RunCodingAgent),
            "git_commit" => Some(CommandKind::GitCommit),
            "git_push" => Some(CommandKind::GitPush),
            "open_pr" => Some(CommandKind::OpenPr),
            "attach_pr" => Some(CommandKind::AttachPr),
            "terminal_session" => Some(CommandKind::TerminalSession),
            _ => None,
        }
    }
}

/// Per-kind parameter payloads, validated from the intent's raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationParams {
    Script,
    CodingAgent { prompt: String, executor: Option<String> },
    GitCommit { message: String },
    GitPush,
    OpenPr { title: String, body: Option<String> },
    AttachPr { pr_number: i64 },
    TerminalSession,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CodingAgentRaw {
    prompt: String,
    #[serde(default)]
    executor: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GitCommitRaw {
    message: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OpenPrRaw {
    title: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct AttachPrRaw {
    pr_number: i64,
}

/// Validates the raw params object against the schema of the given kind.
/// Unknown fields are rejected so a malformed control plane cannot smuggle
/// extra payload past the runner.
pub fn validate_params(kind: CommandKind, value: &serde_json::Value) -> Result<OperationParams> {
    let fail = |e: serde_json::Error| anyhow!("Invalid params for {}: {e}", kind.as_str());
    match kind {
        CommandKind::RunSetupScript
        | CommandKind::RunCleanupScript
        | CommandKind::RunArchiveScript
        | CommandKind::RunDevServer => Ok(OperationParams::Script),
        CommandKind::RunCodingAgent => {
            let raw: CodingAgentRaw = serde_json::from_value(value.clone()).map_err(fail)?;
            if raw.prompt.trim().is_empty() {
                return Err(anyhow!("Coding agent prompt must not be empty"));
            }
            Ok(OperationParams::CodingAgent {
                prompt: raw.prompt,
                executor: raw.executor,
            })
        }
        CommandKind::GitCommit => {
            let raw: GitCommitRaw = serde_json::from_value(value.clone()).map_err(fail)?;
            Ok(OperationParams::GitCommit {
                message: raw.message,
            })
        }
        CommandKind::GitPush => Ok(OperationParams::GitPush),
        CommandKind::OpenPr => {
            let raw: OpenPrRaw = serde_json::from_value(value.clone()).map_err(fail)?;
            Ok(OperationParams::OpenPr {
                title: raw.title,
                body: raw.body,
            })
        }
        CommandKind::AttachPr => {
            let raw: AttachPrRaw = serde_json::from_value(value.clone()).map_err(fail)?;
            Ok(OperationParams::AttachPr {
                pr_number: raw.pr_number,
            })
        }
        CommandKind::TerminalSession => Ok(OperationParams::TerminalSession),
    }
}

/// Operator-configured scripts and command templates for one repository.
/// These are the only strings that ever reach a shell; caller-provided data
/// is passed as single argv elements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoScripts {
    #[serde(default)]
    pub setup_scripts: Vec<SetupScript>,
    #[serde(default)]
    pub cleanup_script: Option<String>,
    #[serde(default)]
    pub archive_script: Option<String>,
    #[serde(default)]
    pub dev_server_script: Option<String>,
    /// Agent invocation template, e.g. `claude --permission-mode plan`.
    /// The prompt is appended as one argument.
    #[serde(default)]
    pub agent_command: Option<String>,
    /// Git-host CLI used for PR operations, e.g. `gh`.
    #[serde(default)]
    pub pr_command: Option<String>,
}

impl RepoScripts {
    pub fn all_setup_parallel(&self) -> bool {
        !self.setup_scripts.is_empty() && self.setup_scripts.iter().all(|s| s.parallel)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupScript {
    pub command: String,
    #[serde(default)]
    pub parallel: bool,
}

/// Identity injected into every supervised process.
#[derive(Debug, Clone)]
pub struct ExecutionEnv {
    pub workspace_id: String,
    pub workspace_branch: String,
    pub session_id: String,
}

impl ExecutionEnv {
    pub fn to_env_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("VK_WORKSPACE_ID".to_string(), self.workspace_id.clone()),
            (
                "VK_WORKSPACE_BRANCH".to_string(),
                self.workspace_branch.clone(),
            ),
            ("VK_SESSION_ID".to_string(), self.session_id.clone()),
        ]
    }
}

/// A fully resolved process invocation: program, argv, environment, cwd.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

pub const DEFAULT_PR_COMMAND: &str = "gh";

fn shell_spec(script: &str, env: &ExecutionEnv, cwd: &PathBuf) -> CommandSpec {
    CommandSpec {
        program: "bash".to_string(),
        args: vec!["-lc".to_string(), script.to_string()],
        env: env.to_env_pairs(),
        cwd: cwd.clone(),
    }
}

/// Resolve a bare program name through PATH, leaving absolute and relative
/// paths untouched. A miss keeps the raw name so spawn reports the error.
fn resolve_program(program: &str) -> String {
    if program.contains('/') {
        return program.to_string();
    }
    match which::which(program) {
        Ok(path) => path.to_string_lossy().to_string(),
        Err(_) => program.to_string(),
    }
}

fn split_template(template: &str, what: &str) -> Result<(String, Vec<String>)> {
    let tokens = shell_words::split(template)
        .map_err(|e| anyhow!("Failed to parse {what} template '{template}': {e}"))?;
    let mut iter = tokens.into_iter();
    let program = iter
        .next()
        .ok_or_else(|| anyhow!("Empty {what} template"))?;
    Ok((resolve_program(&program), iter.collect()))
}

/// Substitute validated params into the fixed template of the operation
/// kind. The script templates come from repo configuration; the caller's
/// payload never touches a shell.
pub fn build_command_spec(
    kind: CommandKind,
    params: &OperationParams,
    scripts: &RepoScripts,
    env: &ExecutionEnv,
    cwd: &PathBuf,
    setup_index: usize,
) -> Result<CommandSpec> {
    match (kind, params) {
        (CommandKind::RunSetupScript, OperationParams::Script) => {
            let script = scripts
                .setup_scripts
                .get(setup_index)
                .ok_or_else(|| anyhow!("No setup script at index {setup_index}"))?;
            Ok(shell_spec(&script.command, env, cwd))
        }
        (CommandKind::RunCleanupScript, OperationParams::Script) => {
            let script = scripts
                .cleanup_script
                .as_deref()
                .ok_or_else(|| anyhow!("No cleanup script configured"))?;
            Ok(shell_spec(script, env, cwd))
        }
        (CommandKind::RunArchiveScript, OperationParams::Script) => {
            let script = scripts
                .archive_script
                .as_deref()
                .ok_or_else(|| anyhow!("No archive script configured"))?;
            Ok(shell_spec(script, env, cwd))
        }
        (CommandKind::RunDevServer, OperationParams::Script) => {
            let script = scripts
                .dev_server_script
                .as_deref()
                .ok_or_else(|| anyhow!("No dev server script configured"))?;
            Ok(shell_spec(script, env, cwd))
        }
        (CommandKind::RunCodingAgent, OperationParams::CodingAgent { prompt, executor }) => {
            let template = executor
                .as_deref()
                .or(scripts.agent_command.as_deref())
                .ok_or_else(|| anyhow!("No agent command configured"))?;
            let (program, mut args) = split_template(template, "agent")?;
            args.push(prompt.clone());
            Ok(CommandSpec {
                program,
                args,
                env: env.to_env_pairs(),
                cwd: cwd.clone(),
            })
        }
        (CommandKind::GitCommit, OperationParams::GitCommit { message }) => Ok(CommandSpec {
            program: "git".to_string(),
            args: vec![
                "commit".to_string(),
                "-am".to_string(),
                message.clone(),
            ],
            env: env.to_env_pairs(),
            cwd: cwd.clone(),
        }),
        (CommandKind::GitPush, OperationParams::GitPush) => Ok(CommandSpec {
            program: "git".to_string(),
            args: vec![
                "push".to_string(),
                "-u".to_string(),
                "origin".to_string(),
                env.workspace_branch.clone(),
            ],
            env: env.to_env_pairs(),
            cwd: cwd.clone(),
        }),
        (CommandKind::OpenPr, OperationParams::OpenPr { title, body }) => {
            let template = scripts.pr_command.as_deref().unwrap_or(DEFAULT_PR_COMMAND);
            let (program, mut args) = split_template(template, "pr")?;
            args.extend([
                "pr".to_string(),
                "create".to_string(),
                "--head".to_string(),
                env.workspace_branch.clone(),
                "--title".to_string(),
                title.clone(),
                "--body".to_string(),
                body.clone().unwrap_or_default(),
            ]);
            Ok(CommandSpec {
                program,
                args,
                env: env.to_env_pairs(),
                cwd: cwd.clone(),
            })
        }
        (CommandKind::AttachPr, OperationParams::AttachPr { pr_number }) => {
            let template = scripts.pr_command.as_deref().unwrap_or(DEFAULT_PR_COMMAND);
            let (program, mut args) = split_template(template, "pr")?;
            args.extend([
                "pr".to_string(),
                "view".to_string(),
                pr_number.to_string(),
                "--json".to_string(),
                "url,number".to_string(),
            ]);
            Ok(CommandSpec {
                program,
                args,
                env: env.to_env_pairs(),
                cwd: cwd.clone(),
            })
        }
        (CommandKind::TerminalSession, OperationParams::TerminalSession) => {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            Ok(CommandSpec {
                program: shell,
                args: vec!["-i".to_string()],
                env: env.to_env_pairs(),
                cwd: cwd.clone(),
            })
        }
        (kind, params) => Err(anyhow!(
            "Params {params:?} do not match operation kind {}",
            kind.as_str()
        )),
    }
}
