use crate::domains::executions::entity::RunReason;
use crate::domains::processes::operation::{CommandKind, RepoScripts};

/// How configured setup scripts relate to the coding action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupMode {
    /// No setup scripts; the coding action starts immediately.
    None,
    /// Setup actions chain one after another into the coding action.
    Sequential,
    /// Every setup script is marked parallel; setups and the coding
    /// action all start independently.
    Parallel,
}

pub fn setup_mode(scripts: &RepoScripts) -> SetupMode {
    if scripts.setup_scripts.is_empty() {
        SetupMode::None
    } else if scripts.all_setup_parallel() {
        SetupMode::Parallel
    } else {
        SetupMode::Sequential
    }
}

/// One link of an action chain. Setup steps carry the index of the script
/// they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStep {
    Setup(usize),
    CodingAgent,
    Cleanup,
    Archive,
}

impl ChainStep {
    pub fn run_reason(&self) -> RunReason {
        match self {
            ChainStep::Setup(_) => RunReason::Setup,
            ChainStep::CodingAgent => RunReason::CodingAgent,
            ChainStep::Cleanup => RunReason::Cleanup,
            ChainStep::Archive => RunReason::Archive,
        }
    }
}

/// Full action chain for an entry operation. `cleanup` and `archive`
/// always follow the terminal transition of their predecessor, regardless
/// of its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainPlan {
    pub setup_mode: SetupMode,
    pub steps: Vec<ChainStep>,
}

pub fn plan_chain(entry: CommandKind, scripts: &RepoScripts) -> ChainPlan {
    match entry {
        CommandKind::RunCodingAgent => {
            let mode = setup_mode(scripts);
            let mut steps: Vec<ChainStep> = (0..scripts.setup_scripts.len())
                .map(ChainStep::Setup)
                .collect();
            steps.push(ChainStep::CodingAgent);
            if scripts.cleanup_script.is_some() {
                steps.push(ChainStep::Cleanup);
            }
            ChainPlan {
                setup_mode: mode,
                steps,
            }
        }
        CommandKind::RunArchiveScript => {
            let mut steps = Vec::new();
            if scripts.cleanup_script.is_some() {
                steps.push(ChainStep::Cleanup);
            }
            if scripts.archive_script.is_some() {
                steps.push(ChainStep::Archive);
            }
            ChainPlan {
                setup_mode: SetupMode::None,
                steps,
            }
        }
        // Every other operation is a single-step chain of itself.
        _ => ChainPlan {
            setup_mode: SetupMode::None,
            steps: Vec::new(),
        },
    }
}
