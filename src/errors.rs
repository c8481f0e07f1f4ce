use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Typed failure surface of the runner. Variants map 1:1 to the dispatch
/// rejection reasons and execution failure modes the control plane knows
/// about; everything else travels as `Transient` or `Fatal`.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum RunnerError {
    UnsafePath {
        path: String,
    },
    DirtyWorktree {
        repo_name: String,
        path: String,
    },
    BranchConflict {
        branch: String,
        message: String,
    },
    NotAuthorized {
        principal: String,
        workspace_id: String,
    },
    DeviceMismatch {
        expected: String,
        actual: String,
    },
    DeviceNotEnrolled {
        device_id: String,
    },
    ReplayedNonce {
        nonce: String,
    },
    TtlExpired {
        intent_id: String,
    },
    AlreadyLeased {
        execution_id: String,
        holder_device_id: String,
    },
    LeaseLost {
        execution_id: String,
    },
    Transient {
        operation: String,
        message: String,
    },
    Fatal {
        operation: String,
        message: String,
    },
}

impl RunnerError {
    pub fn transient(operation: &str, error: impl ToString) -> Self {
        RunnerError::Transient {
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }

    pub fn fatal(operation: &str, error: impl ToString) -> Self {
        RunnerError::Fatal {
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }

    /// Only `Transient` failures are worth another attempt; every other
    /// variant is either a policy rejection or a terminal fault.
    pub fn retryable(&self) -> bool {
        matches!(self, RunnerError::Transient { .. })
    }

    /// Stable kind tag used for dispatch NACKs and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerError::UnsafePath { .. } => "unsafe_path",
            RunnerError::DirtyWorktree { .. } => "dirty_worktree",
            RunnerError::BranchConflict { .. } => "branch_conflict",
            RunnerError::NotAuthorized { .. } => "not_authorized",
            RunnerError::DeviceMismatch { .. } => "device_mismatch",
            RunnerError::DeviceNotEnrolled { .. } => "device_not_enrolled",
            RunnerError::ReplayedNonce { .. } => "replayed_nonce",
            RunnerError::TtlExpired { .. } => "ttl_expired",
            RunnerError::AlreadyLeased { .. } => "already_leased",
            RunnerError::LeaseLost { .. } => "lease_lost",
            RunnerError::Transient { .. } => "transient",
            RunnerError::Fatal { .. } => "fatal",
        }
    }
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnsafePath { path } => {
                write!(f, "Refusing to touch path outside the managed root: {path}")
            }
            Self::DirtyWorktree { repo_name, path } => {
                write!(f, "Worktree for '{repo_name}' has uncommitted changes: {path}")
            }
            Self::BranchConflict { branch, message } => {
                write!(f, "Branch conflict on '{branch}': {message}")
            }
            Self::NotAuthorized {
                principal,
                workspace_id,
            } => {
                write!(
                    f,
                    "Principal '{principal}' is not authorized for workspace '{workspace_id}'"
                )
            }
            Self::DeviceMismatch { expected, actual } => {
                write!(
                    f,
                    "Intent targets device '{expected}' but this runner is '{actual}'"
                )
            }
            Self::DeviceNotEnrolled { device_id } => {
                write!(f, "Device '{device_id}' is not enrolled or was revoked")
            }
            Self::ReplayedNonce { nonce } => {
                write!(f, "Nonce '{nonce}' was already seen")
            }
            Self::TtlExpired { intent_id } => {
                write!(f, "Intent '{intent_id}' expired before dispatch")
            }
            Self::AlreadyLeased {
                execution_id,
                holder_device_id,
            } => {
                write!(
                    f,
                    "Execution '{execution_id}' is leased by device '{holder_device_id}'"
                )
            }
            Self::LeaseLost { execution_id } => {
                write!(f, "Lease for execution '{execution_id}' was lost")
            }
            Self::Transient { operation, message } => {
                write!(f, "Transient failure during '{operation}': {message}")
            }
            Self::Fatal { operation, message } => {
                write!(f, "Fatal failure during '{operation}': {message}")
            }
        }
    }
}

impl std::error::Error for RunnerError {}

impl From<RunnerError> for String {
    fn from(error: RunnerError) -> Self {
        error.to_string()
    }
}

/// Extract the typed runner error from an `anyhow` chain, if one is there.
pub fn as_runner_error(error: &anyhow::Error) -> Option<&RunnerError> {
    error.downcast_ref::<RunnerError>()
}

const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Retry `operation` while it keeps failing with a retryable error, sleeping
/// with exponential backoff between attempts. After the attempt budget is
/// exhausted the last transient error escalates to `Fatal`.
pub async fn with_backoff<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    mut f: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retry = as_runner_error(&error).is_some_and(RunnerError::retryable);
                attempt += 1;
                if !retry {
                    return Err(error);
                }
                if attempt >= max_attempts {
                    log::warn!("Giving up on '{operation}' after {attempt} attempt(s): {error}");
                    return Err(anyhow::Error::new(RunnerError::fatal(operation, error)));
                }
                let delay = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                log::debug!("Retrying '{operation}' in {delay:?} (attempt {attempt}): {error}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
