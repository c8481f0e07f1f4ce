pub mod log_sink;
pub mod operation;
pub mod supervisor;

pub use log_sink::{LogRecord, LogRing, LogStream, read_log_file};
pub use operation::{
    CommandKind, CommandSpec, ExecutionEnv, OperationParams, RepoScripts, SetupScript,
    validate_params,
};
pub use supervisor::{
    ExecutionHandle, ExitOutcome, ProcessSupervisor, ShutdownGuard, StdinPolicy, SUPERVISOR,
    is_pid_alive,
};
