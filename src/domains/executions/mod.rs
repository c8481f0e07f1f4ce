pub mod db_executions;
pub mod entity;

pub use db_executions::ExecutionMethods;
pub use entity::{
    ExecutionProcess, ExecutionRepoState, ExecutionStatus, RepoStatePatch, RunReason,
};
