pub mod chain;
pub mod reset;
pub mod service;

pub use chain::{ChainPlan, ChainStep, SetupMode, plan_chain, setup_mode};
pub use reset::{ResetOutcome, reset_session};
pub use service::Orchestrator;
