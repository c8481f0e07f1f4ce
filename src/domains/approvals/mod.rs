pub mod broker;
pub mod db_approvals;
pub mod entity;

pub use broker::{ApprovalBroker, ApprovalOutcome, run_approval_reaper};
pub use db_approvals::ApprovalMethods;
pub use entity::{Approval, ApprovalStatus};
