pub mod manager;
pub mod paths;

pub use manager::{LOGS_DIR, WorktreeManager};
pub use paths::{MANAGED_SUBDIR, ensure_within_root, resolve_managed_root};
