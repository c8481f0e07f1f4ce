pub mod db_sessions;
pub mod db_workspaces;
pub mod entity;

pub use db_sessions::SessionMethods;
pub use db_workspaces::WorkspaceMethods;
pub use entity::{
    NewWorkspace, NewWorkspaceRepo, Session, SessionStatus, Workspace, WorkspaceRepo,
    WorkspaceUpdate, project_session_status,
};
