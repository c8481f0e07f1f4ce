use super::entity::{NewWorkspace, SessionStatus, Workspace, WorkspaceRepo, WorkspaceUpdate};
use crate::domains::workspaces::entity::Session;
use crate::events::StoreEvent;
use crate::infrastructure::database::{Database, now_ms};
use anyhow::{Result, anyhow};
use rusqlite::{Row, params};
use uuid::Uuid;

pub(crate) fn row_to_workspace(row: &Row) -> rusqlite::Result<Workspace> {
    let status: String = row.get("status")?;
    Ok(Workspace {
        id: row.get("id")?,
        owner: row.get("owner")?,
        org: row.get("org")?,
        project: row.get("project")?,
        name: row.get("name")?,
        branch: row.get("branch")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Idle),
        archived: row.get("archived")?,
        pinned: row.get("pinned")?,
        active_session_id: row.get("active_session_id")?,
        active_workspace_repo_id: row.get("active_workspace_repo_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) fn row_to_workspace_repo(row: &Row) -> rusqlite::Result<WorkspaceRepo> {
    Ok(WorkspaceRepo {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        repo_id: row.get("repo_id")?,
        repo_name: row.get("repo_name")?,
        target_branch: row.get("target_branch")?,
        enabled: row.get("enabled")?,
        sort_order: row.get("sort_order")?,
    })
}

pub trait WorkspaceMethods {
    /// Atomically inserts the workspace, its repos, and one initial session,
    /// and assigns the active-session/active-repo pointers. Either every row
    /// lands or none do.
    fn create_workspace(&self, new: &NewWorkspace) -> Result<(Workspace, Session)>;
    fn get_workspace(&self, id: &str) -> Result<Workspace>;
    fn update_workspace(&self, id: &str, patch: &WorkspaceUpdate) -> Result<Workspace>;
    fn list_workspaces(&self, owner: &str, include_archived: bool) -> Result<Vec<Workspace>>;
    /// Hard delete. Sessions, executions, repos, queue rows, and approvals
    /// cascade; the caller is responsible for filesystem cleanup under the
    /// managed root.
    fn delete_workspace(&self, id: &str) -> Result<()>;
    fn set_workspace_status(&self, id: &str, status: SessionStatus) -> Result<()>;
    fn list_workspace_repos(&self, workspace_id: &str) -> Result<Vec<WorkspaceRepo>>;
    fn enabled_workspace_repos(&self, workspace_id: &str) -> Result<Vec<WorkspaceRepo>>;
    fn get_workspace_repo(&self, id: &str) -> Result<WorkspaceRepo>;
    fn get_workspace_repo_by_name(&self, workspace_id: &str, repo_name: &str)
    -> Result<WorkspaceRepo>;
    fn set_workspace_repo_enabled(&self, id: &str, enabled: bool) -> Result<()>;
}

impl WorkspaceMethods for Database {
    fn create_workspace(&self, new: &NewWorkspace) -> Result<(Workspace, Session)> {
        if new.repos.is_empty() {
            return Err(anyhow!("A workspace needs at least one repository"));
        }

        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();

        let workspace_id = Uuid::new_v4().to_string();
        let session_id = Uuid::new_v4().to_string();

        tx.execute(
            "INSERT INTO workspaces (id, owner, org, project, name, branch, status, archived, pinned, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'idle', FALSE, FALSE, ?7, ?7)",
            params![
                workspace_id,
                new.owner,
                new.org,
                new.project,
                new.name,
                new.branch,
                now
            ],
        )?;

        let mut first_enabled_repo_id: Option<String> = None;
        for (order, repo) in new.repos.iter().enumerate() {
            let repo_row_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO workspace_repos (id, workspace_id, repo_id, repo_name, target_branch, enabled, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    repo_row_id,
                    workspace_id,
                    repo.repo_id,
                    repo.repo_name,
                    repo.target_branch,
                    repo.enabled,
                    order as i64
                ],
            )?;
            if repo.enabled && first_enabled_repo_id.is_none() {
                first_enabled_repo_id = Some(repo_row_id);
            }
        }

        tx.execute(
            "INSERT INTO sessions (id, workspace_id, title, status, last_used_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'idle', ?4, ?4, ?4)",
            params![session_id, workspace_id, new.initial_session_title, now],
        )?;

        tx.execute(
            "UPDATE workspaces SET active_session_id = ?2, active_workspace_repo_id = ?3 WHERE id = ?1",
            params![workspace_id, session_id, first_enabled_repo_id],
        )?;

        let workspace = tx.query_row(
            "SELECT * FROM workspaces WHERE id = ?1",
            params![workspace_id],
            row_to_workspace,
        )?;
        let session = tx.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![session_id],
            super::db_sessions::row_to_session,
        )?;

        tx.commit()?;

        self.events.publish(StoreEvent::WorkspaceCreated {
            workspace_id: workspace.id.clone(),
        });
        self.events.publish(StoreEvent::SessionAdded {
            workspace_id: workspace.id.clone(),
            session_id: session.id.clone(),
        });

        Ok((workspace, session))
    }

    fn get_workspace(&self, id: &str) -> Result<Workspace> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT * FROM workspaces WHERE id = ?1",
            params![id],
            row_to_workspace,
        )
        .map_err(|e| anyhow!("Failed to get workspace '{id}': {e}"))
    }

    fn update_workspace(&self, id: &str, patch: &WorkspaceUpdate) -> Result<Workspace> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();

        if let Some(name) = &patch.name {
            tx.execute(
                "UPDATE workspaces SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, name, now],
            )?;
        }
        if let Some(archived) = patch.archived {
            tx.execute(
                "UPDATE workspaces SET archived = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, archived, now],
            )?;
        }
        if let Some(pinned) = patch.pinned {
            tx.execute(
                "UPDATE workspaces SET pinned = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, pinned, now],
            )?;
        }
        if let Some(status) = patch.status {
            tx.execute(
                "UPDATE workspaces SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now],
            )?;
        }
        if let Some(active_session_id) = &patch.active_session_id {
            tx.execute(
                "UPDATE workspaces SET active_session_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active_session_id, now],
            )?;
        }
        if let Some(active_repo_id) = &patch.active_workspace_repo_id {
            tx.execute(
                "UPDATE workspaces SET active_workspace_repo_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active_repo_id, now],
            )?;
        }

        let workspace = tx.query_row(
            "SELECT * FROM workspaces WHERE id = ?1",
            params![id],
            row_to_workspace,
        )?;
        tx.commit()?;

        self.events.publish(StoreEvent::WorkspaceUpdated {
            workspace_id: id.to_string(),
        });
        Ok(workspace)
    }

    fn list_workspaces(&self, owner: &str, include_archived: bool) -> Result<Vec<Workspace>> {
        let conn = self.get_conn()?;
        let sql = if include_archived {
            "SELECT * FROM workspaces WHERE owner = ?1 ORDER BY updated_at DESC"
        } else {
            "SELECT * FROM workspaces WHERE owner = ?1 AND archived = FALSE ORDER BY updated_at DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![owner], row_to_workspace)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_workspace(&self, id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM workspaces WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(anyhow!("Workspace '{id}' not found"));
        }
        self.events.publish(StoreEvent::WorkspaceDeleted {
            workspace_id: id.to_string(),
        });
        Ok(())
    }

    fn set_workspace_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE workspaces SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_ms()],
        )?;
        Ok(())
    }

    fn list_workspace_repos(&self, workspace_id: &str) -> Result<Vec<WorkspaceRepo>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM workspace_repos WHERE workspace_id = ?1 ORDER BY sort_order",
        )?;
        let rows = stmt.query_map(params![workspace_id], row_to_workspace_repo)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn enabled_workspace_repos(&self, workspace_id: &str) -> Result<Vec<WorkspaceRepo>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM workspace_repos WHERE workspace_id = ?1 AND enabled = TRUE ORDER BY sort_order",
        )?;
        let rows = stmt.query_map(params![workspace_id], row_to_workspace_repo)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_workspace_repo(&self, id: &str) -> Result<WorkspaceRepo> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT * FROM workspace_repos WHERE id = ?1",
            params![id],
            row_to_workspace_repo,
        )
        .map_err(|e| anyhow!("Failed to get workspace repo '{id}': {e}"))
    }

    fn get_workspace_repo_by_name(
        &self,
        workspace_id: &str,
        repo_name: &str,
    ) -> Result<WorkspaceRepo> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT * FROM workspace_repos WHERE workspace_id = ?1 AND repo_name = ?2",
            params![workspace_id, repo_name],
            row_to_workspace_repo,
        )
        .map_err(|e| anyhow!("No repo '{repo_name}' in workspace '{workspace_id}': {e}"))
    }

    fn set_workspace_repo_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE workspace_repos SET enabled = ?2 WHERE id = ?1",
            params![id, enabled],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::entity::NewWorkspaceRepo;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, Database) {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        (tmp, db)
    }

    fn sample_workspace() -> NewWorkspace {
        NewWorkspace {
            owner: "alice".into(),
            org: None,
            project: None,
            name: "W1".into(),
            branch: "feat/x".into(),
            repos: vec![
                NewWorkspaceRepo {
                    repo_id: "r-app".into(),
                    repo_name: "app".into(),
                    target_branch: "main".into(),
                    enabled: true,
                },
                NewWorkspaceRepo {
                    repo_id: "r-docs".into(),
                    repo_name: "docs".into(),
                    target_branch: "main".into(),
                    enabled: false,
                },
            ],
            initial_session_title: Some("first".into()),
        }
    }

    #[test]
    fn create_workspace_assigns_pointers() {
        let (_tmp, db) = test_db();
        let (workspace, session) = db.create_workspace(&sample_workspace()).unwrap();

        assert_eq!(workspace.active_session_id.as_deref(), Some(session.id.as_str()));
        let repos = db.list_workspace_repos(&workspace.id).unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(
            workspace.active_workspace_repo_id.as_deref(),
            Some(repos[0].id.as_str())
        );
        assert_eq!(repos[0].repo_name, "app");
        assert_eq!(session.title.as_deref(), Some("first"));
    }

    #[test]
    fn create_workspace_rejects_empty_repo_list() {
        let (_tmp, db) = test_db();
        let mut new = sample_workspace();
        new.repos.clear();
        assert!(db.create_workspace(&new).is_err());
    }

    #[test]
    fn enabled_repos_filters_and_orders() {
        let (_tmp, db) = test_db();
        let (workspace, _) = db.create_workspace(&sample_workspace()).unwrap();
        let enabled = db.enabled_workspace_repos(&workspace.id).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].repo_name, "app");
    }

    #[test]
    fn archive_hides_from_default_listing() {
        let (_tmp, db) = test_db();
        let (workspace, _) = db.create_workspace(&sample_workspace()).unwrap();

        db.update_workspace(
            &workspace.id,
            &WorkspaceUpdate {
                archived: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(db.list_workspaces("alice", false).unwrap().is_empty());
        assert_eq!(db.list_workspaces("alice", true).unwrap().len(), 1);

        // Archiving is reversible.
        db.update_workspace(
            &workspace.id,
            &WorkspaceUpdate {
                archived: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(db.list_workspaces("alice", false).unwrap().len(), 1);
    }

    #[test]
    fn delete_cascades_to_repos_and_sessions() {
        let (_tmp, db) = test_db();
        let (workspace, session) = db.create_workspace(&sample_workspace()).unwrap();
        db.delete_workspace(&workspace.id).unwrap();

        assert!(db.get_workspace(&workspace.id).is_err());
        assert!(db.list_workspace_repos(&workspace.id).unwrap().is_empty());
        let conn = db.get_conn().unwrap();
        let sessions: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE id = ?1",
                params![session.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(sessions, 0);
    }

    #[test]
    fn repo_lookup_by_name() {
        let (_tmp, db) = test_db();
        let (workspace, _) = db.create_workspace(&sample_workspace()).unwrap();
        let repo = db.get_workspace_repo_by_name(&workspace.id, "docs").unwrap();
        assert_eq!(repo.repo_id, "r-docs");
        assert!(db.get_workspace_repo_by_name(&workspace.id, "nope").is_err());
    }
}
