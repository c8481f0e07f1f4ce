use super::connection::Database;

pub fn initialize_schema(db: &Database) -> anyhow::Result<()> {
    let conn = db.get_conn()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workspaces (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            org TEXT,
            project TEXT,
            name TEXT NOT NULL,
            branch TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'idle',
            archived BOOLEAN NOT NULL DEFAULT FALSE,
            pinned BOOLEAN NOT NULL DEFAULT FALSE,
            active_session_id TEXT,
            active_workspace_repo_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workspaces_owner ON workspaces(owner, archived, updated_at DESC)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workspace_repos (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            repo_id TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            target_branch TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            sort_order INTEGER NOT NULL DEFAULT 0,
            UNIQUE(workspace_id, repo_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workspace_repos_order
         ON workspace_repos(workspace_id, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workspace_repos_enabled
         ON workspace_repos(workspace_id, enabled, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            title TEXT,
            status TEXT NOT NULL DEFAULT 'idle',
            last_used_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_workspace
         ON sessions(workspace_id, last_used_at DESC)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS execution_processes (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            run_reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            executor TEXT,
            queued_follow_up_consumed BOOLEAN NOT NULL DEFAULT FALSE,
            cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            error_message TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_executions_session
         ON execution_processes(session_id, started_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_executions_session_status
         ON execution_processes(session_id, status, started_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS execution_process_repo_states (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL REFERENCES execution_processes(id) ON DELETE CASCADE,
            workspace_repo_id TEXT NOT NULL,
            before_head_commit TEXT,
            after_head_commit TEXT,
            repo_state TEXT,
            UNIQUE(execution_id, workspace_repo_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS queued_messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            message TEXT NOT NULL,
            executor TEXT,
            variant TEXT,
            enqueueing_execution_id TEXT,
            state TEXT NOT NULL DEFAULT 'queued',
            queued_at INTEGER NOT NULL,
            resolved_at INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_queued_messages_session
         ON queued_messages(session_id, state, queued_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS approvals (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            execution_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            prompt TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            requested_at INTEGER NOT NULL,
            expires_at INTEGER,
            responded_at INTEGER,
            responded_by TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_approvals_session
         ON approvals(session_id, status, requested_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_approvals_execution
         ON approvals(execution_id, status, requested_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS device_enrollments (
            device_id TEXT PRIMARY KEY,
            owning_principal TEXT NOT NULL,
            public_key TEXT NOT NULL,
            enrolled_at INTEGER NOT NULL,
            revoked_at INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS runner_leases (
            execution_id TEXT PRIMARY KEY REFERENCES execution_processes(id) ON DELETE CASCADE,
            device_id TEXT NOT NULL,
            pid INTEGER,
            acquired_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS execution_intents (
            id TEXT PRIMARY KEY,
            nonce TEXT NOT NULL,
            target_device_id TEXT NOT NULL,
            issued_at INTEGER NOT NULL,
            ttl_ms INTEGER NOT NULL,
            workspace_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            execution_id TEXT NOT NULL,
            run_reason TEXT NOT NULL,
            command_kind TEXT NOT NULL,
            params TEXT NOT NULL,
            principal TEXT NOT NULL,
            signature TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            acked_at INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_intents_device
         ON execution_intents(target_device_id, state, issued_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dispatch_audit (
            id TEXT PRIMARY KEY,
            intent_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            detail TEXT NOT NULL,
            rejected_at INTEGER NOT NULL
        )",
        [],
    )?;

    apply_migrations(&conn)?;

    Ok(())
}

/// Idempotent column additions for schema evolution; each silently fails if
/// the column already exists.
fn apply_migrations(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    let _ = conn.execute(
        "ALTER TABLE execution_processes ADD COLUMN cancel_requested BOOLEAN NOT NULL DEFAULT FALSE",
        [],
    );
    let _ = conn.execute("ALTER TABLE runner_leases ADD COLUMN pid INTEGER", []);
    let _ = conn.execute("ALTER TABLE workspaces ADD COLUMN pinned BOOLEAN NOT NULL DEFAULT FALSE", []);
    Ok(())
}
