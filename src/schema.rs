//! Schema & migration engine (C1).
//!
//! Creates tables, backfills columns guarded by `pragma_table_info` existence
//! checks (the idiom this codebase's own SQLite-backed stores already use),
//! rebuilds tables whose CHECK constraint uses an older state vocabulary, and
//! refuses to open a database whose schema is newer than this binary knows.

use crate::error::StoreError;
use crate::types::fnv64a;
use rusqlite::Connection;

/// Highest schema version this binary understands.
pub const CURRENT_SCHEMA_VERSION: i64 = 14;

/// Deterministic "compiled-in" checksum for a known schema version. Real
/// deployments would pin these to a hash of the exact DDL shipped in that
/// release; here they're derived from a stable per-version descriptor so the
/// ledger check (§4.1 step 4) and the known-predecessor check (§6) both have
/// something concrete to compare against.
pub fn checksum_for_version(version: i64) -> String {
    format!("{:016x}", fnv64a(format!("goclaw-schema-v{version}").as_bytes()))
}

const OP: &str = "schema::migrate";

pub fn ensure_schema(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .map_err(|e| crate::error::from_sqlite(OP, e))?;

    let max_version: Option<i64> = conn
        .query_row(
            "SELECT MAX(version) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| crate::error::from_sqlite(OP, e))?;

    if let Some(found) = max_version {
        if found > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                op: OP,
                found,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        if found == CURRENT_SCHEMA_VERSION {
            let stored_checksum: String = conn
                .query_row(
                    "SELECT checksum FROM schema_migrations WHERE version = ?1",
                    [found],
                    |row| row.get(0),
                )
                .map_err(|e| crate::error::from_sqlite(OP, e))?;
            if stored_checksum != checksum_for_version(found) {
                return Err(StoreError::SchemaChecksumMismatch {
                    op: OP,
                    version: found,
                });
            }
            return Ok(());
        }
    }

    let tx = conn.transaction().map_err(|e| crate::error::from_sqlite(OP, e))?;
    run_migration(&tx)?;
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, checksum, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![CURRENT_SCHEMA_VERSION, checksum_for_version(CURRENT_SCHEMA_VERSION), now],
    )
    .map_err(|e| crate::error::from_sqlite(OP, e))?;
    tx.commit().map_err(|e| crate::error::from_sqlite(OP, e))?;
    tracing::info!(version = CURRENT_SCHEMA_VERSION, "schema migrated to current version");
    Ok(())
}

fn run_migration(tx: &rusqlite::Transaction<'_>) -> Result<(), StoreError> {
    create_tables(tx)?;
    backfill_columns(tx)?;
    create_indexes(tx)?;
    rebuild_legacy_status_vocabulary(tx)?;
    Ok(())
}

fn create_tables(tx: &rusqlite::Transaction<'_>) -> Result<(), StoreError> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            soul_hash TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('system','user','assistant','tool')),
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            archived_at TEXT,
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            task_type TEXT NOT NULL CHECK (task_type IN ('chat','tool','subtask')),
            status TEXT NOT NULL CHECK (status IN
                ('QUEUED','CLAIMED','RUNNING','RETRY_WAIT','SUCCEEDED','FAILED','CANCELED','DEAD_LETTER')),
            priority INTEGER NOT NULL DEFAULT 0,
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            available_at TEXT NOT NULL,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            last_error_code TEXT,
            last_error_fingerprint TEXT,
            poison_count INTEGER NOT NULL DEFAULT 0,
            policy_version TEXT,
            lease_owner TEXT,
            lease_expires_at TEXT,
            payload TEXT NOT NULL DEFAULT '{}',
            result TEXT,
            error TEXT,
            parent_task_id TEXT,
            token_usage INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0.0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id),
            FOREIGN KEY (parent_task_id) REFERENCES tasks(id)
        );

        CREATE TABLE IF NOT EXISTS task_events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            run_id TEXT,
            trace_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            state_from TEXT,
            state_to TEXT NOT NULL,
            payload TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id)
        );

        CREATE TABLE IF NOT EXISTS tool_call_dedup (
            idempotency_key TEXT PRIMARY KEY,
            tool_name TEXT NOT NULL,
            request_hash TEXT NOT NULL,
            side_effect_status TEXT NOT NULL CHECK (side_effect_status IN ('PENDING','SUCCEEDED','FAILED')),
            result_hash TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            provider TEXT,
            model TEXT,
            worker_count INTEGER NOT NULL DEFAULT 1,
            timeout_secs INTEGER,
            queue_depth_cap INTEGER,
            skills_filter TEXT,
            policy_overrides TEXT,
            key_env_var TEXT,
            emoji TEXT,
            preferred_search TEXT,
            status TEXT NOT NULL CHECK (status IN ('active','stopped','draining')) DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agent_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_agent TEXT NOT NULL,
            to_agent TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            read_at TEXT
        );

        CREATE TABLE IF NOT EXISTS agent_memories (
            agent_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            source TEXT,
            relevance REAL NOT NULL DEFAULT 1.0,
            access_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_accessed_at TEXT,
            PRIMARY KEY (agent_id, key)
        );

        CREATE TABLE IF NOT EXISTS agent_pins (
            agent_id TEXT NOT NULL,
            source TEXT NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            shared INTEGER NOT NULL DEFAULT 0,
            last_read_at TEXT NOT NULL,
            file_mtime TEXT,
            PRIMARY KEY (agent_id, source)
        );

        CREATE TABLE IF NOT EXISTS agent_shares (
            source_agent TEXT NOT NULL,
            target_agent TEXT NOT NULL,
            share_type TEXT NOT NULL CHECK (share_type IN ('memory','pin','all')),
            item_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (source_agent, target_agent, share_type, item_key)
        );

        CREATE TABLE IF NOT EXISTS summaries (
            session_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            content TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (session_id, agent_id)
        );

        CREATE TABLE IF NOT EXISTS loop_checkpoints (
            agent_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            step INTEGER NOT NULL,
            token_usage INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            messages TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (agent_id, session_id)
        );

        CREATE TABLE IF NOT EXISTS delegations (
            id TEXT PRIMARY KEY,
            parent_task_id TEXT NOT NULL,
            child_task_id TEXT NOT NULL,
            parent_agent TEXT NOT NULL,
            child_agent TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('PENDING','SUCCEEDED','FAILED')),
            result TEXT,
            injected INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            cron_expr TEXT NOT NULL,
            session_id TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            next_run_at TEXT,
            last_run_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS plan_executions (
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS plan_execution_steps (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            wave INTEGER NOT NULL,
            step_name TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            FOREIGN KEY (execution_id) REFERENCES plan_executions(id)
        );

        CREATE TABLE IF NOT EXISTS skill_registry (
            skill_hash TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            provenance TEXT,
            state TEXT NOT NULL CHECK (state IN ('active','quarantined')) DEFAULT 'active',
            fault_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS policy_versions (
            version TEXT PRIMARY KEY,
            description TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            entity_type TEXT,
            entity_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS data_redactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            field_name TEXT NOT NULL,
            reason TEXT NOT NULL,
            policy_version TEXT,
            actor TEXT NOT NULL DEFAULT 'system',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            status TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            token_usage INTEGER NOT NULL,
            cost_usd REAL NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_context (
            task_root_id TEXT PRIMARY KEY,
            context_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| crate::error::from_sqlite(OP, e))?;
    Ok(())
}

/// Column-add backfills, each guarded by a `pragma_table_info` existence
/// check so reapplying the migration is a no-op rather than an error.
fn backfill_columns(tx: &rusqlite::Transaction<'_>) -> Result<(), StoreError> {
    add_column_if_missing(tx, "tasks", "cost_usd", "REAL NOT NULL DEFAULT 0.0")?;
    add_column_if_missing(tx, "agents", "preferred_search", "TEXT")?;
    add_column_if_missing(tx, "delegations", "injected", "INTEGER NOT NULL DEFAULT 0")?;
    Ok(())
}

fn add_column_if_missing(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    column: &str,
    ddl: &str,
) -> Result<(), StoreError> {
    let exists: bool = tx
        .query_row(
            &format!("SELECT COUNT(*) > 0 FROM pragma_table_info('{table}') WHERE name = ?1"),
            [column],
            |row| row.get(0),
        )
        .map_err(|e| crate::error::from_sqlite(OP, e))?;
    if !exists {
        tx.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"), [])
            .map_err(|e| crate::error::from_sqlite(OP, e))?;
    }
    Ok(())
}

fn create_indexes(tx: &rusqlite::Transaction<'_>) -> Result<(), StoreError> {
    tx.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_messages_session_agent ON messages(session_id, agent_id, id);
        CREATE INDEX IF NOT EXISTS idx_tasks_claimable ON tasks(status, available_at, priority DESC, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_tasks_lease_expiry ON tasks(status, lease_expires_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id);
        CREATE INDEX IF NOT EXISTS idx_task_events_session ON task_events(session_id, event_id);
        CREATE INDEX IF NOT EXISTS idx_agent_messages_to ON agent_messages(to_agent, read_at, created_at);
        CREATE INDEX IF NOT EXISTS idx_agent_memories_agent ON agent_memories(agent_id, relevance DESC, updated_at DESC);
        ",
    )
    .map_err(|e| crate::error::from_sqlite(OP, e))?;
    Ok(())
}

/// Detects a `tasks` table whose CHECK constraint still uses the pre-lattice
/// vocabulary (PENDING/COMPLETED) and rebuilds it through a CASE mapping,
/// repairing the `task_events` foreign key along the way (§4.1 step 5d).
fn rebuild_legacy_status_vocabulary(tx: &rusqlite::Transaction<'_>) -> Result<(), StoreError> {
    let legacy_sql: Option<String> = tx
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'tasks'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| crate::error::from_sqlite(OP, e))?;

    let needs_rebuild = legacy_sql
        .map(|sql| sql.contains("'PENDING'") || sql.contains("'COMPLETED'"))
        .unwrap_or(false);

    if !needs_rebuild {
        return Ok(());
    }

    tracing::warn!("rebuilding tasks table: legacy status vocabulary detected");
    tx.execute_batch(
        "
        ALTER TABLE tasks RENAME TO tasks_legacy;
        ",
    )
    .map_err(|e| crate::error::from_sqlite(OP, e))?;
    create_tables(tx)?;
    tx.execute_batch(
        "
        INSERT INTO tasks SELECT
            id, session_id, agent_id, task_type,
            CASE status
                WHEN 'PENDING' THEN 'QUEUED'
                WHEN 'COMPLETED' THEN 'SUCCEEDED'
                ELSE status
            END,
            priority, attempt, max_attempts, available_at, cancel_requested,
            last_error_code, last_error_fingerprint, poison_count, policy_version,
            lease_owner, lease_expires_at, payload, result, error, parent_task_id,
            token_usage, cost_usd, created_at, updated_at
        FROM tasks_legacy;

        DROP TABLE tasks_legacy;
        ",
    )
    .map_err(|e| crate::error::from_sqlite(OP, e))?;
    Ok(())
}
