//! The Store: owns the single database connection and wires every
//! component together. This is process-scoped mutable state — construct it
//! once at daemon start and hand out `Arc<Store>` to collaborators; never
//! stash it behind a module-level global (§9).

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::publisher::EventPublisher;
use crate::schema;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Store {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) config: StoreConfig,
    pub(crate) publisher: Option<Arc<dyn EventPublisher>>,
}

impl Store {
    /// Opens (or creates) the store at its configured default path.
    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open_with_config(StoreConfig::default()).await
    }

    /// Opens (or creates) the store at an explicit path, otherwise default config.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let config = StoreConfig {
            db_path: path.as_ref().to_path_buf(),
            ..StoreConfig::default()
        };
        Self::open_with_config(config).await
    }

    pub async fn open_with_config(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::internal("store::open", e))?;
            set_owner_only_permissions(parent);
        }
        let conn = Connection::open(&config.db_path)
            .map_err(|e| crate::error::from_sqlite("store::open", e))?;
        let store = Self::finish_open(conn, config)?;
        tracing::info!(
            path = %store.config.db_path.display(),
            version = schema::CURRENT_SCHEMA_VERSION,
            "store opened"
        );
        Ok(store)
    }

    /// An in-memory store; useful for tests. WAL/synchronous pragmas that
    /// only make sense for on-disk files are skipped.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| crate::error::from_sqlite("store::open_in_memory", e))?;
        Self::finish_open(conn, StoreConfig::default())
    }

    fn finish_open(mut conn: Connection, config: StoreConfig) -> Result<Self, StoreError> {
        apply_pragmas(&conn)?;
        schema::ensure_schema(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
            publisher: None,
        })
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn publish(&self, topic: &str, payload: serde_json::Value) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(topic, payload);
        }
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| crate::error::from_sqlite("store::open", e))?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(|e| crate::error::from_sqlite("store::open", e))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| crate::error::from_sqlite("store::open", e))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| crate::error::from_sqlite("store::open", e))?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(dir) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o700);
        let _ = std::fs::set_permissions(dir, perms);
    }
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_dir: &Path) {}
