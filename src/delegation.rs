//! Delegation ledger: tracks a parent task handing work to a child task run
//! by a different agent, and whether the child's result has been injected
//! back into the parent's conversation yet.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegationStatus {
    Pending,
    Succeeded,
    Failed,
}

impl DelegationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DelegationStatus::Pending => "PENDING",
            DelegationStatus::Succeeded => "SUCCEEDED",
            DelegationStatus::Failed => "FAILED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => DelegationStatus::Pending,
            "SUCCEEDED" => DelegationStatus::Succeeded,
            "FAILED" => DelegationStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: String,
    pub parent_task_id: String,
    pub child_task_id: String,
    pub parent_agent: String,
    pub child_agent: String,
    pub status: DelegationStatus,
    pub result: Option<serde_json::Value>,
    pub injected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_delegation(row: &Row<'_>) -> rusqlite::Result<Delegation> {
    let status_str: String = row.get(5)?;
    let result: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(Delegation {
        id: row.get(0)?,
        parent_task_id: row.get(1)?,
        child_task_id: row.get(2)?,
        parent_agent: row.get(3)?,
        child_agent: row.get(4)?,
        status: DelegationStatus::parse(&status_str).unwrap_or(DelegationStatus::Pending),
        result: result.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        injected: row.get::<_, i64>(7)? != 0,
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
    })
}

const COLUMNS: &str = "id, parent_task_id, child_task_id, parent_agent, child_agent, status, \
    result, injected, created_at, updated_at";

const OP_CREATE: &str = "delegation::create";
const OP_RESOLVE: &str = "delegation::resolve";
const OP_MARK_INJECTED: &str = "delegation::mark_injected";
const OP_PENDING: &str = "delegation::pending_uninjected";

impl Store {
    pub async fn create_delegation(
        &self,
        _ctx: &OpContext,
        parent_task_id: &str,
        child_task_id: &str,
        parent_agent: &str,
        child_agent: &str,
    ) -> Result<Delegation, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO delegations
                (id, parent_task_id, child_task_id, parent_agent, child_agent, status, injected, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', 0, ?6, ?6)",
            params![id, parent_task_id, child_task_id, parent_agent, child_agent, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_CREATE, e))?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM delegations WHERE id = ?1"),
            [&id],
            row_to_delegation,
        )
        .map_err(|e| crate::error::from_sqlite(OP_CREATE, e))
    }

    /// Records the child task's outcome against the delegation row once it
    /// reaches a terminal status.
    pub async fn resolve_delegation(
        &self,
        _ctx: &OpContext,
        child_task_id: &str,
        status: DelegationStatus,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE delegations SET status = ?1, result = ?2, updated_at = ?3 WHERE child_task_id = ?4",
                params![status.as_str(), result.map(|v| v.to_string()), now, child_task_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_RESOLVE, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_RESOLVE));
        }
        Ok(())
    }

    pub async fn mark_delegation_injected(
        &self,
        _ctx: &OpContext,
        delegation_id: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE delegations SET injected = 1, updated_at = ?1 WHERE id = ?2",
                params![now, delegation_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_MARK_INJECTED, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_MARK_INJECTED));
        }
        Ok(())
    }

    /// Delegations that resolved but whose result has not yet been injected
    /// back into the parent's conversation — what the orchestrator polls.
    pub async fn pending_uninjected_delegations(
        &self,
        _ctx: &OpContext,
        parent_agent: &str,
    ) -> Result<Vec<Delegation>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM delegations
                 WHERE parent_agent = ?1 AND injected = 0 AND status != 'PENDING'
                 ORDER BY updated_at ASC"
            ))
            .map_err(|e| crate::error::from_sqlite(OP_PENDING, e))?;
        let rows = stmt
            .query_map([parent_agent], row_to_delegation)
            .map_err(|e| crate::error::from_sqlite(OP_PENDING, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_PENDING, e))
    }

    pub async fn get_delegation_by_child(
        &self,
        _ctx: &OpContext,
        child_task_id: &str,
    ) -> Result<Option<Delegation>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM delegations WHERE child_task_id = ?1"),
            [child_task_id],
            row_to_delegation,
        )
        .optional()
        .map_err(|e| crate::error::from_sqlite(OP_PENDING, e))
    }
}
