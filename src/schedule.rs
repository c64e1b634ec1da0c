//! Cron-style task schedules: recurring session triggers the orchestrator
//! polls for due firings.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub cron_expr: String,
    pub session_id: String,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let next_run_at: Option<String> = row.get(4)?;
    let last_run_at: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(Schedule {
        id: row.get(0)?,
        cron_expr: row.get(1)?,
        session_id: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        next_run_at: next_run_at.as_deref().map(parse_dt),
        last_run_at: last_run_at.as_deref().map(parse_dt),
        created_at: parse_dt(&created_at),
    })
}

const COLUMNS: &str = "id, cron_expr, session_id, enabled, next_run_at, last_run_at, created_at";

const OP_CREATE: &str = "schedule::create";
const OP_DUE: &str = "schedule::due";
const OP_MARK_FIRED: &str = "schedule::mark_fired";
const OP_SET_ENABLED: &str = "schedule::set_enabled";
const OP_DELETE: &str = "schedule::delete";

impl Store {
    pub async fn create_schedule(
        &self,
        _ctx: &OpContext,
        cron_expr: &str,
        session_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Schedule, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO schedules (id, cron_expr, session_id, enabled, next_run_at, created_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            params![id, cron_expr, session_id, next_run_at.to_rfc3339(), now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_CREATE, e))?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM schedules WHERE id = ?1"),
            [&id],
            row_to_schedule,
        )
        .map_err(|e| crate::error::from_sqlite(OP_CREATE, e))
    }

    /// Enabled schedules whose `next_run_at` has passed, oldest-due first.
    pub async fn due_schedules(&self, _ctx: &OpContext) -> Result<Vec<Schedule>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM schedules
                 WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at ASC"
            ))
            .map_err(|e| crate::error::from_sqlite(OP_DUE, e))?;
        let rows = stmt
            .query_map([now], row_to_schedule)
            .map_err(|e| crate::error::from_sqlite(OP_DUE, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_DUE, e))
    }

    /// Records a firing and advances `next_run_at`. Computing the next cron
    /// occurrence is the caller's job (this store has no cron-expression
    /// parser); it passes in the value to stamp.
    pub async fn mark_schedule_fired(
        &self,
        _ctx: &OpContext,
        schedule_id: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE schedules SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3",
                params![now, next_run_at.map(|dt| dt.to_rfc3339()), schedule_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_MARK_FIRED, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_MARK_FIRED));
        }
        Ok(())
    }

    pub async fn set_schedule_enabled(
        &self,
        _ctx: &OpContext,
        schedule_id: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE schedules SET enabled = ?1 WHERE id = ?2",
                params![enabled as i64, schedule_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_SET_ENABLED, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_SET_ENABLED));
        }
        Ok(())
    }

    pub async fn delete_schedule(&self, _ctx: &OpContext, schedule_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute("DELETE FROM schedules WHERE id = ?1", [schedule_id])
            .map_err(|e| crate::error::from_sqlite(OP_DELETE, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_DELETE));
        }
        Ok(())
    }

    pub async fn get_schedule(
        &self,
        _ctx: &OpContext,
        schedule_id: &str,
    ) -> Result<Option<Schedule>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM schedules WHERE id = ?1"),
            [schedule_id],
            row_to_schedule,
        )
        .optional()
        .map_err(|e| crate::error::from_sqlite(OP_DUE, e))
    }
}
