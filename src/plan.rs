//! Plan execution tracking: a plan is a DAG of named steps grouped into
//! waves; this module persists one row per execution attempt and one row
//! per step so a crashed orchestrator can resume mid-plan.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::publisher::topics;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: String,
    pub plan_id: String,
    pub session_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecutionStep {
    pub id: String,
    pub execution_id: String,
    pub wave: i64,
    pub step_name: String,
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<PlanExecution> {
    let created_at: String = row.get(4)?;
    let completed_at: Option<String> = row.get(5)?;
    Ok(PlanExecution {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        session_id: row.get(2)?,
        status: row.get(3)?,
        created_at: parse_dt(&created_at),
        completed_at: completed_at.as_deref().map(parse_dt),
    })
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<PlanExecutionStep> {
    let result: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    Ok(PlanExecutionStep {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        wave: row.get(2)?,
        step_name: row.get(3)?,
        status: row.get(4)?,
        result: result.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        created_at: parse_dt(&created_at),
        completed_at: completed_at.as_deref().map(parse_dt),
    })
}

const EXEC_COLUMNS: &str = "id, plan_id, session_id, status, created_at, completed_at";
const STEP_COLUMNS: &str =
    "id, execution_id, wave, step_name, status, result, created_at, completed_at";

const OP_START: &str = "plan::start_execution";
const OP_ADD_STEP: &str = "plan::add_step";
const OP_COMPLETE_STEP: &str = "plan::complete_step";
const OP_FINISH: &str = "plan::finish_execution";
const OP_LIST_STEPS: &str = "plan::list_steps";
const OP_GET: &str = "plan::get_execution";

impl Store {
    pub async fn start_plan_execution(
        &self,
        _ctx: &OpContext,
        plan_id: &str,
        session_id: &str,
    ) -> Result<PlanExecution, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO plan_executions (id, plan_id, session_id, status, created_at)
             VALUES (?1, ?2, ?3, 'RUNNING', ?4)",
            params![id, plan_id, session_id, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_START, e))?;
        let execution = conn
            .query_row(
                &format!("SELECT {EXEC_COLUMNS} FROM plan_executions WHERE id = ?1"),
                [&id],
                row_to_execution,
            )
            .map_err(|e| crate::error::from_sqlite(OP_START, e))?;
        drop(conn);
        self.publish(
            topics::PLAN_EXECUTION_STARTED,
            serde_json::json!({ "execution_id": execution.id, "plan_id": plan_id }),
        );
        Ok(execution)
    }

    pub async fn add_plan_step(
        &self,
        _ctx: &OpContext,
        execution_id: &str,
        wave: i64,
        step_name: &str,
    ) -> Result<PlanExecutionStep, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO plan_execution_steps (id, execution_id, wave, step_name, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5)",
            params![id, execution_id, wave, step_name, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_ADD_STEP, e))?;
        conn.query_row(
            &format!("SELECT {STEP_COLUMNS} FROM plan_execution_steps WHERE id = ?1"),
            [&id],
            row_to_step,
        )
        .map_err(|e| crate::error::from_sqlite(OP_ADD_STEP, e))
    }

    pub async fn complete_plan_step(
        &self,
        _ctx: &OpContext,
        step_id: &str,
        status: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE plan_execution_steps SET status = ?1, result = ?2, completed_at = ?3 WHERE id = ?4",
                params![status, result.map(|v| v.to_string()), now, step_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_COMPLETE_STEP, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_COMPLETE_STEP));
        }
        drop(conn);
        let step_id = step_id.to_string();
        self.publish(
            topics::PLAN_STEP_COMPLETED,
            serde_json::json!({ "step_id": step_id, "status": status }),
        );
        Ok(())
    }

    pub async fn list_plan_steps(
        &self,
        _ctx: &OpContext,
        execution_id: &str,
    ) -> Result<Vec<PlanExecutionStep>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM plan_execution_steps WHERE execution_id = ?1 ORDER BY wave ASC, created_at ASC"
            ))
            .map_err(|e| crate::error::from_sqlite(OP_LIST_STEPS, e))?;
        let rows = stmt
            .query_map([execution_id], row_to_step)
            .map_err(|e| crate::error::from_sqlite(OP_LIST_STEPS, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_LIST_STEPS, e))
    }

    pub async fn finish_plan_execution(
        &self,
        _ctx: &OpContext,
        execution_id: &str,
        status: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE plan_executions SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status, now, execution_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_FINISH, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_FINISH));
        }
        drop(conn);
        let execution_id = execution_id.to_string();
        self.publish(
            topics::PLAN_EXECUTION_COMPLETED,
            serde_json::json!({ "execution_id": execution_id, "status": status }),
        );
        Ok(())
    }

    pub async fn get_plan_execution(
        &self,
        _ctx: &OpContext,
        execution_id: &str,
    ) -> Result<Option<PlanExecution>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {EXEC_COLUMNS} FROM plan_executions WHERE id = ?1"),
            [execution_id],
            row_to_execution,
        )
        .optional()
        .map_err(|e| crate::error::from_sqlite(OP_GET, e))
    }
}
