//! Transition kernel (C2): the 8-state lattice and the single primitive used
//! by every task-queue operation to move a task between states.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::types::TaskStatus;
use rusqlite::types::Value as SqlValue;

const OP: &str = "transitions::transition";

/// Anything not listed here is illegal (§4.2).
fn is_legal(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Queued, Claimed)
            | (Queued, Canceled)
            | (Claimed, Running)
            | (Claimed, Canceled)
            | (Claimed, Queued)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, RetryWait)
            | (Running, Canceled)
            | (Running, Queued)
            | (RetryWait, Queued)
            | (RetryWait, Failed)
            | (RetryWait, Canceled)
            | (Failed, DeadLetter)
            | (Failed, RetryWait)
    )
}

/// An additional column to stamp in the same UPDATE as the status change,
/// e.g. lease fields on claim, error fields on fail-handler.
pub struct ExtraSet {
    pub column: &'static str,
    pub value: SqlValue,
}

impl ExtraSet {
    pub fn new(column: &'static str, value: impl Into<SqlValue>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

pub struct TransitionRequest<'a> {
    pub task_id: &'a str,
    pub allowed_from: &'a [TaskStatus],
    pub to: TaskStatus,
    pub event_type: &'a str,
    pub payload: Option<serde_json::Value>,
    pub extra: Vec<ExtraSet>,
}

/// Row shape returned by the pre-transition read, so callers can branch on
/// attempt/poison/fingerprint without a second round trip (used by the
/// fail-handler, §4.3 step 1).
pub struct CurrentTask {
    pub status: TaskStatus,
    pub session_id: String,
}

pub fn read_current(conn: &rusqlite::Connection, task_id: &str) -> Result<CurrentTask, StoreError> {
    let row = conn
        .query_row(
            "SELECT status, session_id FROM tasks WHERE id = ?1",
            [task_id],
            |row| {
                let status: String = row.get(0)?;
                let session_id: String = row.get(1)?;
                Ok((status, session_id))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found(OP),
            other => crate::error::from_sqlite(OP, other),
        })?;
    let status = TaskStatus::parse(&row.0).ok_or_else(|| {
        StoreError::internal(OP, anyhow::anyhow!("corrupt status value: {}", row.0))
    })?;
    Ok(CurrentTask {
        status,
        session_id: row.1,
    })
}

/// The single primitive every task-queue operation funnels through.
///
/// Returns `Ok(false)` without error when the task's current status is not
/// in `allowed_from` (a concurrent caller already moved it — the caller lost
/// the race). Returns a hard `IllegalTransition` error if `to` is not a legal
/// successor of the current status under the lattice (a caller bug, not a
/// race). On success, performs the conditional UPDATE and appends exactly
/// one `TaskEvent` row in the same transaction.
///
/// Takes a plain `&Connection` (rather than `&Transaction`) since
/// `Transaction` derefs to `Connection` and callers may invoke this either
/// inside an open transaction or directly under the connection lock.
pub fn transition(
    conn: &rusqlite::Connection,
    ctx: &OpContext,
    req: TransitionRequest<'_>,
) -> Result<bool, StoreError> {
    let current = read_current(conn, req.task_id)?;

    if !req.allowed_from.contains(&current.status) {
        return Ok(false);
    }

    if !is_legal(current.status, req.to) {
        return Err(StoreError::IllegalTransition {
            op: OP,
            from: current.status.to_string(),
            to: req.to.to_string(),
        });
    }

    let now = chrono::Utc::now().to_rfc3339();
    let mut set_sql = String::from("status = ?1, updated_at = ?2");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(req.to.as_str().to_string()),
        Box::new(now.clone()),
    ];
    for (i, extra) in req.extra.iter().enumerate() {
        set_sql.push_str(&format!(", {} = ?{}", extra.column, params.len() + 1));
        params.push(Box::new(extra.value.clone()));
        let _ = i;
    }
    let where_idx_status = params.len() + 1;
    let where_idx_id = params.len() + 2;
    params.push(Box::new(current.status.as_str().to_string()));
    params.push(Box::new(req.task_id.to_string()));

    let sql = format!(
        "UPDATE tasks SET {set_sql} WHERE status = ?{where_idx_status} AND id = ?{where_idx_id}"
    );
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = conn
        .execute(&sql, param_refs.as_slice())
        .map_err(|e| crate::error::from_sqlite(OP, e))?;
    if rows == 0 {
        return Ok(false);
    }

    let trace_id = ctx.trace_id_or(&current.session_id);
    conn.execute(
        "INSERT INTO task_events
            (task_id, session_id, run_id, trace_id, event_type, state_from, state_to, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            req.task_id,
            current.session_id,
            ctx.run_id,
            trace_id,
            req.event_type,
            current.status.as_str(),
            req.to.as_str(),
            req.payload.map(|v| v.to_string()),
            now,
        ],
    )
    .map_err(|e| crate::error::from_sqlite(OP, e))?;

    Ok(true)
}

/// Appends the initial `task.enqueued` event for a freshly-inserted task,
/// where `state_from` is null (the one case the lattice doesn't model).
/// Takes a plain `&Connection` (rather than `&Transaction`) since
/// `Transaction` derefs to `Connection` and callers may invoke this either
/// inside an open transaction or directly under the connection lock.
pub fn append_initial_event(
    conn: &rusqlite::Connection,
    ctx: &OpContext,
    task_id: &str,
    session_id: &str,
) -> Result<(), StoreError> {
    let now = chrono::Utc::now().to_rfc3339();
    let trace_id = ctx.trace_id_or(session_id);
    conn.execute(
        "INSERT INTO task_events
            (task_id, session_id, run_id, trace_id, event_type, state_from, state_to, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, 'task.enqueued', NULL, 'QUEUED', NULL, ?5)",
        rusqlite::params![task_id, session_id, ctx.run_id, trace_id, now],
    )
    .map_err(|e| crate::error::from_sqlite(OP, e))?;
    Ok(())
}
