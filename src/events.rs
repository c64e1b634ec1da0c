//! Event log (C4): the append-only `task_events` history written by the
//! transition kernel, read back here for replay and tailing.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event_id: i64,
    pub task_id: String,
    pub session_id: String,
    pub run_id: Option<String>,
    pub trace_id: String,
    pub event_type: String,
    pub state_from: Option<String>,
    pub state_to: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<TaskEvent> {
    let payload: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(TaskEvent {
        event_id: row.get(0)?,
        task_id: row.get(1)?,
        session_id: row.get(2)?,
        run_id: row.get(3)?,
        trace_id: row.get(4)?,
        event_type: row.get(5)?,
        state_from: row.get(6)?,
        state_to: row.get(7)?,
        payload: payload.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

const EVENT_COLUMNS: &str = "event_id, task_id, session_id, run_id, trace_id, event_type, \
    state_from, state_to, payload, created_at";

const OP_FROM: &str = "events::events_from";
const OP_BOUNDS: &str = "events::event_id_bounds";

impl Store {
    /// Returns up to `limit` events for `session_id` with `event_id >
    /// after_event_id`, ordered ascending — the replay/tailing primitive
    /// (§4.4). `limit` is clamped to the configured max list limit.
    pub async fn events_from(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        after_event_id: i64,
        limit: i64,
    ) -> Result<Vec<TaskEvent>, StoreError> {
        let limit = self.config.clamp_events_limit(limit);
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM task_events \
                 WHERE session_id = ?1 AND event_id > ?2 ORDER BY event_id ASC LIMIT ?3"
            ))
            .map_err(|e| crate::error::from_sqlite(OP_FROM, e))?;
        let rows = stmt
            .query_map(params![session_id, after_event_id, limit], row_to_event)
            .map_err(|e| crate::error::from_sqlite(OP_FROM, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_FROM, e))
    }

    /// Returns `(min_event_id, max_event_id)` for a session, or `None` when
    /// the session has no events yet.
    pub async fn event_id_bounds(
        &self,
        _ctx: &OpContext,
        session_id: &str,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT MIN(event_id), MAX(event_id) FROM task_events WHERE session_id = ?1",
            [session_id],
            |row| {
                let min: Option<i64> = row.get(0)?;
                let max: Option<i64> = row.get(1)?;
                Ok(min.zip(max))
            },
        )
        .map_err(|e| crate::error::from_sqlite(OP_BOUNDS, e))
    }
}
