//! Operational maintenance (C8): retention sweeps, PII purge, backup, and
//! the task-metrics snapshot the task queue calls on every terminal
//! transition.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::publisher::topics;
use crate::store::Store;
use crate::tasks::Task;
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    pub task_events_deleted: u64,
    pub audit_log_deleted: u64,
    pub messages_deleted: u64,
    pub mailbox_deleted: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PiiPurgeReport {
    pub messages_deleted: u64,
    pub tasks_tombstoned: u64,
    pub events_tombstoned: u64,
    pub redactions_recorded: u64,
}

const OP_RETENTION: &str = "ops::run_retention";
const OP_PURGE: &str = "ops::purge_session_pii";
const OP_BACKUP: &str = "ops::backup";
const OP_METRICS: &str = "ops::record_task_metrics";

impl Store {
    /// Deletes rows older than each configured window. A window of zero
    /// days is treated as "retention disabled" for that table, not "delete
    /// everything" (§4.8).
    pub async fn run_retention(
        &self,
        _ctx: &OpContext,
        task_event_days: i64,
        audit_log_days: i64,
        message_days: i64,
    ) -> Result<RetentionReport, StoreError> {
        let conn = self.conn.lock().await;
        let mut report = RetentionReport::default();

        if task_event_days > 0 {
            let cutoff = (Utc::now() - chrono::Duration::days(task_event_days)).to_rfc3339();
            report.task_events_deleted = conn
                .execute("DELETE FROM task_events WHERE created_at < ?1", [cutoff])
                .map_err(|e| crate::error::from_sqlite(OP_RETENTION, e))? as u64;
        }

        if audit_log_days > 0 {
            let cutoff = (Utc::now() - chrono::Duration::days(audit_log_days)).to_rfc3339();
            report.audit_log_deleted = conn
                .execute("DELETE FROM audit_log WHERE created_at < ?1", [cutoff])
                .map_err(|e| crate::error::from_sqlite(OP_RETENTION, e))? as u64;
        }

        if message_days > 0 {
            let cutoff = (Utc::now() - chrono::Duration::days(message_days)).to_rfc3339();
            report.messages_deleted = conn
                .execute("DELETE FROM messages WHERE created_at < ?1", [&cutoff])
                .map_err(|e| crate::error::from_sqlite(OP_RETENTION, e))? as u64;
            report.mailbox_deleted = conn
                .execute(
                    "DELETE FROM agent_messages WHERE read_at IS NOT NULL AND created_at < ?1",
                    [&cutoff],
                )
                .map_err(|e| crate::error::from_sqlite(OP_RETENTION, e))? as u64;
        }

        tracing::info!(
            task_events = report.task_events_deleted,
            audit_log = report.audit_log_deleted,
            messages = report.messages_deleted,
            mailbox = report.mailbox_deleted,
            "retention sweep complete"
        );
        Ok(report)
    }

    /// Deletes a session's messages, tombstones its task payloads/results
    /// and task-event payloads to `[REDACTED]`, and records one
    /// `data_redactions` row per field affected (§4.8).
    pub async fn purge_session_pii(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        policy_version: Option<&str>,
        actor: &str,
    ) -> Result<PiiPurgeReport, StoreError> {
        const TOMBSTONE: &str = "[REDACTED]";
        const REASON: &str = "pii_purge";
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
        let mut report = PiiPurgeReport::default();

        report.messages_deleted = tx
            .execute("DELETE FROM messages WHERE session_id = ?1", [session_id])
            .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))? as u64;
        if report.messages_deleted > 0 {
            tx.execute(
                "INSERT INTO data_redactions (entity_type, entity_id, field_name, reason, policy_version, actor, created_at)
                 VALUES ('session', ?1, 'content', ?2, ?3, ?4, ?5)",
                params![session_id, REASON, policy_version, actor, now],
            )
            .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            report.redactions_recorded += 1;
        }

        let task_ids: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT id FROM tasks WHERE session_id = ?1 AND (payload != '{}' OR result IS NOT NULL)")
                .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            let rows = stmt
                .query_map([session_id], |row| row.get(0))
                .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?
        };
        for task_id in &task_ids {
            tx.execute(
                "UPDATE tasks SET payload = ?1, result = ?1 WHERE id = ?2",
                params![format!("\"{TOMBSTONE}\""), task_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            tx.execute(
                "INSERT INTO data_redactions (entity_type, entity_id, field_name, reason, policy_version, actor, created_at)
                 VALUES ('task', ?1, 'payload', ?2, ?3, ?4, ?5)",
                params![task_id, REASON, policy_version, actor, now],
            )
            .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            report.tasks_tombstoned += 1;
            report.redactions_recorded += 1;
        }

        let event_ids: Vec<i64> = {
            let mut stmt = tx
                .prepare("SELECT event_id FROM task_events WHERE session_id = ?1 AND payload IS NOT NULL")
                .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            let rows = stmt
                .query_map([session_id], |row| row.get(0))
                .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?
        };
        for event_id in &event_ids {
            tx.execute(
                "UPDATE task_events SET payload = ?1 WHERE event_id = ?2",
                params![format!("\"{TOMBSTONE}\""), event_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            tx.execute(
                "INSERT INTO data_redactions (entity_type, entity_id, field_name, reason, policy_version, actor, created_at)
                 VALUES ('task_event', ?1, 'payload', ?2, ?3, ?4, ?5)",
                params![event_id.to_string(), REASON, policy_version, actor, now],
            )
            .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
            report.events_tombstoned += 1;
            report.redactions_recorded += 1;
        }

        tx.execute(
            "INSERT INTO audit_log (actor, action, entity_type, entity_id, created_at)
             VALUES (?1, 'purge_session_pii', 'session', ?2, ?3)",
            params![actor, session_id, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;

        tx.commit().map_err(|e| crate::error::from_sqlite(OP_PURGE, e))?;
        Ok(report)
    }

    /// Snapshots the database file via `VACUUM INTO`; refuses to overwrite
    /// an existing destination.
    pub async fn backup(&self, _ctx: &OpContext, destination: impl AsRef<Path>) -> Result<(), StoreError> {
        let destination = destination.as_ref();
        if destination.exists() {
            return Err(StoreError::conflict(
                OP_BACKUP,
                format!("destination already exists: {}", destination.display()),
            ));
        }
        let dest_str = destination
            .to_str()
            .ok_or_else(|| StoreError::conflict(OP_BACKUP, "destination path is not valid UTF-8"))?;
        let conn = self.conn.lock().await;
        conn.execute("VACUUM INTO ?1", [dest_str])
            .map_err(|e| crate::error::from_sqlite(OP_BACKUP, e))?;
        tracing::info!(destination = dest_str, "database backup written");
        Ok(())
    }

    /// Appends one `task_metrics` row on every terminal-ish transition,
    /// called by the task queue rather than by external callers.
    pub(crate) async fn record_task_metrics(&self, task: &Task) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_metrics (task_id, status, attempt, token_usage, cost_usd, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.id,
                task.status.as_str(),
                task.attempt,
                task.token_usage,
                task.cost_usd,
                now,
            ],
        )
        .map_err(|e| crate::error::from_sqlite(OP_METRICS, e))?;
        drop(conn);
        self.publish(
            topics::TASK_METRICS,
            serde_json::json!({
                "task_id": task.id,
                "status": task.status.as_str(),
                "attempt": task.attempt,
                "token_usage": task.token_usage,
                "cost_usd": task.cost_usd,
            }),
        );
        Ok(())
    }
}
