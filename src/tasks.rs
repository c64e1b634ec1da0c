//! Task queue (C3): create / claim / heartbeat / expire / retry / fail /
//! dead-letter / cancel / recover-on-startup / priority-age.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::publisher::topics;
use crate::retry::with_busy_retry;
use crate::store::Store;
use crate::transitions::{self, ExtraSet, TransitionRequest};
use crate::types::{error_fingerprint, fnv64a, ReasonCode, TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i64,
    pub attempt: i64,
    pub max_attempts: i64,
    pub available_at: DateTime<Utc>,
    pub cancel_requested: bool,
    pub last_error_code: Option<String>,
    pub last_error_fingerprint: Option<String>,
    pub poison_count: i64,
    pub policy_version: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub parent_task_id: Option<String>,
    pub token_usage: i64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const TASK_COLUMNS: &str = "id, session_id, agent_id, task_type, status, priority, attempt, \
    max_attempts, available_at, cancel_requested, last_error_code, last_error_fingerprint, \
    poison_count, policy_version, lease_owner, lease_expires_at, payload, result, error, \
    parent_task_id, token_usage, cost_usd, created_at, updated_at";

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(4)?;
    let task_type_str: String = row.get(3)?;
    let available_at: String = row.get(8)?;
    let lease_expires_at: Option<String> = row.get(15)?;
    let payload: String = row.get(16)?;
    let result: Option<String> = row.get(17)?;
    let created_at: String = row.get(22)?;
    let updated_at: String = row.get(23)?;
    Ok(Task {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        task_type: TaskType::parse(&task_type_str).unwrap_or(TaskType::Chat),
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Queued),
        priority: row.get(5)?,
        attempt: row.get(6)?,
        max_attempts: row.get(7)?,
        available_at: parse_rfc3339(&available_at),
        cancel_requested: row.get::<_, i64>(9)? != 0,
        last_error_code: row.get(10)?,
        last_error_fingerprint: row.get(11)?,
        poison_count: row.get(12)?,
        policy_version: row.get(13)?,
        lease_owner: row.get(14)?,
        lease_expires_at: lease_expires_at.as_deref().map(parse_rfc3339),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        result: result
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        error: row.get(18)?,
        parent_task_id: row.get(19)?,
        token_usage: row.get(20)?,
        cost_usd: row.get(21)?,
        created_at: parse_rfc3339(&created_at),
        updated_at: parse_rfc3339(&updated_at),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retry,
    DeadLetter,
}

#[derive(Debug, Clone)]
pub struct FailDecision {
    pub outcome: FailOutcome,
    pub attempt: i64,
    pub max_attempts: i64,
    pub reason: ReasonCode,
    pub fingerprint: String,
    pub poison_count: i64,
    pub available_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    pub stale_count: u64,
    pub oldest_stale_age_secs: i64,
    pub scan_duration_ms: i64,
}

const OP_CREATE: &str = "tasks::create";
const OP_CLAIM: &str = "tasks::claim";
const OP_START_RUN: &str = "tasks::start_run";
const OP_HEARTBEAT: &str = "tasks::heartbeat";
const OP_TOKENS: &str = "tasks::update_token_usage";
const OP_EXPIRE: &str = "tasks::expire_leases";
const OP_AGE: &str = "tasks::age_priorities";
const OP_CANCEL: &str = "tasks::request_cancel";
const OP_ABORT: &str = "tasks::abort_task";
const OP_COMPLETE: &str = "tasks::complete";
const OP_FAIL: &str = "tasks::fail";
const OP_RECOVER: &str = "tasks::recover_on_startup";
const OP_GET: &str = "tasks::get";

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        ctx: &OpContext,
        session_id: &str,
        agent_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: i64,
        max_attempts: i64,
        parent_task_id: Option<&str>,
    ) -> Result<Task, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| crate::error::from_sqlite(OP_CREATE, e))?;
        tx.execute(
            "INSERT INTO tasks
                (id, session_id, agent_id, task_type, status, priority, attempt, max_attempts,
                 available_at, cancel_requested, poison_count, payload, parent_task_id,
                 token_usage, cost_usd, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'QUEUED', ?5, 0, ?6, ?7, 0, 0, ?8, ?9, 0, 0.0, ?10, ?10)",
            params![
                id,
                session_id,
                agent_id,
                task_type.as_str(),
                priority,
                max_attempts,
                now_str,
                payload.to_string(),
                parent_task_id,
                now_str,
            ],
        )
        .map_err(|e| crate::error::from_sqlite(OP_CREATE, e))?;
        transitions::append_initial_event(&tx, ctx, &id, session_id)?;
        tx.commit().map_err(|e| crate::error::from_sqlite(OP_CREATE, e))?;
        drop(conn);
        self.get_task(ctx, &id)
            .await?
            .ok_or_else(|| StoreError::not_found(OP_CREATE))
    }

    pub async fn get_task(&self, _ctx: &OpContext, task_id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [task_id],
            row_to_task,
        )
        .optional()
        .map_err(|e| crate::error::from_sqlite(OP_GET, e))
    }

    /// Claims the highest-priority claimable QUEUED task, optionally scoped
    /// to one agent. Returns `None` when nothing is claimable.
    pub async fn claim_task(
        &self,
        ctx: &OpContext,
        agent_id: Option<&str>,
    ) -> Result<Option<Task>, StoreError> {
        let attempts = self.config.busy_retry_attempts;
        let lease_secs = self.config.lease_duration_secs;
        with_busy_retry(OP_CLAIM, ctx, attempts, move || async move {
            let mut conn = self.conn.lock().await;
            let tx = conn
                .transaction()
                .map_err(|e| crate::error::from_sqlite(OP_CLAIM, e))?;
            let now = Utc::now().to_rfc3339();

            let candidate: Option<String> = {
                let sql = match agent_id {
                    Some(_) => {
                        "SELECT id FROM tasks WHERE status = 'QUEUED' AND available_at <= ?1 \
                         AND agent_id = ?2 ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1"
                    }
                    None => {
                        "SELECT id FROM tasks WHERE status = 'QUEUED' AND available_at <= ?1 \
                         ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1"
                    }
                };
                let mut stmt = tx
                    .prepare(sql)
                    .map_err(|e| crate::error::from_sqlite(OP_CLAIM, e))?;
                match agent_id {
                    Some(a) => stmt
                        .query_row(params![now, a], |row| row.get(0))
                        .optional()
                        .map_err(|e| crate::error::from_sqlite(OP_CLAIM, e))?,
                    None => stmt
                        .query_row(params![now], |row| row.get(0))
                        .optional()
                        .map_err(|e| crate::error::from_sqlite(OP_CLAIM, e))?,
                }
            };

            let Some(task_id) = candidate else {
                tx.commit().map_err(|e| crate::error::from_sqlite(OP_CLAIM, e))?;
                return Ok(None);
            };

            let lease_owner = Uuid::new_v4().to_string();
            let lease_expires_at = (Utc::now() + chrono::Duration::seconds(lease_secs)).to_rfc3339();

            let ok = transitions::transition(
                &tx,
                ctx,
                TransitionRequest {
                    task_id: &task_id,
                    allowed_from: &[TaskStatus::Queued],
                    to: TaskStatus::Claimed,
                    event_type: "task.claimed",
                    payload: None,
                    extra: vec![
                        ExtraSet::new("lease_owner", lease_owner.clone()),
                        ExtraSet::new("lease_expires_at", lease_expires_at),
                    ],
                },
            )?;

            if !ok {
                tx.commit().map_err(|e| crate::error::from_sqlite(OP_CLAIM, e))?;
                return Ok(None);
            }

            tx.commit().map_err(|e| crate::error::from_sqlite(OP_CLAIM, e))?;
            drop(conn);
            self.get_task(ctx, &task_id).await
        })
        .await
    }

    /// Verifies the caller presents the current lease and the task is still
    /// CLAIMED, then transitions CLAIMED→RUNNING and extends the lease.
    pub async fn start_run(
        &self,
        ctx: &OpContext,
        task_id: &str,
        lease_owner: &str,
        policy_version: &str,
    ) -> Result<Task, StoreError> {
        let lease_secs = self.config.lease_duration_secs;
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| crate::error::from_sqlite(OP_START_RUN, e))?;

        let current_owner: Option<String> = tx
            .query_row(
                "SELECT lease_owner FROM tasks WHERE id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| crate::error::from_sqlite(OP_START_RUN, e))?
            .flatten();

        if current_owner.as_deref() != Some(lease_owner) {
            return Err(StoreError::not_found(OP_START_RUN));
        }

        let lease_expires_at = (Utc::now() + chrono::Duration::seconds(lease_secs)).to_rfc3339();
        let ok = transitions::transition(
            &tx,
            ctx,
            TransitionRequest {
                task_id,
                allowed_from: &[TaskStatus::Claimed],
                to: TaskStatus::Running,
                event_type: "task.started",
                payload: None,
                extra: vec![
                    ExtraSet::new("lease_expires_at", lease_expires_at),
                    ExtraSet::new("policy_version", policy_version.to_string()),
                ],
            },
        )?;
        if !ok {
            return Err(StoreError::not_found(OP_START_RUN));
        }
        tx.commit().map_err(|e| crate::error::from_sqlite(OP_START_RUN, e))?;
        drop(conn);
        self.get_task(ctx, task_id)
            .await?
            .ok_or_else(|| StoreError::not_found(OP_START_RUN))
    }

    /// Extends the lease if `lease_owner` still holds it and the task is
    /// CLAIMED or RUNNING. Returns whether a row was updated.
    pub async fn heartbeat(
        &self,
        _ctx: &OpContext,
        task_id: &str,
        lease_owner: &str,
    ) -> Result<bool, StoreError> {
        let lease_secs = self.config.lease_duration_secs;
        let lease_expires_at = (Utc::now() + chrono::Duration::seconds(lease_secs)).to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks SET lease_expires_at = ?1
                 WHERE id = ?2 AND lease_owner = ?3 AND status IN ('CLAIMED', 'RUNNING')",
                params![lease_expires_at, task_id, lease_owner],
            )
            .map_err(|e| crate::error::from_sqlite(OP_HEARTBEAT, e))?;
        Ok(rows > 0)
    }

    /// Records an interim token-usage reading for a RUNNING task and
    /// publishes `task.tokens`. Intended for agents that stream usage
    /// updates mid-run, well before `complete_task` snapshots the final
    /// figure. Returns whether a row was updated.
    pub async fn update_token_usage(
        &self,
        _ctx: &OpContext,
        task_id: &str,
        token_usage: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks SET token_usage = ?1 WHERE id = ?2 AND status = 'RUNNING'",
                params![token_usage, task_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_TOKENS, e))?;
        drop(conn);
        if rows > 0 {
            self.publish(
                topics::TASK_TOKENS,
                serde_json::json!({ "task_id": task_id, "token_usage": token_usage }),
            );
        }
        Ok(rows > 0)
    }

    /// Requeues CLAIMED/RUNNING tasks whose lease has expired. Returns the
    /// number of tasks requeued.
    pub async fn expire_leases(&self, ctx: &OpContext) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| crate::error::from_sqlite(OP_EXPIRE, e))?;
        let now = Utc::now().to_rfc3339();
        let expired: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM tasks WHERE status IN ('CLAIMED', 'RUNNING') \
                     AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
                )
                .map_err(|e| crate::error::from_sqlite(OP_EXPIRE, e))?;
            let rows = stmt
                .query_map([&now], |row| row.get(0))
                .map_err(|e| crate::error::from_sqlite(OP_EXPIRE, e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| crate::error::from_sqlite(OP_EXPIRE, e))?
        };

        let mut requeued = 0u64;
        for task_id in &expired {
            let ok = transitions::transition(
                &tx,
                ctx,
                TransitionRequest {
                    task_id,
                    allowed_from: &[TaskStatus::Claimed, TaskStatus::Running],
                    to: TaskStatus::Queued,
                    event_type: "task.lease_expired",
                    payload: None,
                    extra: vec![
                        ExtraSet::new("lease_owner", rusqlite::types::Value::Null),
                        ExtraSet::new("lease_expires_at", rusqlite::types::Value::Null),
                    ],
                },
            )?;
            if ok {
                requeued += 1;
            }
        }
        tx.commit().map_err(|e| crate::error::from_sqlite(OP_EXPIRE, e))?;
        Ok(requeued)
    }

    /// Raises `priority` by 1 (capped) for QUEUED rows that haven't moved
    /// since `older_than`, preventing session starvation under load.
    pub async fn age_priorities(
        &self,
        _ctx: &OpContext,
        older_than: chrono::Duration,
    ) -> Result<u64, StoreError> {
        let cap = self.config.priority_cap;
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks SET priority = MIN(priority + 1, ?1)
                 WHERE status = 'QUEUED' AND updated_at < ?2 AND priority < ?1",
                params![cap, cutoff],
            )
            .map_err(|e| crate::error::from_sqlite(OP_AGE, e))?;
        Ok(rows as u64)
    }

    /// Sets the cooperative cancel flag on any non-terminal task.
    pub async fn request_cancel(&self, _ctx: &OpContext, task_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks SET cancel_requested = 1
                 WHERE id = ?1 AND status NOT IN ('SUCCEEDED', 'CANCELED', 'DEAD_LETTER')",
                [task_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_CANCEL, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_CANCEL));
        }
        Ok(())
    }

    pub async fn is_cancel_requested(&self, _ctx: &OpContext, task_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let flag: i64 = conn
            .query_row(
                "SELECT cancel_requested FROM tasks WHERE id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::not_found(OP_CANCEL),
                other => crate::error::from_sqlite(OP_CANCEL, other),
            })?;
        Ok(flag != 0)
    }

    /// Hard-cancels a task from any non-terminal status.
    pub async fn abort_task(&self, ctx: &OpContext, task_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let ok = transitions::transition(
            &conn,
            ctx,
            TransitionRequest {
                task_id,
                allowed_from: &[
                    TaskStatus::Queued,
                    TaskStatus::Claimed,
                    TaskStatus::Running,
                    TaskStatus::RetryWait,
                ],
                to: TaskStatus::Canceled,
                event_type: "task.aborted",
                payload: None,
                extra: vec![
                    ExtraSet::new("lease_owner", rusqlite::types::Value::Null),
                    ExtraSet::new("lease_expires_at", rusqlite::types::Value::Null),
                    ExtraSet::new("last_error_code", ReasonCode::Aborted.as_str().to_string()),
                ],
            },
        )?;
        self.publish(topics::TASK_CANCELED, serde_json::json!({ "task_id": task_id }));
        Ok(ok)
    }

    /// Transitions RUNNING→SUCCEEDED, stores the result, publishes
    /// `task.completed`, and snapshots metrics.
    pub async fn complete_task(
        &self,
        ctx: &OpContext,
        task_id: &str,
        result: serde_json::Value,
        token_usage: i64,
        cost_usd: f64,
    ) -> Result<Task, StoreError> {
        let conn = self.conn.lock().await;
        let ok = transitions::transition(
            &conn,
            ctx,
            TransitionRequest {
                task_id,
                allowed_from: &[TaskStatus::Running],
                to: TaskStatus::Succeeded,
                event_type: "task.completed",
                payload: None,
                extra: vec![
                    ExtraSet::new("result", result.to_string()),
                    ExtraSet::new("error", rusqlite::types::Value::Null),
                    ExtraSet::new("lease_owner", rusqlite::types::Value::Null),
                    ExtraSet::new("lease_expires_at", rusqlite::types::Value::Null),
                    ExtraSet::new("token_usage", token_usage),
                    ExtraSet::new("cost_usd", cost_usd),
                ],
            },
        )?;
        if !ok {
            return Err(StoreError::not_found(OP_COMPLETE));
        }
        drop(conn);
        let task = self
            .get_task(ctx, task_id)
            .await?
            .ok_or_else(|| StoreError::not_found(OP_COMPLETE))?;
        self.record_task_metrics(&task).await?;
        self.publish(
            topics::TASK_COMPLETED,
            serde_json::json!({ "task_id": task_id, "result": task.result }),
        );
        Ok(task)
    }

    /// The retry/DLQ engine. See §4.3 for the full decision tree.
    pub async fn fail_task(
        &self,
        ctx: &OpContext,
        task_id: &str,
        error_message: &str,
    ) -> Result<FailDecision, StoreError> {
        let retry_base = self.config.retry_base_secs;
        let retry_max = self.config.retry_max_secs;
        let poison_threshold = self.config.poison_threshold;

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| crate::error::from_sqlite(OP_FAIL, e))?;

        let (status_str, attempt, max_attempts, prev_fingerprint, prev_poison): (
            String,
            i64,
            i64,
            Option<String>,
            i64,
        ) = tx
            .query_row(
                "SELECT status, attempt, max_attempts, last_error_fingerprint, poison_count \
                 FROM tasks WHERE id = ?1",
                [task_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::not_found(OP_FAIL),
                other => crate::error::from_sqlite(OP_FAIL, other),
            })?;

        if TaskStatus::parse(&status_str) != Some(TaskStatus::Running) {
            return Err(StoreError::conflict(
                OP_FAIL,
                format!("task is not RUNNING (status={status_str})"),
            ));
        }

        let fingerprint = error_fingerprint(error_message);
        let poison_count = if prev_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            prev_poison + 1
        } else {
            1
        };
        let next_attempt = attempt + 1;

        let outcome = if next_attempt >= max_attempts {
            FailOutcome::DeadLetter
        } else if poison_count >= poison_threshold {
            FailOutcome::DeadLetter
        } else {
            FailOutcome::Retry
        };

        let reason = match outcome {
            FailOutcome::DeadLetter if next_attempt >= max_attempts => {
                ReasonCode::DeadLetterMaxAttempts
            }
            FailOutcome::DeadLetter => ReasonCode::DeadLetterPoisonPill,
            FailOutcome::Retry => ReasonCode::RetryProcessorError,
        };

        let decision = match outcome {
            FailOutcome::Retry => {
                let base_secs = (retry_base * 2i64.pow((next_attempt - 1).max(0) as u32)).min(retry_max);
                let jitter_seed = fnv64a(format!("{task_id}:{next_attempt}").as_bytes());
                let jitter = if base_secs > 0 {
                    (jitter_seed % ((base_secs / 2).max(1) as u64)) as i64
                } else {
                    0
                };
                let delay_secs = (base_secs + jitter).min(retry_max);
                let available_at = Utc::now() + chrono::Duration::seconds(delay_secs);

                let ok1 = transitions::transition(
                    &tx,
                    ctx,
                    TransitionRequest {
                        task_id,
                        allowed_from: &[TaskStatus::Running],
                        to: TaskStatus::RetryWait,
                        event_type: "task.retry_scheduled",
                        payload: Some(serde_json::json!({ "reason": reason.as_str() })),
                        extra: vec![
                            ExtraSet::new("attempt", next_attempt),
                            ExtraSet::new("last_error_fingerprint", fingerprint.clone()),
                            ExtraSet::new("poison_count", poison_count),
                            ExtraSet::new("last_error_code", reason.as_str().to_string()),
                            ExtraSet::new("available_at", available_at.to_rfc3339()),
                            ExtraSet::new("error", error_message.to_string()),
                            ExtraSet::new("lease_owner", rusqlite::types::Value::Null),
                            ExtraSet::new("lease_expires_at", rusqlite::types::Value::Null),
                        ],
                    },
                )?;
                if !ok1 {
                    return Err(StoreError::conflict(OP_FAIL, "lost race during fail-handler"));
                }
                let ok2 = transitions::transition(
                    &tx,
                    ctx,
                    TransitionRequest {
                        task_id,
                        allowed_from: &[TaskStatus::RetryWait],
                        to: TaskStatus::Queued,
                        event_type: "task.requeued",
                        payload: None,
                        extra: vec![],
                    },
                )?;
                if !ok2 {
                    return Err(StoreError::conflict(OP_FAIL, "lost race during fail-handler"));
                }
                FailDecision {
                    outcome,
                    attempt: next_attempt,
                    max_attempts,
                    reason,
                    fingerprint,
                    poison_count,
                    available_at: Some(available_at),
                }
            }
            FailOutcome::DeadLetter => {
                let ok1 = transitions::transition(
                    &tx,
                    ctx,
                    TransitionRequest {
                        task_id,
                        allowed_from: &[TaskStatus::Running],
                        to: TaskStatus::Failed,
                        event_type: "task.failed",
                        payload: Some(serde_json::json!({ "reason": reason.as_str() })),
                        extra: vec![
                            ExtraSet::new("attempt", next_attempt),
                            ExtraSet::new("last_error_fingerprint", fingerprint.clone()),
                            ExtraSet::new("poison_count", poison_count),
                            ExtraSet::new("last_error_code", reason.as_str().to_string()),
                            ExtraSet::new("error", error_message.to_string()),
                            ExtraSet::new("lease_owner", rusqlite::types::Value::Null),
                            ExtraSet::new("lease_expires_at", rusqlite::types::Value::Null),
                        ],
                    },
                )?;
                if !ok1 {
                    return Err(StoreError::conflict(OP_FAIL, "lost race during fail-handler"));
                }
                let ok2 = transitions::transition(
                    &tx,
                    ctx,
                    TransitionRequest {
                        task_id,
                        allowed_from: &[TaskStatus::Failed],
                        to: TaskStatus::DeadLetter,
                        event_type: "task.dead_lettered",
                        payload: Some(serde_json::json!({ "reason": reason.as_str() })),
                        extra: vec![],
                    },
                )?;
                if !ok2 {
                    return Err(StoreError::conflict(OP_FAIL, "lost race during fail-handler"));
                }
                tracing::warn!(
                    task_id,
                    reason = reason.as_str(),
                    poison_count,
                    "task routed to dead-letter"
                );
                FailDecision {
                    outcome,
                    attempt: next_attempt,
                    max_attempts,
                    reason,
                    fingerprint,
                    poison_count,
                    available_at: None,
                }
            }
        };

        tx.commit().map_err(|e| crate::error::from_sqlite(OP_FAIL, e))?;
        drop(conn);

        if decision.outcome == FailOutcome::DeadLetter {
            if let Some(task) = self.get_task(ctx, task_id).await? {
                self.record_task_metrics(&task).await?;
            }
            self.publish(
                topics::TASK_FAILED,
                serde_json::json!({ "task_id": task_id, "reason": decision.reason.as_str() }),
            );
        }

        Ok(decision)
    }

    /// Scans for all CLAIMED/RUNNING tasks, requeues them, and deletes
    /// partial assistant-role messages left behind by a crashed RUNNING task.
    pub async fn recover_on_startup(&self, ctx: &OpContext) -> Result<RecoveryMetrics, StoreError> {
        let start = std::time::Instant::now();
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| crate::error::from_sqlite(OP_RECOVER, e))?;

        let stale: Vec<(String, String, String, String)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, session_id, status, updated_at FROM tasks WHERE status IN ('CLAIMED', 'RUNNING')",
                )
                .map_err(|e| crate::error::from_sqlite(OP_RECOVER, e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(|e| crate::error::from_sqlite(OP_RECOVER, e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| crate::error::from_sqlite(OP_RECOVER, e))?
        };

        let mut oldest_age_secs = 0i64;
        let now = Utc::now();
        for (task_id, session_id, status, updated_at) in &stale {
            let updated = parse_rfc3339(updated_at);
            oldest_age_secs = oldest_age_secs.max((now - updated).num_seconds());

            let allowed = if status == "RUNNING" {
                vec![TaskStatus::Running]
            } else {
                vec![TaskStatus::Claimed]
            };
            transitions::transition(
                &tx,
                ctx,
                TransitionRequest {
                    task_id,
                    allowed_from: &allowed,
                    to: TaskStatus::Queued,
                    event_type: "task.recovered",
                    payload: None,
                    extra: vec![
                        ExtraSet::new("lease_owner", rusqlite::types::Value::Null),
                        ExtraSet::new("lease_expires_at", rusqlite::types::Value::Null),
                    ],
                },
            )?;

            if status == "RUNNING" {
                tx.execute(
                    "DELETE FROM messages WHERE session_id = ?1 AND role = 'assistant' AND created_at >= ?2",
                    params![session_id, updated_at],
                )
                .map_err(|e| crate::error::from_sqlite(OP_RECOVER, e))?;
            }
        }

        tx.commit().map_err(|e| crate::error::from_sqlite(OP_RECOVER, e))?;

        Ok(RecoveryMetrics {
            stale_count: stale.len() as u64,
            oldest_stale_age_secs: oldest_age_secs,
            scan_duration_ms: start.elapsed().as_millis() as i64,
        })
    }
}
