//! Conversation store (C6): sessions, messages, agents, and the inter-agent
//! mailbox.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{AgentStatus, MessageRole};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub soul_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub agent_id: String,
    pub role: MessageRole,
    pub content: String,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub worker_count: i64,
    pub timeout_secs: Option<i64>,
    pub queue_depth_cap: Option<i64>,
    pub skills_filter: Option<String>,
    pub policy_overrides: Option<String>,
    pub key_env_var: Option<String>,
    pub emoji: Option<String>,
    pub preferred_search: Option<String>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub id: i64,
    pub from_agent: String,
    pub to_agent: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const OP_UPSERT_SESSION: &str = "conversation::upsert_session";
const OP_APPEND: &str = "conversation::append_message";
const OP_LIST: &str = "conversation::list_messages";
const OP_COUNT: &str = "conversation::count_messages";
const OP_DELETE: &str = "conversation::delete_for_agent";
const OP_AGENT_CREATE: &str = "conversation::create_agent";
const OP_AGENT_GET: &str = "conversation::get_agent";
const OP_AGENT_LIST: &str = "conversation::list_agents";
const OP_AGENT_UPDATE: &str = "conversation::update_agent_status";
const OP_AGENT_DELETE: &str = "conversation::delete_agent";
const OP_MAILBOX_SEND: &str = "conversation::mailbox_send";
const OP_MAILBOX_READ: &str = "conversation::mailbox_read";
const OP_MAILBOX_PEEK: &str = "conversation::mailbox_peek";

impl Store {
    /// Creates the session row if absent; no-op if it already exists.
    /// `session_id` must be a valid UUID.
    pub async fn upsert_session(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        soul_hash: Option<&str>,
    ) -> Result<Session, StoreError> {
        Uuid::parse_str(session_id)
            .map_err(|_| StoreError::conflict(OP_UPSERT_SESSION, "session_id must be a UUID"))?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (id, soul_hash, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![session_id, soul_hash, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_UPSERT_SESSION, e))?;
        conn.query_row(
            "SELECT id, soul_hash, created_at FROM sessions WHERE id = ?1",
            [session_id],
            |row| {
                let created_at: String = row.get(2)?;
                Ok(Session {
                    id: row.get(0)?,
                    soul_hash: row.get(1)?,
                    created_at: parse_dt(&created_at),
                })
            },
        )
        .map_err(|e| crate::error::from_sqlite(OP_UPSERT_SESSION, e))
    }

    /// Appends a message. `role` must be one of the four whitelisted roles
    /// (enforced both by the enum type and the table's CHECK constraint).
    pub async fn append_message(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        agent_id: &str,
        role: MessageRole,
        content: &str,
        token_count: i64,
    ) -> Result<Message, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (session_id, agent_id, role, content, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, agent_id, role.as_str(), content, token_count, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_APPEND, e))?;
        let id = conn.last_insert_rowid();
        Ok(Message {
            id,
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            role,
            content: content.to_string(),
            token_count,
            created_at: parse_dt(&now),
            archived_at: None,
        })
    }

    /// Lists up to `limit` most recent messages for `(session_id, agent_id)`,
    /// oldest first. `limit` clamps to the configured default/max.
    pub async fn load_recent_messages(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        agent_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = self.config.clamp_list_limit(limit);
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, agent_id, role, content, token_count, created_at, archived_at
                 FROM messages WHERE session_id = ?1 AND agent_id = ?2
                 ORDER BY id DESC LIMIT ?3",
            )
            .map_err(|e| crate::error::from_sqlite(OP_LIST, e))?;
        let rows = stmt
            .query_map(params![session_id, agent_id, limit], row_to_message)
            .map_err(|e| crate::error::from_sqlite(OP_LIST, e))?;
        let mut out = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_LIST, e))?;
        out.reverse();
        Ok(out)
    }

    /// Lists messages for `(session_id, agent_id)` with `id > after_id`,
    /// oldest first, for catch-up reads.
    pub async fn load_messages_since(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        agent_id: &str,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = self.config.clamp_list_limit(limit);
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, agent_id, role, content, token_count, created_at, archived_at
                 FROM messages WHERE session_id = ?1 AND agent_id = ?2 AND id > ?3
                 ORDER BY id ASC LIMIT ?4",
            )
            .map_err(|e| crate::error::from_sqlite(OP_LIST, e))?;
        let rows = stmt
            .query_map(params![session_id, agent_id, after_id, limit], row_to_message)
            .map_err(|e| crate::error::from_sqlite(OP_LIST, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_LIST, e))
    }

    pub async fn count_messages(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        agent_id: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND agent_id = ?2",
            params![session_id, agent_id],
            |row| row.get(0),
        )
        .map_err(|e| crate::error::from_sqlite(OP_COUNT, e))
    }

    /// Deletes every message belonging to `agent_id` within `session_id` —
    /// per-agent isolation means this never touches another agent's rows.
    pub async fn delete_messages_for_agent(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        agent_id: &str,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM messages WHERE session_id = ?1 AND agent_id = ?2",
                params![session_id, agent_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_DELETE, e))?;
        Ok(rows as u64)
    }

    pub async fn create_agent(
        &self,
        _ctx: &OpContext,
        id: &str,
        display_name: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<Agent, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agents (id, display_name, provider, model, worker_count, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, 'active', ?5, ?5)",
            params![id, display_name, provider, model, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_AGENT_CREATE, e))?;
        drop(conn);
        self.get_agent(_ctx, id)
            .await?
            .ok_or_else(|| StoreError::not_found(OP_AGENT_CREATE))
    }

    pub async fn get_agent(&self, _ctx: &OpContext, id: &str) -> Result<Option<Agent>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, display_name, provider, model, worker_count, timeout_secs, queue_depth_cap,
                    skills_filter, policy_overrides, key_env_var, emoji, preferred_search, status,
                    created_at, updated_at
             FROM agents WHERE id = ?1",
            [id],
            row_to_agent,
        )
        .optional()
        .map_err(|e| crate::error::from_sqlite(OP_AGENT_GET, e))
    }

    pub async fn list_agents(&self, _ctx: &OpContext) -> Result<Vec<Agent>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, display_name, provider, model, worker_count, timeout_secs, queue_depth_cap,
                        skills_filter, policy_overrides, key_env_var, emoji, preferred_search, status,
                        created_at, updated_at
                 FROM agents ORDER BY id ASC",
            )
            .map_err(|e| crate::error::from_sqlite(OP_AGENT_LIST, e))?;
        let rows = stmt
            .query_map([], row_to_agent)
            .map_err(|e| crate::error::from_sqlite(OP_AGENT_LIST, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_AGENT_LIST, e))
    }

    pub async fn update_agent_status(
        &self,
        _ctx: &OpContext,
        id: &str,
        status: AgentStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_AGENT_UPDATE, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_AGENT_UPDATE));
        }
        Ok(())
    }

    /// Deletes an agent and cascades to its mailbox traffic and
    /// delegations, hard-cancelling any QUEUED/CLAIMED task it owns. RUNNING
    /// tasks are left alone for the engine's own drain/timeout path.
    pub async fn delete_agent(&self, ctx: &OpContext, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| crate::error::from_sqlite(OP_AGENT_DELETE, e))?;
        tx.execute(
            "DELETE FROM agent_messages WHERE from_agent = ?1 OR to_agent = ?1",
            [id],
        )
        .map_err(|e| crate::error::from_sqlite(OP_AGENT_DELETE, e))?;
        tx.execute(
            "DELETE FROM delegations WHERE parent_agent = ?1 OR child_agent = ?1",
            [id],
        )
        .map_err(|e| crate::error::from_sqlite(OP_AGENT_DELETE, e))?;

        // Hard-cancel QUEUED/CLAIMED tasks; RUNNING tasks are left to the
        // engine's own drain/timeout path (§4.6).
        let cancelable_tasks: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT id FROM tasks WHERE agent_id = ?1 AND status IN ('QUEUED', 'CLAIMED')")
                .map_err(|e| crate::error::from_sqlite(OP_AGENT_DELETE, e))?;
            let rows = stmt
                .query_map([id], |row| row.get(0))
                .map_err(|e| crate::error::from_sqlite(OP_AGENT_DELETE, e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| crate::error::from_sqlite(OP_AGENT_DELETE, e))?
        };
        for task_id in &cancelable_tasks {
            crate::transitions::transition(
                &tx,
                ctx,
                crate::transitions::TransitionRequest {
                    task_id,
                    allowed_from: &[crate::types::TaskStatus::Queued, crate::types::TaskStatus::Claimed],
                    to: crate::types::TaskStatus::Canceled,
                    event_type: "task.aborted",
                    payload: None,
                    extra: vec![
                        crate::transitions::ExtraSet::new("lease_owner", rusqlite::types::Value::Null),
                        crate::transitions::ExtraSet::new("lease_expires_at", rusqlite::types::Value::Null),
                        crate::transitions::ExtraSet::new(
                            "last_error_code",
                            crate::types::ReasonCode::Canceled.as_str().to_string(),
                        ),
                    ],
                },
            )?;
        }

        let rows = tx
            .execute("DELETE FROM agents WHERE id = ?1", [id])
            .map_err(|e| crate::error::from_sqlite(OP_AGENT_DELETE, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_AGENT_DELETE));
        }
        tx.commit().map_err(|e| crate::error::from_sqlite(OP_AGENT_DELETE, e))?;
        Ok(())
    }

    pub async fn mailbox_send(
        &self,
        _ctx: &OpContext,
        from_agent: &str,
        to_agent: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_messages (from_agent, to_agent, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![from_agent, to_agent, content, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_MAILBOX_SEND, e))?;
        Ok(())
    }

    /// Reads and atomically marks read up to `limit` unread messages
    /// addressed to `to_agent`, oldest first (transactional dequeue — two
    /// readers never get the same message).
    pub async fn mailbox_read(
        &self,
        _ctx: &OpContext,
        to_agent: &str,
        limit: i64,
    ) -> Result<Vec<MailboxMessage>, StoreError> {
        let limit = self.config.clamp_list_limit(limit);
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| crate::error::from_sqlite(OP_MAILBOX_READ, e))?;
        let ids: Vec<i64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM agent_messages WHERE to_agent = ?1 AND read_at IS NULL \
                     ORDER BY created_at ASC, id ASC LIMIT ?2",
                )
                .map_err(|e| crate::error::from_sqlite(OP_MAILBOX_READ, e))?;
            let rows = stmt
                .query_map(params![to_agent, limit], |row| row.get(0))
                .map_err(|e| crate::error::from_sqlite(OP_MAILBOX_READ, e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| crate::error::from_sqlite(OP_MAILBOX_READ, e))?
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE agent_messages SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
                params![now, id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_MAILBOX_READ, e))?;
            let msg = tx
                .query_row(
                    "SELECT id, from_agent, to_agent, content, created_at, read_at FROM agent_messages WHERE id = ?1",
                    [id],
                    row_to_mailbox,
                )
                .map_err(|e| crate::error::from_sqlite(OP_MAILBOX_READ, e))?;
            out.push(msg);
        }
        tx.commit().map_err(|e| crate::error::from_sqlite(OP_MAILBOX_READ, e))?;
        Ok(out)
    }

    /// Non-destructive count of unread messages addressed to `to_agent`.
    pub async fn mailbox_peek(&self, _ctx: &OpContext, to_agent: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM agent_messages WHERE to_agent = ?1 AND read_at IS NULL",
            [to_agent],
            |row| row.get(0),
        )
        .map_err(|e| crate::error::from_sqlite(OP_MAILBOX_PEEK, e))
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    let archived_at: Option<String> = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        role: MessageRole::parse(&role_str).unwrap_or(MessageRole::User),
        content: row.get(4)?,
        token_count: row.get(5)?,
        created_at: parse_dt(&created_at),
        archived_at: archived_at.as_deref().map(parse_dt),
    })
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let status_str: String = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(Agent {
        id: row.get(0)?,
        display_name: row.get(1)?,
        provider: row.get(2)?,
        model: row.get(3)?,
        worker_count: row.get(4)?,
        timeout_secs: row.get(5)?,
        queue_depth_cap: row.get(6)?,
        skills_filter: row.get(7)?,
        policy_overrides: row.get(8)?,
        key_env_var: row.get(9)?,
        emoji: row.get(10)?,
        preferred_search: row.get(11)?,
        status: AgentStatus::parse(&status_str).unwrap_or(AgentStatus::Active),
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
    })
}

fn row_to_mailbox(row: &Row<'_>) -> rusqlite::Result<MailboxMessage> {
    let created_at: String = row.get(4)?;
    let read_at: Option<String> = row.get(5)?;
    Ok(MailboxMessage {
        id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_dt(&created_at),
        read_at: read_at.as_deref().map(parse_dt),
    })
}
