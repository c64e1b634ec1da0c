//! Knowledge store (C7): agent memories, file pins, cross-agent shares,
//! session summaries, and reasoning-loop checkpoints.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub agent_id: String,
    pub key: String,
    pub value: String,
    pub source: Option<String>,
    pub relevance: f64,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    pub agent_id: String,
    pub source: String,
    pub content: String,
    pub token_count: i64,
    pub shared: bool,
    pub last_read_at: DateTime<Utc>,
    pub file_mtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareType {
    Memory,
    Pin,
    All,
}

impl ShareType {
    fn as_str(&self) -> &'static str {
        match self {
            ShareType::Memory => "memory",
            ShareType::Pin => "pin",
            ShareType::All => "all",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub session_id: String,
    pub agent_id: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopCheckpoint {
    pub agent_id: String,
    pub session_id: String,
    pub step: i64,
    pub token_usage: i64,
    pub status: String,
    pub messages: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

const RELEVANCE_DECAY_TOUCH: f64 = 0.05;
const RELEVANCE_MAX: f64 = 1.0;

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const OP_UPSERT_MEMORY: &str = "knowledge::upsert_memory";
const OP_TOUCH_MEMORY: &str = "knowledge::touch_memory";
const OP_DECAY: &str = "knowledge::decay_memories";
const OP_SEARCH: &str = "knowledge::search_memories";
const OP_UPSERT_PIN: &str = "knowledge::upsert_pin";
const OP_LIST_PINS: &str = "knowledge::list_pins";
const OP_SHARE: &str = "knowledge::share";
const OP_IS_SHARED: &str = "knowledge::is_shared";
const OP_SUMMARY: &str = "knowledge::upsert_summary";
const OP_GET_SUMMARY: &str = "knowledge::get_summary";
const OP_CHECKPOINT: &str = "knowledge::save_checkpoint";
const OP_LOAD_CHECKPOINT: &str = "knowledge::load_checkpoint";
const OP_CLEANUP_CHECKPOINTS: &str = "knowledge::cleanup_checkpoints";

impl Store {
    /// Upserts a memory, always resetting `relevance` to 1.0 — a write is
    /// evidence the memory matters again (§4.7).
    pub async fn upsert_memory(
        &self,
        _ctx: &OpContext,
        agent_id: &str,
        key: &str,
        value: &str,
        source: Option<&str>,
    ) -> Result<Memory, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_memories (agent_id, key, value, source, relevance, access_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1.0, 0, ?5, ?5)
             ON CONFLICT(agent_id, key) DO UPDATE SET
                value = excluded.value,
                source = excluded.source,
                relevance = 1.0,
                updated_at = excluded.updated_at",
            params![agent_id, key, value, source, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_UPSERT_MEMORY, e))?;
        conn.query_row(
            "SELECT agent_id, key, value, source, relevance, access_count, created_at, updated_at, last_accessed_at
             FROM agent_memories WHERE agent_id = ?1 AND key = ?2",
            params![agent_id, key],
            row_to_memory,
        )
        .map_err(|e| crate::error::from_sqlite(OP_UPSERT_MEMORY, e))
    }

    /// Records a read: bumps `access_count`, nudges `relevance` up by 0.05
    /// clamped to 1.0, and stamps `last_accessed_at`.
    pub async fn touch_memory(
        &self,
        _ctx: &OpContext,
        agent_id: &str,
        key: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE agent_memories SET
                    access_count = access_count + 1,
                    relevance = MIN(?1, relevance + ?2),
                    last_accessed_at = ?3
                 WHERE agent_id = ?4 AND key = ?5",
                params![RELEVANCE_MAX, RELEVANCE_DECAY_TOUCH, now, agent_id, key],
            )
            .map_err(|e| crate::error::from_sqlite(OP_TOUCH_MEMORY, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_TOUCH_MEMORY));
        }
        Ok(())
    }

    /// Multiplies every memory's relevance for `agent_id` by `factor`
    /// (expected in `(0, 1]`), the periodic forgetting pass.
    pub async fn decay_memories(
        &self,
        _ctx: &OpContext,
        agent_id: &str,
        factor: f64,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE agent_memories SET relevance = relevance * ?1 WHERE agent_id = ?2",
                params![factor, agent_id],
            )
            .map_err(|e| crate::error::from_sqlite(OP_DECAY, e))?;
        Ok(rows as u64)
    }

    /// Substring search over memory keys and values for `agent_id`, ordered
    /// by relevance then recency.
    pub async fn search_memories(
        &self,
        _ctx: &OpContext,
        agent_id: &str,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        let limit = self.config.clamp_list_limit(limit);
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, key, value, source, relevance, access_count, created_at, updated_at, last_accessed_at
                 FROM agent_memories
                 WHERE agent_id = ?1 AND (key LIKE ?2 ESCAPE '\\' OR value LIKE ?2 ESCAPE '\\')
                 ORDER BY relevance DESC, updated_at DESC LIMIT ?3",
            )
            .map_err(|e| crate::error::from_sqlite(OP_SEARCH, e))?;
        let rows = stmt
            .query_map(params![agent_id, pattern, limit], row_to_memory)
            .map_err(|e| crate::error::from_sqlite(OP_SEARCH, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_SEARCH, e))
    }

    /// Upserts a file pin, computing `token_count = ceil(len(content) / 4)`.
    pub async fn upsert_pin(
        &self,
        _ctx: &OpContext,
        agent_id: &str,
        source: &str,
        content: &str,
        shared: bool,
        file_mtime: Option<DateTime<Utc>>,
    ) -> Result<Pin, StoreError> {
        let token_count = ((content.len() as f64) / 4.0).ceil() as i64;
        let now = Utc::now().to_rfc3339();
        let mtime = file_mtime.map(|dt| dt.to_rfc3339());
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_pins (agent_id, source, content, token_count, shared, last_read_at, file_mtime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(agent_id, source) DO UPDATE SET
                content = excluded.content,
                token_count = excluded.token_count,
                shared = excluded.shared,
                last_read_at = excluded.last_read_at,
                file_mtime = excluded.file_mtime",
            params![agent_id, source, content, token_count, shared as i64, now, mtime],
        )
        .map_err(|e| crate::error::from_sqlite(OP_UPSERT_PIN, e))?;
        conn.query_row(
            "SELECT agent_id, source, content, token_count, shared, last_read_at, file_mtime
             FROM agent_pins WHERE agent_id = ?1 AND source = ?2",
            params![agent_id, source],
            row_to_pin,
        )
        .map_err(|e| crate::error::from_sqlite(OP_UPSERT_PIN, e))
    }

    /// Lists `agent_id`'s own pins plus every pin shared with it (directly,
    /// or via a wildcard share), deduplicated by source.
    pub async fn list_visible_pins(
        &self,
        _ctx: &OpContext,
        agent_id: &str,
    ) -> Result<Vec<Pin>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT p.agent_id, p.source, p.content, p.token_count, p.shared, p.last_read_at, p.file_mtime
                 FROM agent_pins p
                 WHERE p.agent_id = ?1
                    OR (p.shared = 1 AND EXISTS (
                        SELECT 1 FROM agent_shares s
                        WHERE s.source_agent = p.agent_id
                          AND (s.target_agent = ?1 OR s.target_agent = '*')
                          AND s.share_type IN ('pin', 'all')
                          AND (s.item_key = p.source OR s.item_key = '*')
                    ))
                 ORDER BY p.source ASC",
            )
            .map_err(|e| crate::error::from_sqlite(OP_LIST_PINS, e))?;
        let rows = stmt
            .query_map([agent_id], row_to_pin)
            .map_err(|e| crate::error::from_sqlite(OP_LIST_PINS, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_LIST_PINS, e))
    }

    /// Grants `target_agent` (or `"*"` for every agent) visibility into one
    /// of `source_agent`'s items (or `"*"` for all items of that type).
    /// Idempotent: re-granting the same share is a no-op.
    pub async fn grant_share(
        &self,
        _ctx: &OpContext,
        source_agent: &str,
        target_agent: &str,
        share_type: ShareType,
        item_key: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_shares (source_agent, target_agent, share_type, item_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_agent, target_agent, share_type, item_key) DO NOTHING",
            params![source_agent, target_agent, share_type.as_str(), item_key, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_SHARE, e))?;
        Ok(())
    }

    pub async fn is_memory_shared(
        &self,
        _ctx: &OpContext,
        source_agent: &str,
        target_agent: &str,
        key: &str,
    ) -> Result<bool, StoreError> {
        self.is_shared(source_agent, target_agent, "memory", key).await
    }

    pub async fn is_pin_shared(
        &self,
        _ctx: &OpContext,
        source_agent: &str,
        target_agent: &str,
        source: &str,
    ) -> Result<bool, StoreError> {
        self.is_shared(source_agent, target_agent, "pin", source).await
    }

    async fn is_shared(
        &self,
        source_agent: &str,
        target_agent: &str,
        share_type: &str,
        item_key: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM agent_shares
                 WHERE source_agent = ?1
                   AND (target_agent = ?2 OR target_agent = '*')
                   AND share_type IN (?3, 'all')
                   AND (item_key = ?4 OR item_key = '*')",
                params![source_agent, target_agent, share_type, item_key],
            )
            .map_err(|e| crate::error::from_sqlite(OP_IS_SHARED, e))?;
        Ok(count > 0)
    }

    pub async fn upsert_summary(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        agent_id: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO summaries (session_id, agent_id, content, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id, agent_id) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
            params![session_id, agent_id, content, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_SUMMARY, e))?;
        Ok(())
    }

    pub async fn get_summary(
        &self,
        _ctx: &OpContext,
        session_id: &str,
        agent_id: &str,
    ) -> Result<Option<Summary>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT session_id, agent_id, content, updated_at FROM summaries WHERE session_id = ?1 AND agent_id = ?2",
            params![session_id, agent_id],
            |row| {
                let updated_at: String = row.get(3)?;
                Ok(Summary {
                    session_id: row.get(0)?,
                    agent_id: row.get(1)?,
                    content: row.get(2)?,
                    updated_at: parse_dt(&updated_at),
                })
            },
        )
        .optional()
        .map_err(|e| crate::error::from_sqlite(OP_GET_SUMMARY, e))
    }

    pub async fn save_checkpoint(
        &self,
        _ctx: &OpContext,
        agent_id: &str,
        session_id: &str,
        step: i64,
        token_usage: i64,
        status: &str,
        messages: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO loop_checkpoints (agent_id, session_id, step, token_usage, status, messages, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(agent_id, session_id) DO UPDATE SET
                step = excluded.step, token_usage = excluded.token_usage,
                status = excluded.status, messages = excluded.messages, updated_at = excluded.updated_at",
            params![agent_id, session_id, step, token_usage, status, messages.to_string(), now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_CHECKPOINT, e))?;
        Ok(())
    }

    pub async fn load_checkpoint(
        &self,
        _ctx: &OpContext,
        agent_id: &str,
        session_id: &str,
    ) -> Result<Option<LoopCheckpoint>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT agent_id, session_id, step, token_usage, status, messages, updated_at
             FROM loop_checkpoints WHERE agent_id = ?1 AND session_id = ?2",
            params![agent_id, session_id],
            |row| {
                let messages: String = row.get(5)?;
                let updated_at: String = row.get(6)?;
                Ok(LoopCheckpoint {
                    agent_id: row.get(0)?,
                    session_id: row.get(1)?,
                    step: row.get(2)?,
                    token_usage: row.get(3)?,
                    status: row.get(4)?,
                    messages: serde_json::from_str(&messages).unwrap_or(serde_json::Value::Null),
                    updated_at: parse_dt(&updated_at),
                })
            },
        )
        .optional()
        .map_err(|e| crate::error::from_sqlite(OP_LOAD_CHECKPOINT, e))
    }

    /// Deletes non-running checkpoints older than `older_than`, keyed off
    /// `updated_at`. A checkpoint still marked `running` is left alone
    /// regardless of age — cleanup only sweeps finished loops.
    pub async fn cleanup_checkpoints(
        &self,
        _ctx: &OpContext,
        older_than: chrono::Duration,
    ) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM loop_checkpoints WHERE updated_at < ?1 AND status != 'running'",
                [cutoff],
            )
            .map_err(|e| crate::error::from_sqlite(OP_CLEANUP_CHECKPOINTS, e))?;
        Ok(rows as u64)
    }
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    let last_accessed_at: Option<String> = row.get(8)?;
    Ok(Memory {
        agent_id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        source: row.get(3)?,
        relevance: row.get(4)?,
        access_count: row.get(5)?,
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
        last_accessed_at: last_accessed_at.as_deref().map(parse_dt),
    })
}

fn row_to_pin(row: &Row<'_>) -> rusqlite::Result<Pin> {
    let last_read_at: String = row.get(5)?;
    let file_mtime: Option<String> = row.get(6)?;
    Ok(Pin {
        agent_id: row.get(0)?,
        source: row.get(1)?,
        content: row.get(2)?,
        token_count: row.get(3)?,
        shared: row.get::<_, i64>(4)? != 0,
        last_read_at: parse_dt(&last_read_at),
        file_mtime: file_mtime.as_deref().map(parse_dt),
    })
}
