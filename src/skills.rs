//! Skill registry: tracks externally-loaded skill packages by content hash
//! so a skill that keeps faulting gets quarantined out of the active set.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkillState {
    Active,
    Quarantined,
}

impl SkillState {
    fn as_str(&self) -> &'static str {
        match self {
            SkillState::Active => "active",
            SkillState::Quarantined => "quarantined",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => SkillState::Active,
            "quarantined" => SkillState::Quarantined,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRegistration {
    pub skill_hash: String,
    pub name: String,
    pub provenance: Option<String>,
    pub state: SkillState,
    pub fault_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_skill(row: &Row<'_>) -> rusqlite::Result<SkillRegistration> {
    let state_str: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(SkillRegistration {
        skill_hash: row.get(0)?,
        name: row.get(1)?,
        provenance: row.get(2)?,
        state: SkillState::parse(&state_str).unwrap_or(SkillState::Active),
        fault_count: row.get(4)?,
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
    })
}

const COLUMNS: &str = "skill_hash, name, provenance, state, fault_count, created_at, updated_at";

const QUARANTINE_THRESHOLD: i64 = 3;

const OP_REGISTER: &str = "skills::register";
const OP_FAULT: &str = "skills::record_fault";
const OP_LIST_ACTIVE: &str = "skills::list_active";
const OP_GET: &str = "skills::get";

impl Store {
    /// Registers a skill by content hash; a re-register of the same hash is
    /// a no-op (the content, and therefore trust decision, hasn't changed).
    pub async fn register_skill(
        &self,
        _ctx: &OpContext,
        skill_hash: &str,
        name: &str,
        provenance: Option<&str>,
    ) -> Result<SkillRegistration, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO skill_registry (skill_hash, name, provenance, state, fault_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', 0, ?4, ?4)
             ON CONFLICT(skill_hash) DO NOTHING",
            params![skill_hash, name, provenance, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_REGISTER, e))?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM skill_registry WHERE skill_hash = ?1"),
            [skill_hash],
            row_to_skill,
        )
        .map_err(|e| crate::error::from_sqlite(OP_REGISTER, e))
    }

    /// Increments the fault counter and quarantines the skill once it
    /// reaches the threshold. Returns the post-update state.
    pub async fn record_skill_fault(
        &self,
        _ctx: &OpContext,
        skill_hash: &str,
    ) -> Result<SkillState, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE skill_registry SET
                    fault_count = fault_count + 1,
                    state = CASE WHEN fault_count + 1 >= ?1 THEN 'quarantined' ELSE state END,
                    updated_at = ?2
                 WHERE skill_hash = ?3",
                params![QUARANTINE_THRESHOLD, now, skill_hash],
            )
            .map_err(|e| crate::error::from_sqlite(OP_FAULT, e))?;
        if rows == 0 {
            return Err(StoreError::not_found(OP_FAULT));
        }
        let state_str: String = conn
            .query_row(
                "SELECT state FROM skill_registry WHERE skill_hash = ?1",
                [skill_hash],
                |row| row.get(0),
            )
            .map_err(|e| crate::error::from_sqlite(OP_FAULT, e))?;
        Ok(SkillState::parse(&state_str).unwrap_or(SkillState::Active))
    }

    pub async fn list_active_skills(&self, _ctx: &OpContext) -> Result<Vec<SkillRegistration>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM skill_registry WHERE state = 'active' ORDER BY name ASC"
            ))
            .map_err(|e| crate::error::from_sqlite(OP_LIST_ACTIVE, e))?;
        let rows = stmt
            .query_map([], row_to_skill)
            .map_err(|e| crate::error::from_sqlite(OP_LIST_ACTIVE, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::from_sqlite(OP_LIST_ACTIVE, e))
    }

    pub async fn get_skill(
        &self,
        _ctx: &OpContext,
        skill_hash: &str,
    ) -> Result<Option<SkillRegistration>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM skill_registry WHERE skill_hash = ?1"),
            [skill_hash],
            row_to_skill,
        )
        .optional()
        .map_err(|e| crate::error::from_sqlite(OP_GET, e))
    }
}
