//! Idempotency ledger (C5): at-most-once registration of external
//! side-effects keyed by `(idempotency_key, request_hash)`.

use crate::context::OpContext;
use crate::error::StoreError;
use crate::store::Store;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideEffectStatus {
    Pending,
    Succeeded,
    Failed,
}

impl SideEffectStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SideEffectStatus::Pending => "PENDING",
            SideEffectStatus::Succeeded => "SUCCEEDED",
            SideEffectStatus::Failed => "FAILED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => SideEffectStatus::Pending,
            "SUCCEEDED" => SideEffectStatus::Succeeded,
            "FAILED" => SideEffectStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub tool_name: String,
    pub request_hash: String,
    pub side_effect_status: SideEffectStatus,
    pub result_hash: Option<String>,
}

/// What the caller should do before invoking an external side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No record exists; proceed and call `register_successful` after.
    Proceed,
    /// A prior call with the same key and request hash already succeeded;
    /// skip the side effect entirely and reuse the stored result.
    AlreadySucceeded { result_hash: Option<String> },
    /// A prior call with the same key but a *different* request hash exists
    /// — the caller is reusing a key for a different operation.
    HashConflict,
}

const OP_CHECK: &str = "idempotency::check";
const OP_REGISTER: &str = "idempotency::register_successful";

impl Store {
    pub async fn idempotency_check(
        &self,
        _ctx: &OpContext,
        idempotency_key: &str,
        tool_name: &str,
        request_hash: &str,
    ) -> Result<CheckOutcome, StoreError> {
        if idempotency_key.is_empty() || tool_name.is_empty() {
            return Err(StoreError::conflict(
                OP_CHECK,
                "idempotency_key and tool_name must be non-empty",
            ));
        }
        let conn = self.conn.lock().await;
        let existing: Option<(String, String, Option<String>)> = conn
            .query_row(
                "SELECT request_hash, side_effect_status, result_hash \
                 FROM tool_call_dedup WHERE idempotency_key = ?1",
                [idempotency_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| crate::error::from_sqlite(OP_CHECK, e))?;

        let Some((stored_hash, status, result_hash)) = existing else {
            return Ok(CheckOutcome::Proceed);
        };

        if stored_hash != request_hash {
            return Ok(CheckOutcome::HashConflict);
        }

        match SideEffectStatus::parse(&status) {
            Some(SideEffectStatus::Succeeded) => {
                Ok(CheckOutcome::AlreadySucceeded { result_hash })
            }
            _ => Ok(CheckOutcome::Proceed),
        }
    }

    /// Records a successful external side effect, upserting the ledger row.
    /// Returns a conflict error if a row exists for this key with a
    /// different request hash (the caller should have checked first).
    pub async fn register_successful(
        &self,
        _ctx: &OpContext,
        idempotency_key: &str,
        tool_name: &str,
        request_hash: &str,
        result_hash: Option<&str>,
    ) -> Result<(), StoreError> {
        if idempotency_key.is_empty() || tool_name.is_empty() {
            return Err(StoreError::conflict(
                OP_REGISTER,
                "idempotency_key and tool_name must be non-empty",
            ));
        }
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;

        let existing_hash: Option<String> = conn
            .query_row(
                "SELECT request_hash FROM tool_call_dedup WHERE idempotency_key = ?1",
                [idempotency_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| crate::error::from_sqlite(OP_REGISTER, e))?;

        if let Some(existing) = &existing_hash {
            if existing != request_hash {
                return Err(StoreError::conflict(
                    OP_REGISTER,
                    "idempotency key reused with a different request hash",
                ));
            }
        }

        conn.execute(
            "INSERT INTO tool_call_dedup
                (idempotency_key, tool_name, request_hash, side_effect_status, result_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'SUCCEEDED', ?4, ?5, ?5)
             ON CONFLICT(idempotency_key) DO UPDATE SET
                side_effect_status = 'SUCCEEDED',
                result_hash = excluded.result_hash,
                updated_at = excluded.updated_at",
            params![idempotency_key, tool_name, request_hash, result_hash, now],
        )
        .map_err(|e| crate::error::from_sqlite(OP_REGISTER, e))?;
        Ok(())
    }
}

impl IdempotencyRecord {
    pub fn status_str(&self) -> &'static str {
        self.side_effect_status.as_str()
    }
}
