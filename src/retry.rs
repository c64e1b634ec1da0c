//! Busy-retry wrapper (C9).
//!
//! Re-executes an operation that fails with a transient busy/locked error
//! using bounded exponential backoff with jitter, honouring cancellation
//! between attempts.

use crate::context::OpContext;
use crate::error::StoreError;
use rand::Rng;
use std::time::Duration;

/// Delay schedule before jitter, matching §4.9: 50ms, 100ms, 200ms, 400ms, 500ms (capped).
fn base_delay_ms(attempt: u32) -> u64 {
    let raw = 50u64.saturating_mul(1u64 << attempt.min(10));
    raw.min(500)
}

/// Runs `op` up to `max_attempts` times, sleeping with ±25% jitter between
/// busy/locked failures. Non-busy errors return immediately on first attempt.
pub async fn with_busy_retry<T, F, Fut>(
    op_name: &'static str,
    ctx: &OpContext,
    max_attempts: u32,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled { op: op_name });
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_busy() && attempt + 1 < max_attempts => {
                let base = base_delay_ms(attempt);
                let jitter_frac = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(-0.25..=0.25)
                };
                let delay_ms = ((base as f64) * (1.0 + jitter_frac)).max(0.0) as u64;
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms,
                    "busy-retry: database locked, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = ctx.cancel_token().cancelled() => {
                        return Err(StoreError::Cancelled { op: op_name });
                    }
                }
                attempt += 1;
            }
            Err(e) if e.is_busy() => {
                return Err(StoreError::Busy {
                    op: op_name,
                    attempts: attempt + 1,
                });
            }
            Err(e) => return Err(e),
        }
    }
}
