//! Ambient per-call context.
//!
//! Rust has no implicit per-task context the way the original daemon's
//! coroutine scheduler did, so every public `Store` operation takes an
//! explicit `&OpContext` instead of reaching for a thread-local.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OpContext {
    pub trace_id: Option<String>,
    pub run_id: Option<String>,
    cancel: CancellationToken,
}

impl OpContext {
    pub fn new() -> Self {
        Self {
            trace_id: None,
            run_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve the trace id to append onto an event row, falling back to the
    /// owning session id when the caller didn't set one (§4.2).
    pub fn trace_id_or(&self, session_id: &str) -> String {
        self.trace_id.clone().unwrap_or_else(|| session_id.to_string())
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}
