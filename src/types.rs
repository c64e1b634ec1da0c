//! Shared value types for the store's tables.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    RetryWait,
    Succeeded,
    Failed,
    Canceled,
    DeadLetter,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Claimed => "CLAIMED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::RetryWait => "RETRY_WAIT",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "QUEUED" => TaskStatus::Queued,
            "CLAIMED" => TaskStatus::Claimed,
            "RUNNING" => TaskStatus::Running,
            "RETRY_WAIT" => TaskStatus::RetryWait,
            "SUCCEEDED" => TaskStatus::Succeeded,
            "FAILED" => TaskStatus::Failed,
            "CANCELED" => TaskStatus::Canceled,
            "DEAD_LETTER" => TaskStatus::DeadLetter,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Canceled | TaskStatus::DeadLetter
        )
    }

    pub fn is_leased(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    Chat,
    Tool,
    Subtask,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Chat => "chat",
            TaskType::Tool => "tool",
            TaskType::Subtask => "subtask",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "chat" => TaskType::Chat,
            "tool" => TaskType::Tool,
            "subtask" => TaskType::Subtask,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "system" => MessageRole::System,
            "user" => MessageRole::User,
            "assistant" => MessageRole::Assistant,
            "tool" => MessageRole::Tool,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Active,
    Stopped,
    Draining,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Draining => "draining",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => AgentStatus::Active,
            "stopped" => AgentStatus::Stopped,
            "draining" => AgentStatus::Draining,
            _ => return None,
        })
    }
}

/// Deterministic short reason codes persisted onto `tasks.last_error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    RetryProcessorError,
    DeadLetterPoisonPill,
    DeadLetterMaxAttempts,
    Aborted,
    Timeout,
    Canceled,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::RetryProcessorError => "RETRY_PROCESSOR_ERROR",
            ReasonCode::DeadLetterPoisonPill => "DEAD_LETTER_POISON_PILL",
            ReasonCode::DeadLetterMaxAttempts => "DEAD_LETTER_MAX_ATTEMPTS",
            ReasonCode::Aborted => "ABORTED",
            ReasonCode::Timeout => "TIMEOUT",
            ReasonCode::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FNV-1a 64-bit over raw bytes, used both for error fingerprints (§4.3 step 3)
/// and for the retry-jitter seed (§4.3 step 5).
pub fn fnv64a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Normalizes an error message for fingerprinting: lowercase, trim, truncate
/// to 512 bytes (on a char boundary), then hex-encode its FNV-1a hash.
pub fn error_fingerprint(message: &str) -> String {
    let lower = message.to_lowercase();
    let trimmed = lower.trim();
    let truncated = truncate_to_char_boundary(trimmed, 512);
    format!("{:016x}", fnv64a(truncated.as_bytes()))
}

fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
