use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tp_core::types::{ChatMessage, LogLevel, PrComment, TaskStatus, ToolActivity};

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Cancelled,
    Timeout,
    Failed,
    ForgeAuth,
}

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

/// Everything a task topic can carry. Serialized with an inline `type` tag so
/// SSE consumers can dispatch without a payload wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Log {
        level: LogLevel,
        msg: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Status {
        new: TaskStatus,
    },
    TimeoutWarning {
        msg: String,
        expires_at: DateTime<Utc>,
    },
    AwaitingReview {
        msg: String,
    },
    Complete {
        #[serde(skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Error {
        msg: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
    PrComment {
        comment: PrComment,
    },
    ChatMessage {
        message: ChatMessage,
    },
    ToolActivity {
        activity: ToolActivity,
    },
    /// Marker injected for a subscriber whose queue overflowed; `count`
    /// events were dropped before the next delivered one.
    Dropped {
        count: u64,
    },
}

impl TaskEvent {
    /// Terminal events close every subscription on the topic.
    pub fn is_terminal(&self) -> bool {
        match self {
            TaskEvent::Complete { .. } => true,
            TaskEvent::Error { code, .. } => {
                matches!(code, Some(ErrorCode::Cancelled) | Some(ErrorCode::Timeout))
            }
            _ => false,
        }
    }

    /// Stable event name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Log { .. } => "log",
            TaskEvent::Status { .. } => "status",
            TaskEvent::TimeoutWarning { .. } => "timeout_warning",
            TaskEvent::AwaitingReview { .. } => "awaiting_review",
            TaskEvent::Complete { .. } => "complete",
            TaskEvent::Error { .. } => "error",
            TaskEvent::PrComment { .. } => "pr_comment",
            TaskEvent::ChatMessage { .. } => "chat_message",
            TaskEvent::ToolActivity { .. } => "tool_activity",
            TaskEvent::Dropped { .. } => "dropped",
        }
    }

    pub fn log(level: LogLevel, msg: impl Into<String>) -> Self {
        TaskEvent::Log {
            level,
            msg: msg.into(),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
