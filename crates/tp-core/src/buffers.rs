//! Bounded per-task in-memory buffers.
//!
//! Two buffers back the reconnect story for event-stream subscribers: the
//! agent log ring (what the runner logged) and the chat history ring (chat
//! messages and tool activity). Both drop their oldest entries at capacity,
//! and a task's buffers are released a few minutes after the task reaches a
//! terminal status.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::types::{AgentLogEntry, ChatMessage, ToolActivity};

/// How long a terminal task's buffers stick around for late readers.
const TERMINAL_RETENTION: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// HistoryEvent
// ---------------------------------------------------------------------------

/// A chat-history entry: either a chat message or a tool activity record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    Chat(ChatMessage),
    Tool(ToolActivity),
}

// ---------------------------------------------------------------------------
// Ring
// ---------------------------------------------------------------------------

struct Ring<T> {
    items: VecDeque<T>,
    cap: usize,
    expires_at: Option<Instant>,
}

impl<T> Ring<T> {
    fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(cap.min(64)),
            cap,
            expires_at: None,
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() >= self.cap {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }
}

// ---------------------------------------------------------------------------
// TaskBuffers
// ---------------------------------------------------------------------------

/// Registry of per-task log and chat rings.
pub struct TaskBuffers {
    log_cap: usize,
    chat_cap: usize,
    logs: Mutex<HashMap<Uuid, Ring<AgentLogEntry>>>,
    history: Mutex<HashMap<Uuid, Ring<HistoryEvent>>>,
}

impl TaskBuffers {
    pub fn new(log_cap: usize, chat_cap: usize) -> Self {
        Self {
            log_cap,
            chat_cap,
            logs: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn push_log(&self, task_id: Uuid, entry: AgentLogEntry) {
        let mut logs = self.logs.lock().expect("log buffer lock poisoned");
        logs.entry(task_id)
            .or_insert_with(|| Ring::new(self.log_cap))
            .push(entry);
    }

    pub fn push_chat(&self, task_id: Uuid, msg: ChatMessage) {
        self.push_history(task_id, HistoryEvent::Chat(msg));
    }

    pub fn push_tool(&self, task_id: Uuid, activity: ToolActivity) {
        self.push_history(task_id, HistoryEvent::Tool(activity));
    }

    fn push_history(&self, task_id: Uuid, event: HistoryEvent) {
        let mut history = self.history.lock().expect("history buffer lock poisoned");
        history
            .entry(task_id)
            .or_insert_with(|| Ring::new(self.chat_cap))
            .push(event);
    }

    /// Snapshot of a task's log ring, oldest first.
    pub fn logs(&self, task_id: Uuid) -> Vec<AgentLogEntry> {
        let logs = self.logs.lock().expect("log buffer lock poisoned");
        logs.get(&task_id)
            .map(|r| r.items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a task's chat history, oldest first.
    pub fn history(&self, task_id: Uuid) -> Vec<HistoryEvent> {
        let history = self.history.lock().expect("history buffer lock poisoned");
        history
            .get(&task_id)
            .map(|r| r.items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Arm the retention timer for a task that reached a terminal status.
    pub fn mark_terminal(&self, task_id: Uuid) {
        let deadline = Instant::now() + TERMINAL_RETENTION;
        if let Some(ring) = self
            .logs
            .lock()
            .expect("log buffer lock poisoned")
            .get_mut(&task_id)
        {
            ring.expires_at = Some(deadline);
        }
        if let Some(ring) = self
            .history
            .lock()
            .expect("history buffer lock poisoned")
            .get_mut(&task_id)
        {
            ring.expires_at = Some(deadline);
        }
    }

    /// Drop buffers whose retention window has elapsed. Returns how many
    /// task entries were removed across both maps.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        let mut logs = self.logs.lock().expect("log buffer lock poisoned");
        logs.retain(|_, ring| {
            let keep = ring.expires_at.map(|t| t > now).unwrap_or(true);
            if !keep {
                removed += 1;
            }
            keep
        });
        drop(logs);
        let mut history = self.history.lock().expect("history buffer lock poisoned");
        history.retain(|_, ring| {
            let keep = ring.expires_at.map(|t| t > now).unwrap_or(true);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatRole, LogLevel, ToolStatus};

    #[test]
    fn log_ring_drops_oldest_at_cap() {
        let buffers = TaskBuffers::new(3, 3);
        let id = Uuid::new_v4();
        for i in 0..5 {
            buffers.push_log(id, AgentLogEntry::new(LogLevel::Info, format!("m{i}")));
        }
        let logs = buffers.logs(id);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "m2");
        assert_eq!(logs[2].message, "m4");
    }

    #[test]
    fn chat_and_tool_share_one_ring() {
        let buffers = TaskBuffers::new(10, 2);
        let id = Uuid::new_v4();
        buffers.push_chat(id, ChatMessage::new(ChatRole::User, "hello"));
        buffers.push_tool(id, ToolActivity::new("read_file", "src/main.rs", ToolStatus::Running));
        buffers.push_chat(id, ChatMessage::new(ChatRole::Assistant, "done"));
        let history = buffers.history(id);
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], HistoryEvent::Tool(_)));
        assert!(matches!(history[1], HistoryEvent::Chat(_)));
    }

    #[test]
    fn unknown_task_yields_empty_snapshots() {
        let buffers = TaskBuffers::new(10, 10);
        assert!(buffers.logs(Uuid::new_v4()).is_empty());
        assert!(buffers.history(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn sweep_removes_expired_buffers() {
        let buffers = TaskBuffers::new(10, 10);
        let done = Uuid::new_v4();
        let live = Uuid::new_v4();
        buffers.push_log(done, AgentLogEntry::new(LogLevel::Info, "a"));
        buffers.push_log(live, AgentLogEntry::new(LogLevel::Info, "b"));
        buffers.mark_terminal(done);

        // Nothing expires before the retention window elapses.
        assert_eq!(buffers.sweep(), 0);
        assert_eq!(buffers.logs(done).len(), 1);

        // Past the window the terminal task is gone, the live one stays.
        let removed = buffers.sweep_at(Instant::now() + TERMINAL_RETENTION + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert!(buffers.logs(done).is_empty());
        assert_eq!(buffers.logs(live).len(), 1);
    }
}
