//! Per-task event topics with bounded, drop-oldest subscriber queues.
//!
//! Each task ID maps to a topic; any number of subscribers may attach and
//! detach at any time. A subscriber only sees events published after it
//! attached (historical replay is the caller's job, via the log and chat
//! buffers). A slow subscriber never blocks the producer: its queue is
//! bounded, and on overflow the oldest queued event is discarded and a
//! `dropped` marker is delivered before the next event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::TaskEvent;

const DEFAULT_QUEUE_CAP: usize = 256;

// ---------------------------------------------------------------------------
// Subscriber internals
// ---------------------------------------------------------------------------

struct QueueState {
    items: VecDeque<TaskEvent>,
    dropped: u64,
    closed: bool,
}

struct SubscriberInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberInner {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn close(&self) {
        self.state.lock().expect("subscriber lock poisoned").closed = true;
        self.notify.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// The receiving end of one topic subscription. Dropping it detaches the
/// subscriber.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    /// Await the next event. Returns `None` once the topic is closed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            {
                let mut state = self.inner.state.lock().expect("subscriber lock poisoned");
                if state.dropped > 0 {
                    let count = state.dropped;
                    state.dropped = 0;
                    return Some(TaskEvent::Dropped { count });
                }
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`].
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        let mut state = self.inner.state.lock().expect("subscriber lock poisoned");
        if state.dropped > 0 {
            let count = state.dropped;
            state.dropped = 0;
            return Some(TaskEvent::Dropped { count });
        }
        state.items.pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.close();
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Topic {
    subscribers: Mutex<Vec<Arc<SubscriberInner>>>,
}

/// Per-task topic fan-out. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<DashMap<Uuid, Topic>>,
    queue_cap: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_cap(DEFAULT_QUEUE_CAP)
    }

    pub fn with_queue_cap(queue_cap: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            queue_cap: queue_cap.max(1),
        }
    }

    /// Attach a new subscriber to a task's topic. The subscriber receives
    /// only events published after this call.
    pub fn subscribe(&self, task_id: Uuid) -> Subscription {
        let inner = Arc::new(SubscriberInner::new());
        let topic = self.topics.entry(task_id).or_insert_with(|| Topic {
            subscribers: Mutex::new(Vec::new()),
        });
        topic
            .subscribers
            .lock()
            .expect("topic lock poisoned")
            .push(Arc::clone(&inner));
        Subscription { inner }
    }

    /// Publish an event to every live subscriber of the topic, in emission
    /// order. Terminal events close the topic afterwards.
    pub fn publish(&self, task_id: Uuid, event: TaskEvent) {
        let terminal = event.is_terminal();
        if let Some(topic) = self.topics.get(&task_id) {
            let mut subscribers = topic.subscribers.lock().expect("topic lock poisoned");
            subscribers.retain(|sub| {
                let mut state = sub.state.lock().expect("subscriber lock poisoned");
                if state.closed {
                    return false;
                }
                if state.items.len() >= self.queue_cap {
                    state.items.pop_front();
                    state.dropped += 1;
                    debug!(task_id = %task_id, "subscriber queue overflow, dropped oldest event");
                }
                state.items.push_back(event.clone());
                drop(state);
                sub.notify.notify_one();
                true
            });
        }
        if terminal {
            self.close_topic(task_id);
        }
    }

    /// Close a topic: all subscriptions end once their queues drain. Used on
    /// terminal events and at shutdown.
    pub fn close_topic(&self, task_id: Uuid) {
        if let Some((_, topic)) = self.topics.remove(&task_id) {
            let subscribers = topic.subscribers.lock().expect("topic lock poisoned");
            for sub in subscribers.iter() {
                sub.close();
            }
        }
    }

    /// Close every topic.
    pub fn close_all(&self) {
        let ids: Vec<Uuid> = self.topics.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close_topic(id);
        }
    }

    /// Live subscriber count for a topic.
    pub fn subscriber_count(&self, task_id: Uuid) -> usize {
        self.topics
            .get(&task_id)
            .map(|t| {
                t.subscribers
                    .lock()
                    .expect("topic lock poisoned")
                    .iter()
                    .filter(|s| !s.state.lock().expect("subscriber lock poisoned").closed)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
