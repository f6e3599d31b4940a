//! Job events and the fan-out bus that delivers them.
//!
//! Every job reports through four phases: `start` with its arguments, zero or
//! more `progress` results, then exactly one terminal `success` or `error`.
//! The bus keeps one unbounded queue per subscriber so publishing never
//! waits on a slow consumer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// The phase-specific part of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EventPhase {
    Start { payload: serde_json::Value },
    Progress { payload: serde_json::Value },
    Success,
    Error { kind: String, reason: String },
}

/// One job notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The job type name, e.g. `response`.
    pub topic: String,
    pub job_id: String,
    #[serde(flatten)]
    pub phase: EventPhase,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, job_id: impl Into<String>, phase: EventPhase) -> Self {
        Self {
            topic: topic.into(),
            job_id: job_id.into(),
            phase,
            timestamp: Utc::now(),
        }
    }

    pub fn start(topic: &str, job_id: &str, payload: serde_json::Value) -> Self {
        Self::new(topic, job_id, EventPhase::Start { payload })
    }

    pub fn progress(topic: &str, job_id: &str, payload: serde_json::Value) -> Self {
        Self::new(topic, job_id, EventPhase::Progress { payload })
    }

    pub fn success(topic: &str, job_id: &str) -> Self {
        Self::new(topic, job_id, EventPhase::Success)
    }

    pub fn error(topic: &str, job_id: &str, kind: &str, reason: impl Into<String>) -> Self {
        Self::new(
            topic,
            job_id,
            EventPhase::Error {
                kind: kind.to_string(),
                reason: reason.into(),
            },
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, EventPhase::Success | EventPhase::Error { .. })
    }

    /// The payload as websocket-style clients expect it.
    ///
    /// `start` → `{job_id, start}`; `progress` → `{job_id, finished: false,
    /// result}`; `success` → `{job_id, finished: true, success: true}`;
    /// `error` → `{job_id, finished: true, success: false, result: {type, reason}}`.
    pub fn wire_payload(&self) -> serde_json::Value {
        match &self.phase {
            EventPhase::Start { payload } => serde_json::json!({
                "job_id": self.job_id,
                "start": payload,
            }),
            EventPhase::Progress { payload } => serde_json::json!({
                "job_id": self.job_id,
                "finished": false,
                "result": payload,
            }),
            EventPhase::Success => serde_json::json!({
                "job_id": self.job_id,
                "finished": true,
                "success": true,
            }),
            EventPhase::Error { kind, reason } => serde_json::json!({
                "job_id": self.job_id,
                "finished": true,
                "success": false,
                "result": { "type": kind, "reason": reason },
            }),
        }
    }
}

/// Consumer side of a subscription. Each handler gets its own consume loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>);
}

/// Identifies one subscription on an [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    handler: Option<Arc<dyn EventHandler>>,
    sender: mpsc::UnboundedSender<Arc<Event>>,
    task: Option<JoinHandle<()>>,
}

/// Publish/subscribe fan-out of job events.
///
/// Queues are unbounded: a subscriber that never drains grows memory without
/// limit. A subscriber whose receiving end is gone is pruned on the next
/// broadcast.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Attach a handler. Subscribing the same handler twice returns the
    /// existing subscription. Must be called inside a tokio runtime.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let mut subs = self.lock();
        if let Some(existing) = subs
            .iter()
            .find(|s| s.handler.as_ref().is_some_and(|h| same_handler(h, &handler)))
        {
            return existing.id;
        }

        let id = self.allocate_id();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<Event>>();
        let consumer = Arc::clone(&handler);
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                consumer.handle(event).await;
            }
        });
        subs.push(Subscriber {
            id,
            handler: Some(handler),
            sender,
            task: Some(task),
        });
        debug!(subscription = id.0, "Event handler subscribed");
        id
    }

    /// Attach a raw receiver instead of a handler.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<Event>>) {
        let id = self.allocate_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().push(Subscriber {
            id,
            handler: None,
            sender,
            task: None,
        });
        (id, receiver)
    }

    /// Detach a handler. Unknown handlers are ignored. Events already
    /// queued for it are still delivered.
    pub fn unsubscribe(&self, handler: &Arc<dyn EventHandler>) {
        self.lock()
            .retain(|s| !s.handler.as_ref().is_some_and(|h| same_handler(h, handler)));
    }

    /// Detach by subscription id. Unknown ids are ignored.
    pub fn unsubscribe_id(&self, id: SubscriptionId) {
        self.lock().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Enqueue the event on every current subscriber. Never blocks.
    pub fn broadcast(&self, event: Event) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let rendered = event.wire_payload().to_string();
            let preview: String = rendered.chars().take(500).collect();
            debug!(job_id = %event.job_id, topic = %event.topic, payload = %preview, "Broadcasting event");
        }
        let event = Arc::new(event);
        self.lock().retain(|s| match s.sender.send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(_) => {
                debug!(subscription = s.id.0, "Pruning closed subscriber");
                false
            }
        });
    }

    /// Drain a lazy sequence of events, broadcasting each as it arrives.
    pub async fn broadcast_stream<S>(&self, stream: S)
    where
        S: Stream<Item = Event> + Send,
    {
        let mut stream = std::pin::pin!(stream);
        while let Some(event) = stream.next().await {
            self.broadcast(event);
        }
    }

    /// Detach everything and stop handler loops.
    pub fn close(&self) {
        for sub in self.lock().drain(..) {
            if let Some(task) = sub.task {
                task.abort();
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
