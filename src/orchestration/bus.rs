//! Priority message bus for the orchestration agents.
//!
//! The bus simulates communication with specialist roles (policy author,
//! procedure author, orchestrator). Messages carry a priority; `urgent`
//! jumps the queue, and within a priority messages stay FIFO. Delivery
//! routes to a registered handler for the target role, or to a
//! deterministic simulation when no handler is registered, so the
//! coordinator's control flow is identical whether a real agent backend is
//! plugged in or not.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

// ============================================================================
// Messages
// ============================================================================

/// Delivery priority. `Urgent` drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    Urgent,
}

/// One message between orchestration roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub priority: MessagePriority,
    pub session_id: String,
    pub at: DateTime<Utc>,
}

impl AgentMessage {
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
        priority: MessagePriority,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            action: action.into(),
            payload,
            priority,
            session_id: session_id.into(),
            at: Utc::now(),
        }
    }
}

/// Errors from message delivery.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("handler for '{role}' failed: {reason}")]
    Handler {
        role: String,
        reason: String,
        retriable: bool,
    },

    #[error("message to '{role}' dropped after {attempts} attempts")]
    Exhausted { role: String, attempts: u32 },
}

/// Processes messages addressed to one role.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, message: &AgentMessage) -> Result<serde_json::Value, BusError>;
}

// ============================================================================
// Queue internals
// ============================================================================

/// Heap entry ordering: priority first, then FIFO by sequence.
struct QueuedMessage {
    message: AgentMessage,
    seq: u64,
    attempts: u32,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority wins; older sequence wins within a
        // priority.
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ============================================================================
// Agent Bus
// ============================================================================

/// Priority queue with handler routing and bounded per-message retry.
pub struct AgentBus {
    queue: Mutex<BinaryHeap<QueuedMessage>>,
    seq: AtomicU64,
    handlers: DashMap<String, Arc<dyn AgentHandler>>,
    /// Results of processed messages, keyed by message id
    results: DashMap<String, serde_json::Value>,
    max_attempts: u32,
}

impl AgentBus {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            handlers: DashMap::new(),
            results: DashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Registers a handler for a role, replacing any previous one.
    pub fn register_handler(&self, role: impl Into<String>, handler: Arc<dyn AgentHandler>) {
        self.handlers.insert(role.into(), handler);
    }

    /// Enqueues a message for the next drain.
    pub fn publish(&self, message: AgentMessage) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(QueuedMessage {
            message,
            seq,
            attempts: 0,
        });
    }

    /// Delivers a message immediately, retrying up to the attempt bound.
    ///
    /// Used by the coordinator for its sequential authoring conversation;
    /// queued traffic goes through [`AgentBus::drain_once`].
    pub async fn dispatch(&self, message: &AgentMessage) -> Result<serde_json::Value, BusError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.deliver(message).await {
                Ok(result) => {
                    self.results.insert(message.id.clone(), result.clone());
                    return Ok(result);
                }
                Err(BusError::Handler { retriable, .. }) if retriable && attempt < self.max_attempts => {
                    debug!(
                        to = %message.to,
                        attempt,
                        "Handler failed; retrying delivery"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Processes everything currently queued, highest priority first.
    ///
    /// Failed deliveries are re-queued until their attempt bound, then
    /// dropped with a warning. Returns the number processed.
    pub async fn drain_once(&self) -> usize {
        let mut processed = 0;
        loop {
            let Some(mut queued) = self.pop() else {
                break;
            };
            queued.attempts += 1;
            match self.deliver(&queued.message).await {
                Ok(result) => {
                    self.results.insert(queued.message.id.clone(), result);
                    processed += 1;
                }
                Err(e) => {
                    if queued.attempts < self.max_attempts {
                        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
                        queue.push(queued);
                    } else {
                        warn!(
                            to = %queued.message.to,
                            action = %queued.message.action,
                            attempts = queued.attempts,
                            error = %e,
                            "Dropping undeliverable agent message"
                        );
                    }
                    // Stop this drain pass so a failing handler cannot spin
                    // the loop; the re-queued message waits for the next tick.
                    break;
                }
            }
        }
        processed
    }

    /// The recorded result of a processed message, if any.
    #[must_use]
    pub fn result_of(&self, message_id: &str) -> Option<serde_json::Value> {
        self.results.get(message_id).map(|r| r.clone())
    }

    /// Number of queued, undelivered messages.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Runs the periodic drain until `shutdown` is cancelled.
    pub fn spawn_drainer(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    _ = ticker.tick() => {
                        bus.drain_once().await;
                    }
                }
            }
            debug!("Agent bus drainer stopped");
        })
    }

    fn pop(&self) -> Option<QueuedMessage> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    async fn deliver(&self, message: &AgentMessage) -> Result<serde_json::Value, BusError> {
        let handler = self.handlers.get(&message.to).map(|h| Arc::clone(&h));
        match handler {
            Some(handler) => handler.handle(message).await,
            None => Ok(simulate(message)),
        }
    }
}

/// Deterministic no-handler simulation.
///
/// Produces a stable acknowledgment artifact derived only from the message
/// content, so repeated orchestration of the same gap yields identical
/// drafts.
fn simulate(message: &AgentMessage) -> serde_json::Value {
    serde_json::json!({
        "role": message.to,
        "action": message.action,
        "session_id": message.session_id,
        "accepted": true,
        "echo": message.payload,
    })
}

// ============================================================================
// Tests
// ============================================================================
