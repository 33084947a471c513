//! # Command Monitor
//!
//! Publishes a [`CommandEvent`] for every command a host queue transmits or
//! receives. Observers subscribe for an unbounded channel of events; the
//! monitor keeps a bounded ring buffer of the most recent events and replays
//! it into every new subscription so late subscribers still see recent
//! traffic.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: each event is wrapped in an `Arc` once and every
//!     subscriber receives a clone of the pointer.
//! 2.  **Gapless Replay**: history and subscriber list sit behind one lock, so
//!     a new subscriber receives the history followed by every later event
//!     with no gap and no duplicate.
//! 3.  **Self-Cleaning**: a subscriber whose receiver was dropped is removed
//!     the next time an event is published.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::core::command::{Command, ErrorCode, SessionType};

/// Which way a command crossed the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Handed to the send endpoint.
    Sent,
    /// Arrived from the receive endpoint.
    Received,
}

/// # Command Event
///
/// Summary of one command crossing the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvent {
    pub direction: Direction,
    pub host_id: i32,
    pub class_name: String,
    pub command_type: String,
    pub session_id: i64,
    pub command_id: i64,
    pub session_type: SessionType,
    /// Error code carried by the command, if any.
    pub error_code: Option<ErrorCode>,
    /// When the event was recorded.
    pub ts: DateTime<Utc>,
}

impl CommandEvent {
    /// Summarises a command.
    pub fn of(direction: Direction, command: &Command) -> Self {
        Self {
            direction,
            host_id: command.host_id,
            class_name: command.class_name().to_string(),
            command_type: command.command_type().to_string(),
            session_id: command.session_id,
            command_id: command.command_id,
            session_type: command.session_type,
            error_code: command.error.as_ref().map(|e| e.code.clone()),
            ts: Utc::now(),
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Arc<CommandEvent>>,
}

struct MonitorState {
    history: VecDeque<Arc<CommandEvent>>,
    subscribers: Vec<Subscriber>,
}

/// A live subscription: its id (for [`CommandMonitor::unsubscribe`]) and the
/// receiving half of its channel.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<Arc<CommandEvent>>,
}

/// # Command Monitor
pub struct CommandMonitor {
    depth: usize,
    next_id: AtomicU64,
    state: Mutex<MonitorState>,
}

impl CommandMonitor {
    /// Creates a monitor that retains the last `depth` events.
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            next_id: AtomicU64::new(1),
            state: Mutex::new(MonitorState {
                history: VecDeque::with_capacity(depth),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Subscribes to events. The returned channel already holds the retained
    /// history, oldest first.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        for event in &state.history {
            // The receiver is still in our hands, so this cannot fail.
            let _ = tx.send(Arc::clone(event));
        }
        state.subscribers.push(Subscriber { id, sender: tx });
        tracing::debug!(target: "lib_g2s::monitor", subscriber = id, "monitor subscriber added");

        Subscription { id, events: rx }
    }

    /// Removes a subscriber.
    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscribers.retain(|s| s.id != id);
    }

    /// Records an event and forwards it to every live subscriber.
    pub fn publish(&self, event: CommandEvent) {
        let event = Arc::new(event);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if self.depth > 0 {
            if state.history.len() == self.depth {
                state.history.pop_front();
            }
            state.history.push_back(Arc::clone(&event));
        }

        state.subscribers.retain(|subscriber| match subscriber.sender.send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(
                    target: "lib_g2s::monitor",
                    subscriber = subscriber.id,
                    "monitor subscriber dropped"
                );
                false
            }
        });
    }

    /// Records a command crossing the transport.
    pub fn record(&self, direction: Direction, command: &Command) {
        self.publish(CommandEvent::of(direction, command));
    }

    /// The retained history, oldest first.
    pub fn history(&self) -> Vec<Arc<CommandEvent>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.history.iter().cloned().collect()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).subscribers.len()
    }
}
