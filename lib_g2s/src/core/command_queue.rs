//! # Per-Host Command Queue
//!
//! Two FIFO orderings per host: outbound commands waiting for the send pump
//! and inbound commands waiting for the receive pump. Around them sit the
//! scalar flags that drive the host's connectivity state and the pump gates.
//!
//! ## Core Design Principles:
//!
//! 1.  **One Pump per Direction**: a pump may only start after winning a
//!     compare-and-swap on its direction's flag. Whoever loses assumes the
//!     running pump will pick the new work up.
//!
//! 2.  **Reject, Never Drop**: a command refused by the depth limit or the send
//!     gate is handed back inside an [`EnqueueError`] with its error slot
//!     stamped. The queue itself is untouched by a rejected call.
//!
//! 3.  **Clear Fences the Pump**: `clear` bumps a generation counter. A pump
//!     that observes a new generation stops instead of draining state that
//!     was already discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::core::command::{Command, ErrorCode};

/// A command the queue refused. The command comes back with its error slot
/// set to the matching protocol error.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("outbound queue for host {} is full", .command.host_id)]
    QueueFull { command: Box<Command> },

    #[error("communications with host {} are not online", .command.host_id)]
    NotOnline { command: Box<Command> },
}

impl EnqueueError {
    /// The rejected command.
    pub fn command(&self) -> &Command {
        match self {
            Self::QueueFull { command } | Self::NotOnline { command } => command,
        }
    }

    /// Takes the rejected command back.
    pub fn into_command(self) -> Command {
        match self {
            Self::QueueFull { command } | Self::NotOnline { command } => *command,
        }
    }
}

/// # Queue Statistics
///
/// Point-in-time snapshot of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub host_id: i32,
    pub outbound: usize,
    pub inbound: usize,
    pub sent: u64,
    pub received: u64,
    pub last_sent: Option<DateTime<Utc>>,
    pub last_received: Option<DateTime<Utc>>,
    pub online: bool,
    pub allow_send: bool,
    pub sending: bool,
    pub receiving: bool,
}

#[derive(Default)]
struct Timestamps {
    last_sent: Option<DateTime<Utc>>,
    last_received: Option<DateTime<Utc>>,
    /// Last proof of life: an inbound communications request or the moment
    /// the queue went online.
    last_activity: Option<Instant>,
}

/// # Command Queue
pub struct CommandQueue {
    host_id: i32,
    max_queue_size: usize,
    outbound: Mutex<VecDeque<Command>>,
    inbound: Mutex<VecDeque<Command>>,
    online: AtomicBool,
    allow_send: AtomicBool,
    sending: AtomicBool,
    receiving: AtomicBool,
    generation: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    timestamps: Mutex<Timestamps>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CommandQueue {
    /// Creates an empty queue in the Disabled state.
    pub fn new(host_id: i32, max_queue_size: usize) -> Self {
        Self {
            host_id,
            max_queue_size,
            outbound: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(VecDeque::new()),
            online: AtomicBool::new(false),
            allow_send: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            timestamps: Mutex::new(Timestamps::default()),
        }
    }

    pub fn host_id(&self) -> i32 {
        self.host_id
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Appends a command to the outbound ordering.
    ///
    /// Unless `always_queue` is set the send gate must be open. The depth
    /// limit applies either way.
    ///
    /// # Errors
    /// `EnqueueError::NotOnline` when the gate is closed,
    /// `EnqueueError::QueueFull` at the depth limit.
    pub fn enqueue(&self, mut command: Command, always_queue: bool) -> Result<(), EnqueueError> {
        if !always_queue && !self.can_send() {
            command.set_error(ErrorCode::COMMS_NOT_ONLINE);
            return Err(EnqueueError::NotOnline {
                command: Box::new(command),
            });
        }

        let mut outbound = locked(&self.outbound);
        if outbound.len() >= self.max_queue_size {
            drop(outbound);
            tracing::warn!(
                target: "lib_g2s::queue",
                host_id = self.host_id,
                session_id = command.session_id,
                max = self.max_queue_size,
                "outbound queue full, command rejected"
            );
            command.set_error(ErrorCode::OUTBOUND_QUEUE_FULL);
            return Err(EnqueueError::QueueFull {
                command: Box::new(command),
            });
        }
        outbound.push_back(command);
        Ok(())
    }

    /// Removes and returns the oldest outbound command.
    pub fn dequeue(&self) -> Option<Command> {
        locked(&self.outbound).pop_front()
    }

    /// The oldest outbound command, left in place.
    pub fn peek(&self) -> Option<Command> {
        locked(&self.outbound).front().cloned()
    }

    /// Appends an inbound command. Communications-class requests count as
    /// proof of life for the offline timer and stamp `last_received`.
    pub fn received(&self, command: Command) {
        let alive = command.is_communications_request();
        locked(&self.inbound).push_back(command);
        self.received.fetch_add(1, Ordering::SeqCst);

        if alive {
            let mut timestamps = locked(&self.timestamps);
            timestamps.last_received = Some(Utc::now());
            timestamps.last_activity = Some(Instant::now());
        }
    }

    /// The oldest inbound command, left in place.
    pub fn peek_process(&self) -> Option<Command> {
        locked(&self.inbound).front().cloned()
    }

    /// Commits the oldest inbound command, removing it.
    pub fn process(&self) -> Option<Command> {
        locked(&self.inbound).pop_front()
    }

    /// Drains the outbound ordering (and the inbound one if asked), handing
    /// every drained command to `cleanup`. Returns the number drained.
    pub fn clear(&self, clear_inbound: bool, mut cleanup: impl FnMut(Command)) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut drained: Vec<Command> = locked(&self.outbound).drain(..).collect();
        if clear_inbound {
            drained.extend(locked(&self.inbound).drain(..));
        }

        let count = drained.len();
        for command in drained {
            cleanup(command);
        }
        if count > 0 {
            tracing::debug!(target: "lib_g2s::queue", host_id = self.host_id, count, "queue cleared");
        }
        count
    }

    /// Bumped by every `clear`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Claims the send pump. False if one is already running.
    pub fn try_set_send_flag(&self) -> bool {
        self.sending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn clear_send_flag(&self) {
        self.sending.store(false, Ordering::SeqCst);
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    /// Claims the receive pump. False if one is already running.
    pub fn try_set_receive_flag(&self) -> bool {
        self.receiving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn clear_receive_flag(&self) {
        self.receiving.store(false, Ordering::SeqCst);
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if online && !was {
            locked(&self.timestamps).last_activity = Some(Instant::now());
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_allow_send(&self, allow: bool) {
        self.allow_send.store(allow, Ordering::SeqCst);
    }

    pub fn allow_send(&self) -> bool {
        self.allow_send.load(Ordering::SeqCst)
    }

    /// True when gated sends are accepted.
    pub fn can_send(&self) -> bool {
        self.allow_send() && self.is_online()
    }

    /// Records a transmission.
    pub fn mark_sent(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
        locked(&self.timestamps).last_sent = Some(Utc::now());
    }

    pub fn outbound_len(&self) -> usize {
        locked(&self.outbound).len()
    }

    pub fn inbound_len(&self) -> usize {
        locked(&self.inbound).len()
    }

    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        locked(&self.timestamps).last_sent
    }

    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        locked(&self.timestamps).last_received
    }

    /// Time since the last proof of life, if there ever was one.
    pub fn silent_for(&self) -> Option<Duration> {
        locked(&self.timestamps).last_activity.map(|at| at.elapsed())
    }

    pub fn stats(&self) -> QueueStats {
        let timestamps = locked(&self.timestamps);
        QueueStats {
            host_id: self.host_id,
            outbound: self.outbound_len(),
            inbound: self.inbound_len(),
            sent: self.sent.load(Ordering::SeqCst),
            received: self.received.load(Ordering::SeqCst),
            last_sent: timestamps.last_sent,
            last_received: timestamps.last_received,
            online: self.is_online(),
            allow_send: self.allow_send(),
            sending: self.is_sending(),
            receiving: self.is_receiving(),
        }
    }
}
