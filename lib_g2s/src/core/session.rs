//! # Request Sessions
//!
//! A [`Session`] tracks one outbound request until it is resolved: a matching
//! response arrives, the retry budget runs out, the caller cancels, or the
//! host is torn down. The [`SessionManager`] owns every pending session and
//! runs one timer task per session.
//!
//! ## Core Design Principles:
//!
//! 1.  **Single Resolution**: a session leaves `Pending` exactly once. Every
//!     path (response, timeout, forced completion, cancellation) goes through
//!     the same guarded transition, so the completion callback fires at most
//!     once and later completions are no-ops.
//!
//! 2.  **Retry on Timeout**: when the timer fires and retries remain, the
//!     counter is decremented and the original command is handed back to the
//!     owning queue, bypassing its send gate. With no retries left the session
//!     resolves as `TimedOut`.
//!
//! 3.  **Weak Back-reference**: a session only holds a `Weak` handle to the
//!     queue that re-sends it, so a dropped host never stays alive through its
//!     pending sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::command::{Command, CommandError};

/// Outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Awaiting a response.
    Pending,
    /// A matching response arrived.
    Completed,
    /// The retry budget ran out without a response.
    TimedOut,
    /// The caller's cancellation token fired.
    Cancelled,
    /// Torn down with its host or queue.
    Aborted,
    /// The transport failed while the session was pending.
    CommsLost,
    /// The remote rejected the request with an error code.
    RequestError,
}

impl SessionStatus {
    /// True for every status except `Pending`.
    pub fn is_terminal(self) -> bool {
        self != SessionStatus::Pending
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Completion callback. Runs on whichever task resolves the session and must
/// not block.
pub type SessionCallback = Box<dyn FnOnce(&Session) + Send + 'static>;

/// The queue a timed-out session re-sends through.
pub trait SessionQueue: Send + Sync {
    /// Queues the command for another transmission, bypassing the send gate.
    fn requeue(&self, command: Command);
}

struct Resolution {
    status: SessionStatus,
    response: Option<Command>,
    error: Option<CommandError>,
    callback: Option<SessionCallback>,
}

struct SessionInner {
    id: i64,
    command: Command,
    timeout: Duration,
    retries: AtomicU32,
    resolution: Mutex<Resolution>,
    done: watch::Sender<SessionStatus>,
    timer: CancellationToken,
}

/// # Session
///
/// Cheap, cloneable handle to one in-flight request.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("host_id", &self.inner.command.host_id)
            .field("status", &self.status())
            .field("retries_remaining", &self.retries_remaining())
            .finish()
    }
}

impl Session {
    fn new(
        id: i64,
        command: Command,
        callback: Option<SessionCallback>,
        retry_count: u32,
        timeout: Duration,
    ) -> Self {
        let (done, _) = watch::channel(SessionStatus::Pending);
        Self {
            inner: Arc::new(SessionInner {
                id,
                command,
                timeout,
                retries: AtomicU32::new(retry_count),
                resolution: Mutex::new(Resolution {
                    status: SessionStatus::Pending,
                    response: None,
                    error: None,
                    callback,
                }),
                done,
                timer: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Resolution> {
        self.inner.resolution.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Host the request was sent to.
    pub fn host_id(&self) -> i32 {
        self.inner.command.host_id
    }

    /// The originating request.
    pub fn command(&self) -> &Command {
        &self.inner.command
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Retries still available.
    pub fn retries_remaining(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }

    /// The response that completed the session, if any.
    pub fn response(&self) -> Option<Command> {
        self.lock().response.clone()
    }

    /// The error reported by the remote, if the session ended with one.
    pub fn error(&self) -> Option<CommandError> {
        self.lock().error.clone()
    }

    /// Waits for the session to resolve. If `cancel` fires first the session
    /// resolves as `Cancelled`. Already transmitted commands are not recalled.
    pub async fn wait(&self, cancel: &CancellationToken) -> SessionStatus {
        let mut rx = self.inner.done.subscribe();
        tokio::select! {
            resolved = rx.wait_for(|status| status.is_terminal()) => match resolved {
                Ok(status) => *status,
                Err(_) => self.status(),
            },
            _ = cancel.cancelled() => {
                self.resolve(SessionStatus::Cancelled, None, None);
                self.status()
            }
        }
    }

    /// Waits for the session to resolve, without a cancellation path.
    pub async fn completed(&self) -> SessionStatus {
        self.wait(&CancellationToken::new()).await
    }

    /// Takes one retry. Returns false when none are left.
    fn take_retry(&self) -> bool {
        self.inner
            .retries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// The single Pending → terminal transition. Returns false if the session
    /// was already resolved.
    fn resolve(
        &self,
        status: SessionStatus,
        response: Option<Command>,
        error: Option<CommandError>,
    ) -> bool {
        let callback = {
            let mut resolution = self.lock();
            if resolution.status.is_terminal() {
                return false;
            }
            resolution.status = status;
            resolution.response = response;
            resolution.error = error;
            resolution.callback.take()
        };

        self.inner.timer.cancel();
        self.inner.done.send_replace(status);
        tracing::debug!(
            target: "lib_g2s::session",
            host_id = self.host_id(),
            session_id = self.id(),
            %status,
            "session resolved"
        );

        if let Some(callback) = callback {
            callback(self);
        }
        true
    }
}

/// # Session Manager
///
/// Shared by every host queue of an EGM. Session ids are unique across hosts.
pub struct SessionManager {
    sessions: Mutex<HashMap<i64, Session>>,
    next_id: AtomicI64,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the next session id.
    pub fn next_session_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a pending session and arms its timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create(
        self: &Arc<Self>,
        queue: Weak<dyn SessionQueue>,
        session_id: i64,
        command: Command,
        callback: Option<SessionCallback>,
        retry_count: u32,
        timeout: Duration,
    ) -> Session {
        let session = Session::new(session_id, command, callback, retry_count, timeout);
        if let Some(replaced) = self.lock().insert(session_id, session.clone()) {
            tracing::warn!(
                target: "lib_g2s::session",
                session_id,
                "session id reused, aborting the previous session"
            );
            replaced.resolve(SessionStatus::Aborted, None, None);
        }

        tokio::spawn(run_timer(Arc::downgrade(self), queue, session.clone()));
        session
    }

    pub fn get_by_id(&self, session_id: i64) -> Option<Session> {
        self.lock().get(&session_id).cloned()
    }

    /// Resolves the matching pending session as `Completed` with the response
    /// attached. Returns false if no pending session for that host matched.
    pub fn add_response(&self, response: Command) -> bool {
        let session = {
            let mut sessions = self.lock();
            let owned = sessions
                .get(&response.session_id)
                .is_some_and(|s| s.host_id() == response.host_id);
            if owned {
                sessions.remove(&response.session_id)
            } else {
                None
            }
        };

        match session {
            Some(session) => session.resolve(SessionStatus::Completed, Some(response), None),
            None => {
                tracing::debug!(
                    target: "lib_g2s::session",
                    host_id = response.host_id,
                    session_id = response.session_id,
                    "response does not match a pending session"
                );
                false
            }
        }
    }

    /// Force-completes a session. Idempotent: returns false if the session is
    /// unknown or already resolved.
    pub fn complete(&self, session_id: i64, status: SessionStatus) -> bool {
        self.finish(session_id, status, None)
    }

    /// Force-completes a session, recording the remote's error.
    pub fn complete_with_error(&self, session_id: i64, status: SessionStatus, error: CommandError) -> bool {
        self.finish(session_id, status, Some(error))
    }

    fn finish(&self, session_id: i64, status: SessionStatus, error: Option<CommandError>) -> bool {
        match self.lock().remove(&session_id) {
            Some(session) => session.resolve(status, None, error),
            None => false,
        }
    }

    /// Completes every pending session of a host. Returns how many resolved.
    pub fn complete_all(&self, host_id: i32, status: SessionStatus) -> usize {
        let drained: Vec<Session> = {
            let mut sessions = self.lock();
            let ids: Vec<i64> = sessions
                .values()
                .filter(|s| s.host_id() == host_id)
                .map(Session::id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut resolved = 0;
        for session in &drained {
            if session.resolve(status, None, None) {
                resolved += 1;
            }
        }
        if resolved > 0 {
            tracing::info!(target: "lib_g2s::session", host_id, %status, resolved, "host sessions completed");
        }
        resolved
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tracked sessions for one host.
    pub fn pending_for(&self, host_id: i32) -> usize {
        self.lock().values().filter(|s| s.host_id() == host_id).count()
    }

    fn forget(&self, session: &Session) {
        let mut sessions = self.lock();
        if sessions
            .get(&session.id())
            .is_some_and(|tracked| Arc::ptr_eq(&tracked.inner, &session.inner))
        {
            sessions.remove(&session.id());
        }
    }
}

async fn run_timer(manager: Weak<SessionManager>, queue: Weak<dyn SessionQueue>, session: Session) {
    let token = session.inner.timer.clone();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(session.timeout()) => {
                if session.is_completed() {
                    break;
                }
                if !session.take_retry() {
                    tracing::warn!(
                        target: "lib_g2s::session",
                        host_id = session.host_id(),
                        session_id = session.id(),
                        "session timed out, no retries left"
                    );
                    session.resolve(SessionStatus::TimedOut, None, None);
                    break;
                }
                let Some(queue) = queue.upgrade() else {
                    session.resolve(SessionStatus::Aborted, None, None);
                    break;
                };
                tracing::debug!(
                    target: "lib_g2s::session",
                    host_id = session.host_id(),
                    session_id = session.id(),
                    retries_remaining = session.retries_remaining(),
                    "session timed out, retrying"
                );
                queue.requeue(session.command().clone());
            }
        }
    }

    if let Some(manager) = manager.upgrade() {
        manager.forget(&session);
    }
}
