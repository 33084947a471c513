//! # Host Queue
//!
//! Everything that happens on the wire for one host goes through its
//! `HostQueue`. It owns the host's [`CommandQueue`], shares the EGM-wide
//! [`SessionManager`] and [`CommandDispatcher`], and runs the two pumps:
//!
//! - the **send pump** drains the outbound ordering into the host's send
//!   endpoint, stamping a fresh command id on every transmission and reacting
//!   to the transport's verdict;
//! - the **receive pump** drains the inbound ordering, resolving sessions for
//!   responses and dispatching everything else, queueing whatever responses
//!   the handlers produced.
//!
//! ## Connectivity
//!
//! The host's state is read off the queue flags:
//!
//! | State    | allow send | online |
//! |----------|------------|--------|
//! | Disabled | false      | false  |
//! | Offline  | true       | false  |
//! | Online   | any        | true   |
//!
//! `enable_send`, `disable_send` and `set_online` move between them, and a
//! dead transport drops the host back to Disabled with every pending session
//! resolved as `CommsLost`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::configs::protocol::ProtocolSettings;
use crate::core::command::{ClassCommand, Command, CommandError, ErrorCode, SessionType};
use crate::core::command_queue::{CommandQueue, EnqueueError, QueueStats};
use crate::core::dispatcher::CommandDispatcher;
use crate::core::monitor::{CommandMonitor, Direction};
use crate::core::session::{Session, SessionCallback, SessionManager, SessionQueue, SessionStatus};
use crate::core::transport::{EndpointProvider, InboundSink, SendEndpoint, TransportResponse};

/// Connectivity state of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    /// Sending is not allowed.
    Disabled,
    /// Sending is allowed, the online handshake has not completed.
    Offline,
    /// Normal traffic flows.
    Online,
}

/// Per-request overrides for [`HostQueue::send_request`]. Unset values fall
/// back to the queue's [`ProtocolSettings`].
#[derive(Default)]
pub struct RequestOptions {
    pub callback: Option<SessionCallback>,
    pub retry_count: Option<u32>,
    pub timeout: Option<Duration>,
    /// Queue even when the send gate is closed.
    pub always_send: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(mut self, callback: impl FnOnce(&Session) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn always_send(mut self) -> Self {
        self.always_send = true;
        self
    }
}

enum PumpExit {
    /// The outbound ordering was emptied, or a clear fenced the pump.
    Drained,
    /// The drain stopped on a transport verdict or a dropped held command.
    /// Work queued meanwhile is picked up again while the send gate is open.
    Halted,
    /// No endpoint to send through.
    Stopped,
}

/// # Host Queue
pub struct HostQueue {
    host_id: i32,
    settings: ProtocolSettings,
    queue: CommandQueue,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<CommandDispatcher>,
    endpoints: Arc<dyn EndpointProvider>,
    monitor: Option<Arc<CommandMonitor>>,
    next_command_id: AtomicI64,
    this: Weak<HostQueue>,
}

impl HostQueue {
    /// Creates the queue for one host in the Disabled state.
    pub fn new(
        host_id: i32,
        settings: ProtocolSettings,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<CommandDispatcher>,
        endpoints: Arc<dyn EndpointProvider>,
        monitor: Option<Arc<CommandMonitor>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            host_id,
            queue: CommandQueue::new(host_id, settings.max_queue_size),
            settings,
            sessions,
            dispatcher,
            endpoints,
            monitor,
            next_command_id: AtomicI64::new(1),
            this: this.clone(),
        })
    }

    pub fn host_id(&self) -> i32 {
        self.host_id
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// The underlying command queue.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn state(&self) -> HostState {
        if self.queue.is_online() {
            HostState::Online
        } else if self.queue.allow_send() {
            HostState::Offline
        } else {
            HostState::Disabled
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    fn command(&self, session_type: SessionType, class: ClassCommand, time_to_live: Duration) -> Command {
        Command::new(
            self.host_id,
            self.settings.egm_id.clone(),
            self.sessions.next_session_id(),
            session_type,
            class,
        )
        .with_time_to_live(time_to_live)
    }

    /// Fire-and-forget. Queued regardless of the send gate.
    ///
    /// # Errors
    /// `EnqueueError::QueueFull` at the depth limit.
    pub fn send_notification(&self, class: ClassCommand, time_to_live: Option<Duration>) -> Result<(), EnqueueError> {
        let ttl = time_to_live.unwrap_or(self.settings.time_to_live);
        self.queue_command(self.command(SessionType::Notification, class, ttl), true)
    }

    /// Queues a request and returns its session immediately.
    ///
    /// A request the queue refuses resolves at once as `RequestError`, with
    /// the refusal's error code on the session.
    pub fn send_request(&self, class: ClassCommand, options: RequestOptions) -> Session {
        let retry_count = options.retry_count.unwrap_or(self.settings.retry_count);
        let timeout = options.timeout.unwrap_or(self.settings.session_timeout);
        let command = self.command(SessionType::Request, class, self.settings.time_to_live);
        let session_id = command.session_id;

        let requeue: Weak<dyn SessionQueue> = self.this.clone();
        let session = self.sessions.create(
            requeue,
            session_id,
            command.clone(),
            options.callback,
            retry_count,
            timeout,
        );

        if let Err(e) = self.queue_command(command, options.always_send) {
            let error = e
                .into_command()
                .error
                .unwrap_or_else(|| CommandError::from_code(ErrorCode::UNEXPECTED_ERROR));
            self.sessions
                .complete_with_error(session_id, SessionStatus::RequestError, error);
        }
        session
    }

    /// Queues the responses owed for a dispatched inbound command, in the
    /// order the handler produced them. An errored command is answered with
    /// its own class element carrying the error. Returns how many responses
    /// were queued.
    pub fn send_response(&self, inbound: &Command) -> usize {
        let responses: Vec<Command> = if inbound.is_error() {
            let mut response = Command::response_to(inbound, inbound.class.clone());
            response.error = inbound.error.clone();
            vec![response]
        } else {
            inbound
                .responses
                .iter()
                .map(|fragment| Command::response_to(inbound, fragment.clone()))
                .collect()
        };

        let mut queued = 0;
        for response in responses {
            match self.queue_command(response, true) {
                Ok(()) => queued += 1,
                Err(e) => tracing::warn!(
                    target: "lib_g2s::host_queue",
                    host_id = self.host_id,
                    session_id = inbound.session_id,
                    error = %e,
                    "response dropped"
                ),
            }
        }
        queued
    }

    /// Enqueues a command and makes sure the send pump is running.
    ///
    /// # Errors
    /// Whatever [`CommandQueue::enqueue`] refused.
    pub fn queue_command(&self, command: Command, always_queue: bool) -> Result<(), EnqueueError> {
        self.queue.enqueue(command, always_queue)?;
        self.start_send_pump();
        Ok(())
    }

    /// Drains both orderings, aborting the sessions of drained requests.
    pub fn clear(&self, clear_inbound: bool) -> usize {
        let sessions = &self.sessions;
        self.queue.clear(clear_inbound, |command| {
            if command.session_type == SessionType::Request {
                sessions.complete(command.session_id, SessionStatus::Aborted);
            }
        })
    }

    /// Closes the send gate.
    pub fn disable_send(&self) {
        self.queue.set_allow_send(false);
        tracing::info!(target: "lib_g2s::host_queue", host_id = self.host_id, "send disabled");
    }

    /// Opens the send gate, optionally kicking the send pump.
    pub fn enable_send(&self, start_pump: bool) {
        self.queue.set_allow_send(true);
        tracing::info!(target: "lib_g2s::host_queue", host_id = self.host_id, "send enabled");
        if start_pump {
            self.start_send_pump();
        }
    }

    /// Marks the host online or offline. Going online kicks the send pump.
    pub fn set_online(&self, online: bool) {
        if self.queue.is_online() != online {
            tracing::info!(target: "lib_g2s::host_queue", host_id = self.host_id, online, "host online state changed");
        }
        self.queue.set_online(online);
        if online {
            self.start_send_pump();
        }
    }

    /// Tears the queue down: closes the gate, drops queued traffic and
    /// aborts every pending session of the host.
    pub fn shutdown(&self) {
        self.queue.set_allow_send(false);
        self.queue.set_online(false);
        self.clear(true);
        self.sessions.complete_all(self.host_id, SessionStatus::Aborted);
    }

    fn start_send_pump(&self) {
        if !self.queue.try_set_send_flag() {
            return;
        }
        match self.this.upgrade() {
            Some(this) => {
                tokio::spawn(async move { this.handle_send().await });
            }
            None => self.queue.clear_send_flag(),
        }
    }

    fn start_receive_pump(&self) {
        if !self.queue.try_set_receive_flag() {
            return;
        }
        match self.this.upgrade() {
            Some(this) => {
                tokio::spawn(async move { this.handle_receive().await });
            }
            None => self.queue.clear_receive_flag(),
        }
    }

    async fn handle_send(&self) {
        loop {
            let exit = self.drain_outbound().await;
            self.queue.clear_send_flag();

            // Work enqueued after the last dequeue (session callbacks
            // included) found the flag still set.
            let resume = match exit {
                PumpExit::Drained => true,
                PumpExit::Halted => self.queue.allow_send(),
                PumpExit::Stopped => false,
            };
            if !resume || self.queue.outbound_len() == 0 || !self.queue.try_set_send_flag() {
                break;
            }
        }
    }

    async fn drain_outbound(&self) -> PumpExit {
        let Some(endpoint) = self.endpoints.endpoint(self.host_id) else {
            tracing::warn!(
                target: "lib_g2s::host_queue",
                host_id = self.host_id,
                pending = self.queue.outbound_len(),
                "no send endpoint for host, send pump stopped"
            );
            return PumpExit::Stopped;
        };
        let generation = self.queue.generation();

        while let Some(mut command) = self.queue.dequeue() {
            loop {
                let Some(response) = self.transmit(endpoint.as_ref(), &mut command).await else {
                    self.comms_lost();
                    return PumpExit::Halted;
                };

                if response.error.code.is(ErrorCode::INBOUND_QUEUE_FULL) {
                    tracing::warn!(
                        target: "lib_g2s::host_queue",
                        host_id = self.host_id,
                        session_id = command.session_id,
                        wait_ms = self.settings.session_timeout.as_millis() as u64,
                        "host inbound queue full, holding the send pump"
                    );
                    let allowed = self.queue.allow_send();
                    self.hold_for_recovery().await;
                    if self.queue.generation() != generation || (allowed && !self.queue.allow_send()) {
                        self.drop_held(&command);
                        return PumpExit::Halted;
                    }
                    continue;
                }

                if !self.on_send_result(&command, response) {
                    return PumpExit::Halted;
                }
                break;
            }

            if self.queue.generation() != generation {
                return PumpExit::Drained;
            }
        }
        PumpExit::Drained
    }

    async fn transmit(&self, endpoint: &dyn SendEndpoint, command: &mut Command) -> Option<TransportResponse> {
        command.command_id = self.next_command_id.fetch_add(1, Ordering::SeqCst);
        self.queue.mark_sent();
        if let Some(monitor) = &self.monitor {
            monitor.record(Direction::Sent, command);
        }
        tracing::trace!(
            target: "lib_g2s::host_queue",
            host_id = self.host_id,
            session_id = command.session_id,
            command_id = command.command_id,
            class = command.class_name(),
            command = command.command_type(),
            "sending"
        );
        endpoint.send(command).await
    }

    /// Blocks the pump for one session timeout on a blocking thread. The
    /// wait is wall-clock and is not shortened by other activity.
    async fn hold_for_recovery(&self) {
        let window = self.settings.session_timeout;
        if let Err(e) = tokio::task::spawn_blocking(move || std::thread::sleep(window)).await {
            tracing::error!(target: "lib_g2s::host_queue", host_id = self.host_id, error = %e, "recovery wait failed");
        }
    }

    /// A command held across a clear or a closed gate is not resent.
    fn drop_held(&self, command: &Command) {
        tracing::debug!(
            target: "lib_g2s::host_queue",
            host_id = self.host_id,
            session_id = command.session_id,
            "queue changed during recovery wait, held command dropped"
        );
        if command.session_type == SessionType::Request {
            self.sessions.complete(command.session_id, SessionStatus::Aborted);
        }
    }

    /// Applies a non-null transport verdict. Returns false when the pump
    /// must stop.
    fn on_send_result(&self, command: &Command, response: TransportResponse) -> bool {
        for inbound in response.commands {
            self.receive(inbound);
        }
        if response.error.code.is_none() {
            return true;
        }

        if response.error.code.is(ErrorCode::COMMS_NOT_ONLINE) {
            if command.class.is_comms_on_line() {
                tracing::debug!(
                    target: "lib_g2s::host_queue",
                    host_id = self.host_id,
                    session_id = command.session_id,
                    "commsOnLine answered not online, continuing"
                );
                return true;
            }
            tracing::warn!(
                target: "lib_g2s::host_queue",
                host_id = self.host_id,
                session_id = command.session_id,
                "host reports communications not online"
            );
            self.drop_sessions(SessionStatus::CommsLost);
            self.queue.set_online(false);
            return false;
        }

        tracing::warn!(
            target: "lib_g2s::host_queue",
            host_id = self.host_id,
            session_id = command.session_id,
            class = command.class_name(),
            command = command.command_type(),
            code = %response.error.code,
            "host rejected command"
        );
        if command.session_type == SessionType::Request {
            self.sessions
                .complete_with_error(command.session_id, SessionStatus::RequestError, response.error);
        }
        true
    }

    fn comms_lost(&self) {
        tracing::error!(
            target: "lib_g2s::host_queue",
            host_id = self.host_id,
            "transport failure, host disabled"
        );
        self.drop_sessions(SessionStatus::CommsLost);
        self.queue.set_online(false);
        self.queue.set_allow_send(false);
    }

    fn drop_sessions(&self, status: SessionStatus) {
        let sessions = &self.sessions;
        self.queue.clear(false, |command| {
            if command.session_type == SessionType::Request {
                sessions.complete(command.session_id, status);
            }
        });
        sessions.complete_all(self.host_id, status);
    }

    async fn handle_receive(&self) {
        loop {
            while let Some(command) = self.queue.peek_process() {
                self.process_inbound(command).await;
                self.queue.process();
            }
            self.queue.clear_receive_flag();

            if self.queue.inbound_len() == 0 || !self.queue.try_set_receive_flag() {
                break;
            }
        }
    }

    async fn process_inbound(&self, mut command: Command) {
        if command.session_type == SessionType::Response {
            self.sessions.add_response(command);
            return;
        }

        let owes_response = self.dispatcher.dispatch(&mut command).await;
        if owes_response && (command.is_error() || !command.responses.is_empty()) {
            self.send_response(&command);
        }
    }
}

impl InboundSink for HostQueue {
    fn receive(&self, command: Command) {
        if let Some(monitor) = &self.monitor {
            monitor.record(Direction::Received, &command);
        }
        self.queue.received(command);
        self.start_receive_pump();
    }
}

impl SessionQueue for HostQueue {
    fn requeue(&self, command: Command) {
        if let Err(e) = self.queue_command(command, true) {
            let session_id = e.command().session_id;
            let error = e
                .into_command()
                .error
                .unwrap_or_else(|| CommandError::from_code(ErrorCode::UNEXPECTED_ERROR));
            self.sessions
                .complete_with_error(session_id, SessionStatus::RequestError, error);
        }
    }
}
