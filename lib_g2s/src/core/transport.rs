//! # Transport Boundary
//!
//! The protocol core never talks to the network itself. Outbound traffic
//! leaves through a [`SendEndpoint`] resolved per host by an
//! [`EndpointProvider`]; inbound traffic is pushed into an [`InboundRouter`]
//! by whatever [`ReceiveEndpoint`] the EGM was built with.
//!
//! A `None` from [`SendEndpoint::send`] is a hard communications failure.
//! A `Some` always carries an error code, `G2S_none` on success, plus any
//! commands the remote answered with inline.
//!
//! [`StaticEndpoints`] and [`ChannelReceiveEndpoint`] are in-process
//! implementations for simulators and tests.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::command::{Command, CommandError, ErrorCode};

/// What the remote said about one transmitted command.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    /// Transport-level error; `G2S_none` on success.
    pub error: CommandError,
    /// Commands the remote returned inline, routed to the receive side.
    pub commands: Vec<Command>,
}

impl TransportResponse {
    /// Success with nothing returned.
    pub fn ok() -> Self {
        Self {
            error: CommandError::from_code(ErrorCode::NONE),
            commands: Vec::new(),
        }
    }

    /// Success carrying inline commands.
    pub fn with_commands(commands: Vec<Command>) -> Self {
        Self {
            commands,
            ..Self::ok()
        }
    }

    /// Failure with the given code.
    pub fn error(code: &str) -> Self {
        Self {
            error: CommandError::from_code(code),
            commands: Vec::new(),
        }
    }

    /// True if the error code is anything but "no error".
    pub fn is_error(&self) -> bool {
        !self.error.code.is_none()
    }
}

/// Sends one command to a host.
#[async_trait]
pub trait SendEndpoint: Send + Sync {
    /// `None` signals a communications failure.
    async fn send(&self, command: &Command) -> Option<TransportResponse>;
}

/// Resolves the send endpoint of a host.
pub trait EndpointProvider: Send + Sync {
    fn endpoint(&self, host_id: i32) -> Option<Arc<dyn SendEndpoint>>;
}

/// Delivers inbound commands into the core.
#[async_trait]
pub trait ReceiveEndpoint: Send + Sync {
    /// Starts accepting traffic and routing it through `router`.
    async fn open(&self, router: Arc<InboundRouter>) -> anyhow::Result<()>;

    /// Stops accepting traffic.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Accepts inbound commands for one host.
pub trait InboundSink: Send + Sync {
    fn receive(&self, command: Command);
}

/// # Inbound Router
///
/// Maps host ids to the queue that owns their inbound traffic. Commands for
/// hosts that are not connected are discarded.
#[derive(Default)]
pub struct InboundRouter {
    routes: RwLock<HashMap<i32, Weak<dyn InboundSink>>>,
}

impl InboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, host_id: i32, sink: Weak<dyn InboundSink>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_id, sink);
    }

    pub fn disconnect(&self, host_id: i32) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&host_id);
    }

    pub fn is_connected(&self, host_id: i32) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host_id)
            .is_some_and(|sink| sink.strong_count() > 0)
    }

    /// Hands the command to its host. Returns false if it was discarded.
    pub fn route(&self, command: Command) -> bool {
        let sink = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&command.host_id)
            .and_then(Weak::upgrade);

        match sink {
            Some(sink) => {
                sink.receive(command);
                true
            }
            None => {
                tracing::warn!(
                    target: "lib_g2s::transport",
                    host_id = command.host_id,
                    session_id = command.session_id,
                    class = command.class_name(),
                    command = command.command_type(),
                    "inbound command for unregistered host discarded"
                );
                false
            }
        }
    }
}

/// # Static Endpoints
///
/// A fixed host id → endpoint table.
#[derive(Default)]
pub struct StaticEndpoints {
    endpoints: RwLock<HashMap<i32, Arc<dyn SendEndpoint>>>,
}

impl StaticEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host_id: i32, endpoint: Arc<dyn SendEndpoint>) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_id, endpoint);
    }

    pub fn remove(&self, host_id: i32) -> Option<Arc<dyn SendEndpoint>> {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&host_id)
    }
}

impl EndpointProvider for StaticEndpoints {
    fn endpoint(&self, host_id: i32) -> Option<Arc<dyn SendEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host_id)
            .cloned()
    }
}

struct ChannelState {
    rx: Option<mpsc::UnboundedReceiver<Command>>,
    running: Option<(CancellationToken, JoinHandle<mpsc::UnboundedReceiver<Command>>)>,
}

/// # Channel Receive Endpoint
///
/// In-process receive side fed through an unbounded channel. Commands sent
/// while the endpoint is closed wait in the channel until it is opened.
pub struct ChannelReceiveEndpoint {
    state: tokio::sync::Mutex<ChannelState>,
}

impl ChannelReceiveEndpoint {
    /// Creates the endpoint and the sender that feeds it.
    pub fn channel() -> (mpsc::UnboundedSender<Command>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Self {
            state: tokio::sync::Mutex::new(ChannelState {
                rx: Some(rx),
                running: None,
            }),
        };
        (tx, endpoint)
    }
}

#[async_trait]
impl ReceiveEndpoint for ChannelReceiveEndpoint {
    async fn open(&self, router: Arc<InboundRouter>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            return Ok(());
        }
        let Some(mut rx) = state.rx.take() else {
            anyhow::bail!("receive channel is no longer available");
        };

        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(command) => {
                            router.route(command);
                        }
                        None => break,
                    },
                }
            }
            rx
        });
        state.running = Some((token, handle));
        tracing::debug!(target: "lib_g2s::transport", "receive endpoint opened");
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some((token, handle)) = state.running.take() {
            token.cancel();
            state.rx = Some(handle.await?);
            tracing::debug!(target: "lib_g2s::transport", "receive endpoint closed");
        }
        Ok(())
    }
}
