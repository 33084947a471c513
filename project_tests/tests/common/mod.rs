//! Shared fixtures for the protocol integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lib_g2s::configs::ProtocolSettings;
use lib_g2s::core::{
    ChannelReceiveEndpoint, ClassCommand, Command, CommandError, CommandHandler, CommandKey, CommandRegistry,
    DeviceRegistry, EgmCore, SendEndpoint, SessionType, StaticEndpoints, TransportResponse,
};
use tokio::sync::mpsc;

/// How a [`Wire`] answers each send.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Plain acknowledgement.
    Ack,
    /// Acknowledgement, plus an inline `<type>Ack` response for requests.
    Respond,
    /// The transport is gone.
    Dead,
    /// The host refuses the command with this code.
    Reject(&'static str),
}

/// A send endpoint that records what it was given.
pub struct Wire {
    verdict: Mutex<Verdict>,
    script: Mutex<VecDeque<Verdict>>,
    seen: Mutex<Vec<Command>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Wire {
    pub fn new(verdict: Verdict) -> Arc<Self> {
        Self::scripted(Vec::new(), verdict)
    }

    /// Answers with `first` in order, then with `then` for good.
    pub fn scripted(first: Vec<Verdict>, then: Verdict) -> Arc<Self> {
        Arc::new(Self {
            verdict: Mutex::new(then),
            script: Mutex::new(first.into()),
            seen: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn set_verdict(&self, verdict: Verdict) {
        *self.verdict.lock().unwrap() = verdict;
    }

    pub fn seen(&self) -> Vec<Command> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Highest number of sends that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Polls until at least `count` commands were sent, or a second passes.
    pub async fn wait_for(&self, count: usize) -> Vec<Command> {
        for _ in 0..200 {
            if self.seen_len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.seen()
    }
}

#[async_trait]
impl SendEndpoint for Wire {
    async fn send(&self, command: &Command) -> Option<TransportResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.seen.lock().unwrap().push(command.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.script.lock().unwrap().pop_front();
        let verdict = scripted.unwrap_or_else(|| self.verdict.lock().unwrap().clone());
        match verdict {
            Verdict::Ack => Some(TransportResponse::ok()),
            Verdict::Respond if command.session_type == SessionType::Request => {
                let ack = ClassCommand::new(
                    command.class_name(),
                    command.device_id(),
                    format!("{}Ack", command.command_type()),
                );
                Some(TransportResponse::with_commands(vec![Command::response_to(command, ack)]))
            }
            Verdict::Respond => Some(TransportResponse::ok()),
            Verdict::Dead => None,
            Verdict::Reject(code) => Some(TransportResponse::error(code)),
        }
    }
}

/// Counts calls and answers with one `<type>Ack` fragment.
pub struct CountingHandler {
    keys: Vec<CommandKey>,
    prohibited_when_disabled: bool,
    pub verified: AtomicUsize,
    pub handled: AtomicUsize,
}

impl CountingHandler {
    pub fn new(class_name: &str, command_types: &[&str], prohibited_when_disabled: bool) -> Arc<Self> {
        Arc::new(Self {
            keys: command_types.iter().map(|t| CommandKey::new(class_name, *t)).collect(),
            prohibited_when_disabled,
            verified: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        })
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for CountingHandler {
    fn supported_commands(&self) -> Vec<CommandKey> {
        self.keys.clone()
    }

    fn prohibited_when_disabled(&self) -> bool {
        self.prohibited_when_disabled
    }

    async fn verify(&self, _command: &Command) -> anyhow::Result<Option<CommandError>> {
        self.verified.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn handle(&self, command: &mut Command) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        let ack = ClassCommand::new(
            command.class_name(),
            command.device_id(),
            format!("{}Ack", command.command_type()),
        );
        command.responses.push(ack);
        Ok(())
    }
}

/// An `EgmCore` with its collaborators exposed.
pub struct Fixture {
    pub core: Arc<EgmCore>,
    pub registry: Arc<CommandRegistry>,
    pub devices: Arc<DeviceRegistry>,
    pub endpoints: Arc<StaticEndpoints>,
    pub inbound: mpsc::UnboundedSender<Command>,
}

impl Fixture {
    pub fn new(settings: ProtocolSettings) -> Self {
        let registry = Arc::new(CommandRegistry::new());
        let devices = Arc::new(DeviceRegistry::new());
        let endpoints = Arc::new(StaticEndpoints::new());
        let (inbound, receiver) = ChannelReceiveEndpoint::channel();
        let core = Arc::new(EgmCore::new(
            settings,
            Arc::clone(&registry),
            Arc::clone(&devices),
            endpoints.clone(),
            Arc::new(receiver),
        ));
        Self {
            core,
            registry,
            devices,
            endpoints,
            inbound,
        }
    }

    /// Registers a host reachable through `wire`.
    pub fn host_with_wire(&self, host_id: i32, wire: &Arc<Wire>) {
        self.core
            .register_host(host_id, &format!("http://host{host_id}.test/g2s"), true, host_id)
            .unwrap();
        self.endpoints.insert(host_id, wire.clone());
    }

    /// An inbound request from `host_id`.
    pub fn request_from(&self, host_id: i32, session_id: i64, class: ClassCommand) -> Command {
        Command::new(
            host_id,
            self.core.settings().egm_id.clone(),
            session_id,
            SessionType::Request,
            class,
        )
    }
}

/// Settings with a short session timeout.
pub fn quick_settings() -> ProtocolSettings {
    ProtocolSettings {
        egm_id: "EGM_TEST".to_string(),
        session_timeout: Duration::from_millis(200),
        ..ProtocolSettings::default()
    }
}
