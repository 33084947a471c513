//! Simulated hosts for `server_egm`.
//!
//! Each simulated host acknowledges every command the EGM sends. Requests are
//! answered with a `<commandType>Ack` response pushed back through the
//! receive channel, and the host sends its own `keepAlive` requests on a
//! fixed period so the EGM's offline timer stays satisfied.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lib_g2s::core::{
    ClassCommand, Command, CommandError, CommandHandler, CommandKey, Host, RequestOptions, SendEndpoint,
    SessionStatus, SessionType, TransportResponse,
};
use lib_g2s::core::command::{COMMS_ON_LINE, COMMUNICATIONS_CLASS};
use tokio::sync::mpsc;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, info, warn};

const KEEP_ALIVE: &str = "keepAlive";

/// # Simulated Host
pub struct SimulatedHost {
    host_id: i32,
    inbound: mpsc::UnboundedSender<Command>,
    latency: Duration,
}

impl SimulatedHost {
    pub fn new(host_id: i32, inbound: mpsc::UnboundedSender<Command>, latency: Duration) -> Self {
        Self {
            host_id,
            inbound,
            latency,
        }
    }
}

#[async_trait]
impl SendEndpoint for SimulatedHost {
    async fn send(&self, command: &Command) -> Option<TransportResponse> {
        tokio::time::sleep(self.latency).await;
        debug!(
            host_id = self.host_id,
            command_id = command.command_id,
            class = command.class_name(),
            command = command.command_type(),
            "host received"
        );

        if command.session_type == SessionType::Request {
            let ack = ClassCommand::new(
                command.class_name(),
                command.device_id(),
                format!("{}Ack", command.command_type()),
            );
            // A closed channel means the EGM is shutting down; report it as a dead link.
            self.inbound.send(Command::response_to(command, ack)).ok()?;
        }
        Some(TransportResponse::ok())
    }
}

/// Answers host `keepAlive` requests.
pub struct CommunicationsHandler;

#[async_trait]
impl CommandHandler for CommunicationsHandler {
    fn supported_commands(&self) -> Vec<CommandKey> {
        vec![CommandKey::new(COMMUNICATIONS_CLASS, KEEP_ALIVE)]
    }

    async fn verify(&self, _command: &Command) -> anyhow::Result<Option<CommandError>> {
        Ok(None)
    }

    async fn handle(&self, command: &mut Command) -> anyhow::Result<()> {
        let ack = ClassCommand::new(COMMUNICATIONS_CLASS, command.device_id(), "keepAliveAck");
        command.responses.push(ack);
        Ok(())
    }
}

/// Sends `commsOnLine` to the host and marks it online once acknowledged.
pub fn go_online(host: &Arc<Host>) {
    let queue = Arc::clone(host.queue());
    let host_id = host.id();
    let session = host.queue().send_request(
        ClassCommand::new(COMMUNICATIONS_CLASS, host_id, COMMS_ON_LINE),
        RequestOptions::new().always_send().callback(move |session| {
            if session.status() == SessionStatus::Completed {
                queue.set_online(true);
                info!(host_id, "host online");
            } else {
                warn!(host_id, status = %session.status(), "commsOnLine not acknowledged");
            }
        }),
    );
    debug!(host_id, session_id = session.id(), "commsOnLine sent");
}

/// Sends a `keepAlive` request from the simulated host every `period` until
/// shutdown.
pub async fn run_keep_alive(
    host_id: i32,
    egm_id: String,
    inbound: mpsc::UnboundedSender<Command>,
    period: Duration,
    shutdown_guard: ShutdownGuard,
) {
    let session_ids = AtomicI64::new(1);
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = shutdown_guard.cancelled() => {
                debug!(host_id, "keepAlive loop stopped");
                break;
            }
            _ = ticker.tick() => {
                let keep_alive = Command::new(
                    host_id,
                    egm_id.clone(),
                    session_ids.fetch_add(1, Ordering::Relaxed),
                    SessionType::Request,
                    ClassCommand::new(COMMUNICATIONS_CLASS, host_id, KEEP_ALIVE),
                );
                if inbound.send(keep_alive).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_are_acknowledged_inline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = SimulatedHost::new(3, tx, Duration::ZERO);
        let request = Command::new(
            3,
            "EGM",
            12,
            SessionType::Request,
            ClassCommand::new(COMMUNICATIONS_CLASS, 3, COMMS_ON_LINE),
        );

        let verdict = host.send(&request).await.unwrap();
        assert!(!verdict.is_error());

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.session_id, 12);
        assert_eq!(ack.session_type, SessionType::Response);
        assert_eq!(ack.command_type(), "commsOnLineAck");
    }

    #[tokio::test]
    async fn test_keep_alive_is_answered() {
        let mut command = Command::new(
            3,
            "EGM",
            1,
            SessionType::Request,
            ClassCommand::new(COMMUNICATIONS_CLASS, 3, KEEP_ALIVE),
        );
        CommunicationsHandler.handle(&mut command).await.unwrap();
        assert_eq!(command.responses[0].command_type, "keepAliveAck");
    }
}
