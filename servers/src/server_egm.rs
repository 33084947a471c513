//! # G2S EGM Simulator
//!
//! Runs the protocol core of an EGM against simulated hosts. Every configured
//! host gets a `communications` device, an in-process endpoint that
//! acknowledges each command, and a keepAlive loop that keeps the offline
//! watchdog quiet.
//!
//! ## Functionality:
//! - **Layered Configuration**: defaults, then `server_egm.conf` (JSON), then
//!   `EGM_*` environment variables and CLI flags.
//! - **Protocol Core**: registers hosts, starts the EGM and brings each host
//!   online with a `commsOnLine` request.
//! - **Observability**: command events and periodic queue statistics go to
//!   the console and to the rolling JSON log.
//! - **Graceful Shutdown**: `tokio-graceful` stops the core and the simulated
//!   hosts on Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{debug, error, info, warn};

use lib_g2s::core::{
    ChannelReceiveEndpoint, CommandRegistry, DeviceRegistry, EgmCore, SimpleDevice, StaticEndpoints,
};
use lib_g2s::core::command::COMMUNICATIONS_CLASS;
use lib_g2s::loggers::init_logging;

mod egm_logic;
use egm_logic::config::{self, Config};
use egm_logic::simulator::{self, CommunicationsHandler, SimulatedHost};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let _logging = init_logging(&config.logging_options())?;
    info!("{}", config.protocol_config()?);

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |shutdown_guard| async move {
        if let Err(e) = egm_main(config, shutdown_guard).await {
            error!("EGM stopped with error: {:#}", e);
        }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            warn!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    Ok(())
}

async fn egm_main(config: Config, shutdown_guard: ShutdownGuard) -> Result<()> {
    let settings = config.protocol_config()?.settings();
    let keep_alive = Duration::from_millis(config.keep_alive_ms.unwrap_or(5_000));
    let latency = Duration::from_millis(config.host_latency_ms.unwrap_or(0));
    let stats_interval = Duration::from_secs(config.stats_interval_seconds.unwrap_or(30).max(1));

    let registry = Arc::new(CommandRegistry::new());
    registry.register(Arc::new(CommunicationsHandler))?;
    let devices = Arc::new(DeviceRegistry::new());
    let endpoints = Arc::new(StaticEndpoints::new());
    let (inbound, receiver) = ChannelReceiveEndpoint::channel();

    let core = Arc::new(EgmCore::new(
        settings.clone(),
        registry,
        Arc::clone(&devices),
        endpoints.clone(),
        Arc::new(receiver),
    ));

    for entry in config.hosts() {
        core.register_host(entry.host_id, &entry.uri, entry.required_for_play, entry.index)?;
        devices.add(Arc::new(SimpleDevice::new(COMMUNICATIONS_CLASS, entry.host_id, entry.host_id)));
        endpoints.insert(
            entry.host_id,
            Arc::new(SimulatedHost::new(entry.host_id, inbound.clone(), latency)),
        );
    }

    tokio::spawn(log_events(Arc::clone(&core), shutdown_guard.clone()));

    core.start(&[]).await?;
    for host in core.hosts().iter().filter(|host| !host.is_egm()) {
        simulator::go_online(host);
        tokio::spawn(simulator::run_keep_alive(
            host.id(),
            settings.egm_id.clone(),
            inbound.clone(),
            keep_alive,
            shutdown_guard.clone(),
        ));
    }

    let mut ticker = tokio::time::interval(stats_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_guard.cancelled() => {
                info!("Signal received: stopping EGM");
                break;
            }
            _ = ticker.tick() => {
                for host in core.hosts() {
                    match serde_json::to_string(&host.queue().stats()) {
                        Ok(stats) => info!(host_id = host.id(), state = ?host.state(), "{}", stats),
                        Err(e) => warn!(host_id = host.id(), "Failed to serialize queue stats: {}", e),
                    }
                }
            }
        }
    }

    core.stop().await?;
    info!(pending_sessions = core.sessions().len(), "EGM stopped");
    Ok(())
}

async fn log_events(core: Arc<EgmCore>, shutdown_guard: ShutdownGuard) {
    let mut subscription = core.monitor().subscribe();
    loop {
        tokio::select! {
            _ = shutdown_guard.cancelled() => break,
            event = subscription.events.recv() => match event {
                Some(event) => debug!(
                    direction = ?event.direction,
                    host_id = event.host_id,
                    session_id = event.session_id,
                    command_id = event.command_id,
                    error = ?event.error_code,
                    "{}.{}",
                    event.class_name,
                    event.command_type
                ),
                None => break,
            },
        }
    }
    core.monitor().unsubscribe(subscription.id);
}
