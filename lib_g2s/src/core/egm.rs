//! # EGM Core
//!
//! The `EgmCore` is the top of the protocol engine. It owns the set of
//! registered hosts, wires each host's queue into inbound routing, rewires
//! device roles when hosts come and go, and drives the start/stop/restart
//! lifecycle across all hosts.
//!
//! ## Core Design Principles:
//!
//! 1.  **Host 0 Is the EGM**: it is registered at construction, owns every
//!     unassigned device, and can never be unregistered.
//!
//! 2.  **Serialized Lifecycle**: `start`, `stop` and `restart` take one async
//!     lock. Starting a running core and stopping a stopped one are no-ops.
//!
//! 3.  **Parallel Hosts**: on start every host is brought up on its own task
//!     and the core waits for all of them. Hosts never share a lock on the
//!     traffic path.
//!
//! 4.  **Offline Watchdog**: while running, a background task marks a host
//!     offline once it has been silent for longer than its offline timer.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::configs::protocol::ProtocolSettings;
use crate::core::command::EGM_HOST_ID;
use crate::core::device::{same_device, Device, DeviceRegistry, StartupContext};
use crate::core::dispatcher::CommandDispatcher;
use crate::core::host::Host;
use crate::core::host_queue::HostQueue;
use crate::core::monitor::CommandMonitor;
use crate::core::registry::CommandRegistry;
use crate::core::session::SessionManager;
use crate::core::transport::{EndpointProvider, InboundRouter, InboundSink, ReceiveEndpoint};

type HostMap = BTreeMap<i32, Arc<Host>>;

/// How often the watchdog looks at host silence.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EgmError {
    #[error("host 0 is the EGM and cannot be unregistered")]
    ReservedHost,

    #[error("host {0} is not registered")]
    UnknownHost(i32),

    #[error("invalid address for host {host_id}: {source}")]
    InvalidAddress {
        host_id: i32,
        #[source]
        source: url::ParseError,
    },

    #[error("receive endpoint failed: {0:#}")]
    Transport(anyhow::Error),
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    watchdog: Option<(CancellationToken, JoinHandle<()>)>,
}

/// # EGM Core
pub struct EgmCore {
    settings: ProtocolSettings,
    devices: Arc<DeviceRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    sessions: Arc<SessionManager>,
    endpoints: Arc<dyn EndpointProvider>,
    receiver: Arc<dyn ReceiveEndpoint>,
    router: Arc<InboundRouter>,
    monitor: Arc<CommandMonitor>,
    hosts: Arc<RwLock<HostMap>>,
    lifecycle: Mutex<Lifecycle>,
}

impl EgmCore {
    /// Builds a stopped core with host 0 registered.
    pub fn new(
        settings: ProtocolSettings,
        registry: Arc<CommandRegistry>,
        devices: Arc<DeviceRegistry>,
        endpoints: Arc<dyn EndpointProvider>,
        receiver: Arc<dyn ReceiveEndpoint>,
    ) -> Self {
        let core = Self {
            monitor: Arc::new(CommandMonitor::new(settings.history_depth)),
            dispatcher: Arc::new(CommandDispatcher::new(registry, Arc::clone(&devices))),
            sessions: Arc::new(SessionManager::new()),
            router: Arc::new(InboundRouter::new()),
            hosts: Arc::new(RwLock::new(BTreeMap::new())),
            lifecycle: Mutex::new(Lifecycle::default()),
            settings,
            devices,
            endpoints,
            receiver,
        };
        let egm = Arc::new(Host::new(EGM_HOST_ID, 0, None, false, core.host_queue(EGM_HOST_ID)));
        core.write_hosts().insert(EGM_HOST_ID, egm);
        core
    }

    fn host_queue(&self, host_id: i32) -> Arc<HostQueue> {
        HostQueue::new(
            host_id,
            self.settings.clone(),
            Arc::clone(&self.sessions),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.endpoints),
            Some(Arc::clone(&self.monitor)),
        )
    }

    fn write_hosts(&self) -> RwLockWriteGuard<'_, HostMap> {
        self.hosts.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_hosts(&self) -> RwLockReadGuard<'_, HostMap> {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn router(&self) -> &Arc<InboundRouter> {
        &self.router
    }

    pub fn monitor(&self) -> &Arc<CommandMonitor> {
        &self.monitor
    }

    pub fn host(&self, host_id: i32) -> Option<Arc<Host>> {
        self.read_hosts().get(&host_id).cloned()
    }

    /// Every registered host, ordered by id. Host 0 comes first.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.read_hosts().values().cloned().collect()
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    /// Registers a host, or returns the one already registered under that id.
    ///
    /// # Errors
    /// `EgmError::InvalidAddress` if a new host's `uri` does not parse.
    pub fn register_host(
        &self,
        host_id: i32,
        uri: &str,
        required_for_play: bool,
        index: i32,
    ) -> Result<Arc<Host>, EgmError> {
        if let Some(existing) = self.host(host_id) {
            return Ok(existing);
        }
        let address = Url::parse(uri).map_err(|source| EgmError::InvalidAddress { host_id, source })?;

        let mut hosts = self.write_hosts();
        if let Some(existing) = hosts.get(&host_id) {
            return Ok(Arc::clone(existing));
        }

        let queue = self.host_queue(host_id);
        let sink: Weak<dyn InboundSink> = Arc::downgrade(&queue) as Weak<dyn InboundSink>;
        self.router.connect(host_id, sink);

        let host = Arc::new(Host::new(host_id, index, Some(address), required_for_play, queue));
        hosts.insert(host_id, Arc::clone(&host));
        tracing::info!(target: "lib_g2s::egm", host_id, index, address = uri, required_for_play, "host registered");
        Ok(host)
    }

    /// Removes a host. Its devices fall back to the EGM. Serialized with
    /// `start`, `stop` and `restart`.
    ///
    /// # Errors
    /// `EgmError::ReservedHost` for host 0, `EgmError::UnknownHost` if the id
    /// is not registered.
    pub async fn unregister_host(&self, host_id: i32) -> Result<Arc<Host>, EgmError> {
        if host_id == EGM_HOST_ID {
            return Err(EgmError::ReservedHost);
        }
        let _lifecycle = self.lifecycle.lock().await;
        let host = self
            .write_hosts()
            .remove(&host_id)
            .ok_or(EgmError::UnknownHost(host_id))?;

        self.router.disconnect(host_id);
        host.stop(&self.devices);
        host.set_registered(false);

        let mut reassigned = 0;
        for device in self.devices.member_of(host_id) {
            if device.is_owner(host_id) {
                device.has_owner(EGM_HOST_ID);
            }
            if device.is_configurator(host_id) {
                device.has_configurator(EGM_HOST_ID);
            }
            if device.is_guest(host_id) {
                device.remove_guest(host_id);
            }
            reassigned += 1;
        }
        tracing::info!(target: "lib_g2s::egm", host_id, reassigned, "host unregistered");
        Ok(host)
    }

    /// Opens the receive endpoint and starts every host in parallel. Hosts
    /// without an entry in `contexts` start with the all-false context.
    ///
    /// # Errors
    /// `EgmError::Transport` if the receive endpoint cannot be opened; no host
    /// is started in that case.
    pub async fn start(&self, contexts: &[StartupContext]) -> Result<(), EgmError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Ok(());
        }

        self.receiver
            .open(Arc::clone(&self.router))
            .await
            .map_err(EgmError::Transport)?;

        let tasks: Vec<JoinHandle<()>> = self
            .hosts()
            .into_iter()
            .map(|host| {
                let context = contexts
                    .iter()
                    .find(|c| c.host_id == host.id())
                    .copied()
                    .unwrap_or_else(|| StartupContext::for_host(host.id()));
                let devices = Arc::clone(&self.devices);
                tokio::spawn(async move { host.start(&devices, &context) })
            })
            .collect();
        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                tracing::error!(target: "lib_g2s::egm", error = %e, "host start task failed");
            }
        }

        let token = CancellationToken::new();
        let watchdog = tokio::spawn(run_watchdog(Arc::clone(&self.hosts), token.clone()));
        lifecycle.watchdog = Some((token, watchdog));
        lifecycle.running = true;
        tracing::info!(target: "lib_g2s::egm", hosts = self.read_hosts().len(), "EGM core started");
        Ok(())
    }

    /// Closes every device, stops every host and closes the receive endpoint.
    ///
    /// # Errors
    /// `EgmError::Transport` if the receive endpoint fails to close. Hosts are
    /// stopped regardless.
    pub async fn stop(&self) -> Result<(), EgmError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return Ok(());
        }

        if let Some((token, watchdog)) = lifecycle.watchdog.take() {
            token.cancel();
            if let Err(e) = watchdog.await {
                tracing::error!(target: "lib_g2s::egm", error = %e, "watchdog task failed");
            }
        }

        for device in self.devices.all() {
            device.close();
        }
        for host in self.hosts() {
            host.stop(&self.devices);
        }
        lifecycle.running = false;

        let closed = self.receiver.close().await.map_err(EgmError::Transport);
        tracing::info!(target: "lib_g2s::egm", "EGM core stopped");
        closed
    }

    /// Restarts only the hosts named in `contexts`: their owned devices are
    /// closed, then the host is started again with its context. Does nothing
    /// while the core is stopped.
    pub async fn restart(&self, contexts: &[StartupContext]) {
        let lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            tracing::warn!(target: "lib_g2s::egm", "restart requested while stopped, ignored");
            return;
        }

        for context in contexts {
            let Some(host) = self.host(context.host_id) else {
                tracing::warn!(target: "lib_g2s::egm", host_id = context.host_id, "restart of unknown host ignored");
                continue;
            };
            host.close_devices(&self.devices);
            host.start(&self.devices, context);
        }
    }

    /// Makes the device roles of `host_id` match the requested lists. Roles
    /// the host holds on devices missing from a list revert to the EGM.
    /// Returns each device whose roles changed, once.
    ///
    /// # Errors
    /// `EgmError::UnknownHost` if the host is not registered.
    pub fn apply_host_permissions(
        &self,
        host_id: i32,
        owned: &[Arc<dyn Device>],
        configured: &[Arc<dyn Device>],
        guest: &[Arc<dyn Device>],
    ) -> Result<Vec<Arc<dyn Device>>, EgmError> {
        if self.host(host_id).is_none() {
            return Err(EgmError::UnknownHost(host_id));
        }

        let listed = |list: &[Arc<dyn Device>], device: &Arc<dyn Device>| list.iter().any(|d| same_device(d, device));

        let mut candidates = self.devices.all();
        for device in owned.iter().chain(configured).chain(guest) {
            if !candidates.iter().any(|c| same_device(c, device)) {
                candidates.push(Arc::clone(device));
            }
        }

        let mut changed = Vec::new();
        for device in candidates {
            let mut touched = false;

            match (listed(owned, &device), device.is_owner(host_id)) {
                (true, false) => {
                    device.has_owner(host_id);
                    touched = true;
                }
                (false, true) if host_id != EGM_HOST_ID => {
                    device.has_owner(EGM_HOST_ID);
                    touched = true;
                }
                _ => {}
            }

            match (listed(configured, &device), device.is_configurator(host_id)) {
                (true, false) => {
                    device.has_configurator(host_id);
                    touched = true;
                }
                (false, true) if host_id != EGM_HOST_ID => {
                    device.has_configurator(EGM_HOST_ID);
                    touched = true;
                }
                _ => {}
            }

            match (listed(guest, &device), device.is_guest(host_id)) {
                (true, false) => {
                    device.add_guest(host_id);
                    touched = true;
                }
                (false, true) => {
                    device.remove_guest(host_id);
                    touched = true;
                }
                _ => {}
            }

            if touched {
                changed.push(device);
            }
        }

        tracing::info!(target: "lib_g2s::egm", host_id, changed = changed.len(), "host permissions applied");
        Ok(changed)
    }
}

/// Marks hosts offline once they have been silent past their offline timer.
async fn run_watchdog(hosts: Arc<RwLock<HostMap>>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(WATCHDOG_PERIOD);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot: Vec<Arc<Host>> = hosts
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|h| !h.is_egm())
                    .cloned()
                    .collect();
                for host in snapshot {
                    let queue = host.queue().queue();
                    if !queue.is_online() {
                        continue;
                    }
                    if let Some(silent) = queue.silent_for() {
                        if silent > host.offline_timer() {
                            tracing::warn!(
                                target: "lib_g2s::egm",
                                host_id = host.id(),
                                silent_ms = silent.as_millis() as u64,
                                "host silent past its offline timer, marking offline"
                            );
                            host.queue().set_online(false);
                        }
                    }
                }
            }
        }
    }
}
