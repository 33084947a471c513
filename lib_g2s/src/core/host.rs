//! # Registered Host
//!
//! A remote G2S host as the EGM knows it: identity, comms-config position,
//! address, flags, and the [`HostQueue`] that carries its traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use url::Url;

use crate::core::command::EGM_HOST_ID;
use crate::core::device::{Device, DeviceRegistry, StartupContext};
use crate::core::host_queue::{HostQueue, HostState};

/// # Host
pub struct Host {
    id: i32,
    index: i32,
    address: RwLock<Option<Url>>,
    required_for_play: AtomicBool,
    registered: AtomicBool,
    is_progressive: AtomicBool,
    offline_timer: Mutex<Duration>,
    queue: Arc<HostQueue>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("address", &self.address().map(|u| u.to_string()))
            .field("registered", &self.is_registered())
            .field("state", &self.queue.state())
            .finish()
    }
}

impl Host {
    pub fn new(id: i32, index: i32, address: Option<Url>, required_for_play: bool, queue: Arc<HostQueue>) -> Self {
        let offline_timer = queue.settings().offline_timer;
        Self {
            id,
            index,
            address: RwLock::new(address),
            required_for_play: AtomicBool::new(required_for_play),
            registered: AtomicBool::new(true),
            is_progressive: AtomicBool::new(false),
            offline_timer: Mutex::new(offline_timer),
            queue,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Position in the comms configuration. Fixed at registration.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// True for the EGM's own host entry.
    pub fn is_egm(&self) -> bool {
        self.id == EGM_HOST_ID
    }

    pub fn address(&self) -> Option<Url> {
        self.address.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the host address.
    ///
    /// # Errors
    /// `url::ParseError` if `uri` is not an absolute URL; the address is left
    /// unchanged.
    pub fn set_address(&self, uri: &str) -> Result<(), url::ParseError> {
        let url = Url::parse(uri)?;
        tracing::info!(target: "lib_g2s::host", host_id = self.id, address = %url, "host address changed");
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = Some(url);
        Ok(())
    }

    pub fn required_for_play(&self) -> bool {
        self.required_for_play.load(Ordering::SeqCst)
    }

    pub fn set_required_for_play(&self, required: bool) {
        self.required_for_play.store(required, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    pub fn is_progressive(&self) -> bool {
        self.is_progressive.load(Ordering::SeqCst)
    }

    pub fn set_progressive(&self, progressive: bool) {
        self.is_progressive.store(progressive, Ordering::SeqCst);
    }

    /// Silence window after which the host is considered offline.
    pub fn offline_timer(&self) -> Duration {
        *self.offline_timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_offline_timer(&self, interval: Duration) {
        *self.offline_timer.lock().unwrap_or_else(PoisonError::into_inner) = interval;
    }

    pub fn queue(&self) -> &Arc<HostQueue> {
        &self.queue
    }

    pub fn state(&self) -> HostState {
        self.queue.state()
    }

    /// Opens every device this host owns with `context` and, for remote
    /// hosts, opens the send gate so the online handshake can go out.
    pub fn start(&self, devices: &DeviceRegistry, context: &StartupContext) {
        let owned = devices.owned_by(self.id);
        for device in &owned {
            device.open(context);
        }
        if !self.is_egm() {
            self.queue.enable_send(true);
        }
        tracing::info!(target: "lib_g2s::host", host_id = self.id, devices = owned.len(), "host started");
    }

    /// Closes the devices this host owns.
    pub fn close_devices(&self, devices: &DeviceRegistry) -> Vec<Arc<dyn Device>> {
        let owned = devices.owned_by(self.id);
        for device in &owned {
            device.close();
        }
        owned
    }

    /// Closes owned devices and shuts the queue down, aborting pending
    /// sessions.
    pub fn stop(&self, devices: &DeviceRegistry) {
        self.close_devices(devices);
        self.queue.shutdown();
        tracing::info!(target: "lib_g2s::host", host_id = self.id, "host stopped");
    }
}
