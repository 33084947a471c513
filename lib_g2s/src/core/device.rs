//! # Device Boundary
//!
//! The protocol core does not own device internals. It consumes devices
//! through the [`Device`] trait: it asks whether they exist and are enabled
//! during dispatch, it rewires owner/configurator/guest relations when hosts
//! come and go, and it opens and closes them around host start/stop.
//!
//! [`DeviceRoles`] is the host-relationship bookkeeping most implementations
//! need, and [`SimpleDevice`] is a complete implementation built on it for
//! simulators and tests. [`DeviceRegistry`] is the device set handed to the
//! dispatcher and the EGM core.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::core::command::EGM_HOST_ID;

/// # Startup Context
///
/// Conditions a device is told about when it is opened for a host. The
/// default value (every flag false) is used for hosts started without an
/// explicit context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupContext {
    /// Host the context applies to.
    pub host_id: i32,
    /// The device was reset since the host last saw it.
    pub device_reset: bool,
    /// The device configuration changed.
    pub device_changed: bool,
    /// The host lost access to the device.
    pub device_access_lost: bool,
    /// Event subscriptions were lost.
    pub subscription_lost: bool,
    /// Meters were reset.
    pub meter_reset: bool,
    /// Enabled/disabled state changed while the host was away.
    pub device_state_changed: bool,
    /// Communications with the host were lost.
    pub comms_lost: bool,
}

impl StartupContext {
    /// The all-false context for a host.
    pub fn for_host(host_id: i32) -> Self {
        Self {
            host_id,
            ..Default::default()
        }
    }
}

/// A device as seen by the protocol core.
pub trait Device: Send + Sync + fmt::Debug {
    /// G2S class the device belongs to.
    fn device_class(&self) -> &str;

    /// Device id within its class.
    fn id(&self) -> i32;

    /// True if the device currently accepts commands.
    fn is_enabled(&self) -> bool;

    /// True if the host holds any role on the device.
    fn is_member(&self, host_id: i32) -> bool {
        self.is_owner(host_id) || self.is_configurator(host_id) || self.is_guest(host_id)
    }

    /// True if the host owns the device.
    fn is_owner(&self, host_id: i32) -> bool;

    /// True if the host configures the device.
    fn is_configurator(&self, host_id: i32) -> bool;

    /// True if the host is a guest of the device.
    fn is_guest(&self, host_id: i32) -> bool;

    /// Makes the host the owner.
    fn has_owner(&self, host_id: i32);

    /// Makes the host the configurator.
    fn has_configurator(&self, host_id: i32);

    /// Grants guest access to the host.
    fn add_guest(&self, host_id: i32);

    /// Revokes guest access from the host.
    fn remove_guest(&self, host_id: i32);

    /// Opens the device for its owning host.
    fn open(&self, context: &StartupContext);

    /// Closes the device.
    fn close(&self);
}

#[derive(Debug)]
struct RoleState {
    owner: i32,
    configurator: i32,
    guests: BTreeSet<i32>,
}

/// # Device Roles
///
/// Owner, configurator and guest relations of one device. New devices belong
/// to the EGM (host 0) until a host claims them.
#[derive(Debug)]
pub struct DeviceRoles {
    state: Mutex<RoleState>,
}

impl Default for DeviceRoles {
    fn default() -> Self {
        Self::new(EGM_HOST_ID)
    }
}

impl DeviceRoles {
    /// Creates roles with the given owner, who is also the configurator.
    pub fn new(owner: i32) -> Self {
        Self {
            state: Mutex::new(RoleState {
                owner,
                configurator: owner,
                guests: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current owner.
    pub fn owner(&self) -> i32 {
        self.lock().owner
    }

    /// Current configurator.
    pub fn configurator(&self) -> i32 {
        self.lock().configurator
    }

    /// Current guests, ascending.
    pub fn guests(&self) -> Vec<i32> {
        self.lock().guests.iter().copied().collect()
    }

    /// Sets the owner.
    pub fn set_owner(&self, host_id: i32) {
        self.lock().owner = host_id;
    }

    /// Sets the configurator.
    pub fn set_configurator(&self, host_id: i32) {
        self.lock().configurator = host_id;
    }

    /// Adds a guest. Returns false if it was already a guest.
    pub fn add_guest(&self, host_id: i32) -> bool {
        self.lock().guests.insert(host_id)
    }

    /// Removes a guest. Returns false if it was not a guest.
    pub fn remove_guest(&self, host_id: i32) -> bool {
        self.lock().guests.remove(&host_id)
    }

    /// True if the host is a guest.
    pub fn is_guest(&self, host_id: i32) -> bool {
        self.lock().guests.contains(&host_id)
    }
}

/// # Simple Device
///
/// A `Device` with no behaviour beyond role bookkeeping, an enabled flag and
/// an open/closed flag. Records the last startup context it was opened with.
#[derive(Debug)]
pub struct SimpleDevice {
    class_name: String,
    id: i32,
    enabled: AtomicBool,
    opened: AtomicBool,
    last_context: Mutex<Option<StartupContext>>,
    roles: DeviceRoles,
}

impl SimpleDevice {
    /// Creates an enabled, closed device owned by the given host.
    pub fn new(class_name: impl Into<String>, id: i32, owner: i32) -> Self {
        Self {
            class_name: class_name.into(),
            id,
            enabled: AtomicBool::new(true),
            opened: AtomicBool::new(false),
            last_context: Mutex::new(None),
            roles: DeviceRoles::new(owner),
        }
    }

    /// Enables or disables the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// True between `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// The context passed to the most recent `open`.
    pub fn last_context(&self) -> Option<StartupContext> {
        *self.last_context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Role bookkeeping.
    pub fn roles(&self) -> &DeviceRoles {
        &self.roles
    }
}

impl Device for SimpleDevice {
    fn device_class(&self) -> &str {
        &self.class_name
    }

    fn id(&self) -> i32 {
        self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_owner(&self, host_id: i32) -> bool {
        self.roles.owner() == host_id
    }

    fn is_configurator(&self, host_id: i32) -> bool {
        self.roles.configurator() == host_id
    }

    fn is_guest(&self, host_id: i32) -> bool {
        self.roles.is_guest(host_id)
    }

    fn has_owner(&self, host_id: i32) {
        self.roles.set_owner(host_id);
    }

    fn has_configurator(&self, host_id: i32) {
        self.roles.set_configurator(host_id);
    }

    fn add_guest(&self, host_id: i32) {
        self.roles.add_guest(host_id);
    }

    fn remove_guest(&self, host_id: i32) {
        self.roles.remove_guest(host_id);
    }

    fn open(&self, context: &StartupContext) {
        *self.last_context.lock().unwrap_or_else(PoisonError::into_inner) = Some(*context);
        self.opened.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }
}

/// # Device Registry
///
/// The set of devices known to the EGM, addressed by class name and id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<Arc<dyn Device>>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device, replacing any device with the same class and id.
    pub fn add(&self, device: Arc<dyn Device>) {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices.retain(|d| !(d.device_class() == device.device_class() && d.id() == device.id()));
        devices.push(device);
    }

    /// Removes a device. Returns it if it was present.
    pub fn remove(&self, class_name: &str, id: i32) -> Option<Arc<dyn Device>> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let pos = devices
            .iter()
            .position(|d| d.device_class() == class_name && d.id() == id)?;
        Some(devices.remove(pos))
    }

    /// Looks a device up by class and id.
    pub fn get(&self, class_name: &str, id: i32) -> Option<Arc<dyn Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.device_class() == class_name && d.id() == id)
            .cloned()
    }

    /// Every device, in insertion order.
    pub fn all(&self) -> Vec<Arc<dyn Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Devices owned by the host.
    pub fn owned_by(&self, host_id: i32) -> Vec<Arc<dyn Device>> {
        self.filter(|d| d.is_owner(host_id))
    }

    /// Devices on which the host holds any role.
    pub fn member_of(&self, host_id: i32) -> Vec<Arc<dyn Device>> {
        self.filter(|d| d.is_member(host_id))
    }

    fn filter(&self, predicate: impl Fn(&Arc<dyn Device>) -> bool) -> Vec<Arc<dyn Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|&d| predicate(d))
            .cloned()
            .collect()
    }
}

/// True if two device handles point at the same device.
pub fn same_device(a: &Arc<dyn Device>, b: &Arc<dyn Device>) -> bool {
    a.device_class() == b.device_class() && a.id() == b.id()
}
