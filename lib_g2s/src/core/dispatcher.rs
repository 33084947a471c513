//! # Inbound Command Dispatcher
//!
//! The `CommandDispatcher` is the single entry point through which every
//! inbound, non-response command reaches business logic. It resolves the
//! target device and the handler, applies the protocol's admission checks, and
//! then runs the handler's `verify` and `handle` steps.
//!
//! ## Core Design Principles:
//!
//! 1.  **Ordered Admission**: checks run in a fixed order and the first failure
//!     wins: device exists, class supported, command supported, device enabled
//!     (for handlers that refuse disabled devices). Each failure stamps its own
//!     protocol error code on the command.
//!
//! 2.  **Nothing Escapes**: handler errors and handler panics are caught at
//!     this boundary, logged with host, class and command context, and turned
//!     into `UNEXPECTED_ERROR` on the command. The caller only ever sees a
//!     command with an error slot.
//!
//! 3.  **Injected Collaborators**: the handler registry and the device set are
//!     passed in at construction. There is no global lookup.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::core::command::{Command, ErrorCode};
use crate::core::device::DeviceRegistry;
use crate::core::registry::CommandRegistry;

/// # Command Dispatcher
pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
    devices: Arc<DeviceRegistry>,
}

impl CommandDispatcher {
    /// Creates a dispatcher over the given handlers and devices.
    pub fn new(registry: Arc<CommandRegistry>, devices: Arc<DeviceRegistry>) -> Self {
        Self { registry, devices }
    }

    /// The handler registry.
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// The device set.
    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// Routes an inbound command to its handler.
    ///
    /// Returns `true` when a response is owed to the sender. The only `false`
    /// case is an inbound command that already carried an error; such a
    /// command is left untouched.
    pub async fn dispatch(&self, command: &mut Command) -> bool {
        if command.is_error() {
            tracing::debug!(
                target: "lib_g2s::dispatcher",
                host_id = command.host_id,
                session_id = command.session_id,
                class = command.class_name(),
                command = command.command_type(),
                "inbound command already carries an error, not dispatched"
            );
            return false;
        }

        let Some(device) = self.devices.get(command.class_name(), command.device_id()) else {
            self.reject(command, ErrorCode::INVALID_DEVICE_ID);
            return true;
        };

        if !self.registry.is_class_supported(command) {
            self.reject(command, ErrorCode::CLASS_NOT_SUPPORTED);
            return true;
        }

        let Some(handler) = self.registry.lookup(command) else {
            self.reject(command, ErrorCode::COMMAND_NOT_SUPPORTED);
            return true;
        };

        if !device.is_enabled() && handler.prohibited_when_disabled() {
            self.reject(command, ErrorCode::DEVICE_DISABLED);
            return true;
        }

        match AssertUnwindSafe(handler.verify(command)).catch_unwind().await {
            Ok(Ok(None)) => {}
            Ok(Ok(Some(error))) => {
                tracing::debug!(
                    target: "lib_g2s::dispatcher",
                    host_id = command.host_id,
                    class = command.class_name(),
                    command = command.command_type(),
                    code = %error.code,
                    "command rejected by verify"
                );
                command.error = Some(error);
                return true;
            }
            Ok(Err(e)) => {
                self.fail(command, "verify", &e.to_string());
                return true;
            }
            Err(panic) => {
                self.fail(command, "verify", &panic_message(panic.as_ref()));
                return true;
            }
        }

        match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(command, "handle", &e.to_string()),
            Err(panic) => self.fail(command, "handle", &panic_message(panic.as_ref())),
        }

        true
    }

    fn reject(&self, command: &mut Command, code: &str) {
        tracing::debug!(
            target: "lib_g2s::dispatcher",
            host_id = command.host_id,
            class = command.class_name(),
            command = command.command_type(),
            device_id = command.device_id(),
            code,
            "command rejected"
        );
        command.set_error(code);
    }

    fn fail(&self, command: &mut Command, step: &'static str, reason: &str) {
        tracing::error!(
            target: "lib_g2s::dispatcher",
            host_id = command.host_id,
            session_id = command.session_id,
            class = command.class_name(),
            command = command.command_type(),
            step,
            reason,
            "command handler failed"
        );
        command.set_error(ErrorCode::UNEXPECTED_ERROR);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::{ClassCommand, CommandError, SessionType};
    use crate::core::device::SimpleDevice;
    use crate::core::registry::{CommandHandler, CommandKey};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        prohibited: bool,
        reject: bool,
        fail: bool,
        panic: bool,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for CountingHandler {
        fn supported_commands(&self) -> Vec<CommandKey> {
            vec![CommandKey::new("cabinet", "getCabinetStatus")]
        }

        fn prohibited_when_disabled(&self) -> bool {
            self.prohibited
        }

        async fn verify(&self, _command: &Command) -> anyhow::Result<Option<CommandError>> {
            if self.reject {
                return Ok(Some(CommandError::new("G2S_CBX001", "bad request")));
            }
            Ok(None)
        }

        async fn handle(&self, command: &mut Command) -> anyhow::Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("boom");
            }
            if self.fail {
                anyhow::bail!("storage offline");
            }
            command
                .responses
                .push(ClassCommand::new("cabinet", command.device_id(), "cabinetStatus"));
            Ok(())
        }
    }

    fn setup(handler: Arc<CountingHandler>) -> (CommandDispatcher, Arc<SimpleDevice>) {
        let registry = Arc::new(CommandRegistry::new());
        registry.register(handler).unwrap();
        let devices = Arc::new(DeviceRegistry::new());
        let cabinet = Arc::new(SimpleDevice::new("cabinet", 1, 2));
        devices.add(cabinet.clone());
        (CommandDispatcher::new(registry, devices), cabinet)
    }

    fn request(class_name: &str, device_id: i32, command_type: &str) -> Command {
        Command::new(
            2,
            "EGM",
            10,
            SessionType::Request,
            ClassCommand::new(class_name, device_id, command_type),
        )
    }

    fn code(command: &Command) -> &str {
        command.error.as_ref().map(|e| e.code.as_str()).unwrap_or("")
    }

    #[tokio::test]
    async fn test_unknown_device_is_invalid_device_id() {
        let (dispatcher, _) = setup(Arc::new(CountingHandler::default()));
        let mut command = request("cabinet", 9, "getCabinetStatus");
        assert!(dispatcher.dispatch(&mut command).await);
        assert_eq!(code(&command), ErrorCode::INVALID_DEVICE_ID);
    }

    #[tokio::test]
    async fn test_unsupported_class_and_command() {
        let (dispatcher, _) = setup(Arc::new(CountingHandler::default()));
        dispatcher.devices().add(Arc::new(SimpleDevice::new("meters", 1, 2)));

        let mut command = request("meters", 1, "getMeterInfo");
        assert!(dispatcher.dispatch(&mut command).await);
        assert_eq!(code(&command), ErrorCode::CLASS_NOT_SUPPORTED);

        let mut command = request("cabinet", 1, "setCabinetState");
        assert!(dispatcher.dispatch(&mut command).await);
        assert_eq!(code(&command), ErrorCode::COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_disabled_device_never_reaches_handle() {
        let handler = Arc::new(CountingHandler {
            prohibited: true,
            ..Default::default()
        });
        let (dispatcher, cabinet) = setup(handler.clone());
        cabinet.set_enabled(false);

        let mut command = request("cabinet", 1, "getCabinetStatus");
        assert!(dispatcher.dispatch(&mut command).await);
        assert_eq!(code(&command), ErrorCode::DEVICE_DISABLED);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_device_allowed_when_handler_permits() {
        let handler = Arc::new(CountingHandler::default());
        let (dispatcher, cabinet) = setup(handler.clone());
        cabinet.set_enabled(false);

        let mut command = request("cabinet", 1, "getCabinetStatus");
        assert!(dispatcher.dispatch(&mut command).await);
        assert!(!command.is_error());
        assert_eq!(command.responses.len(), 1);
    }

    #[tokio::test]
    async fn test_verify_error_skips_handle() {
        let handler = Arc::new(CountingHandler {
            reject: true,
            ..Default::default()
        });
        let (dispatcher, _) = setup(handler.clone());

        let mut command = request("cabinet", 1, "getCabinetStatus");
        assert!(dispatcher.dispatch(&mut command).await);
        assert_eq!(code(&command), "G2S_CBX001");
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_unexpected_error() {
        let (dispatcher, _) = setup(Arc::new(CountingHandler {
            fail: true,
            ..Default::default()
        }));
        let mut command = request("cabinet", 1, "getCabinetStatus");
        assert!(dispatcher.dispatch(&mut command).await);
        assert_eq!(code(&command), ErrorCode::UNEXPECTED_ERROR);

        let (dispatcher, _) = setup(Arc::new(CountingHandler {
            panic: true,
            ..Default::default()
        }));
        let mut command = request("cabinet", 1, "getCabinetStatus");
        assert!(dispatcher.dispatch(&mut command).await);
        assert_eq!(code(&command), ErrorCode::UNEXPECTED_ERROR);
    }

    #[tokio::test]
    async fn test_inbound_error_suppresses_response() {
        let handler = Arc::new(CountingHandler::default());
        let (dispatcher, _) = setup(handler.clone());

        let mut command = request("cabinet", 1, "getCabinetStatus")
            .with_error(CommandError::from_code(ErrorCode::COMMS_NOT_ONLINE));
        assert!(!dispatcher.dispatch(&mut command).await);
        assert_eq!(code(&command), ErrorCode::COMMS_NOT_ONLINE);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    }
}
