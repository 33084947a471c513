//! # Command Handler Registry
//!
//! Maps a `(class name, command type)` pair to the handler that serves it.
//! Handlers declare every pair they support; registration claims all of them
//! or none. A second claim on an already-served pair is an error.
//!
//! The lookup is resolved once per inbound command by the dispatcher. There is
//! no runtime type switching: the concrete command type travels on the
//! command as a string and is the second half of the key.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::command::{Command, CommandError};

/// Key under which a handler is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandKey {
    /// G2S class name.
    pub class_name: String,
    /// Concrete command type.
    pub command_type: String,
}

impl CommandKey {
    /// Creates a key.
    pub fn new(class_name: impl Into<String>, command_type: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            command_type: command_type.into(),
        }
    }

    /// The key addressing a command.
    pub fn of(command: &Command) -> Self {
        Self::new(command.class_name(), command.command_type())
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.command_type)
    }
}

/// # Command Handler
///
/// Business logic for one or more command types. `verify` runs first and may
/// reject the command with a protocol error; `handle` only runs when verify
/// returned `Ok(None)`. Handlers write their response fragments into
/// `command.responses`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Every `(class, command type)` pair this handler serves.
    fn supported_commands(&self) -> Vec<CommandKey>;

    /// True if the handler must not run against a disabled device.
    fn prohibited_when_disabled(&self) -> bool {
        false
    }

    /// Validates the command. `Ok(Some(error))` rejects it with that error.
    async fn verify(&self, command: &Command) -> anyhow::Result<Option<CommandError>>;

    /// Executes the command.
    async fn handle(&self, command: &mut Command) -> anyhow::Result<()>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler is already registered for {key}")]
    DuplicateHandler { key: CommandKey },

    #[error("handler declares no supported commands")]
    NothingToRegister,
}

/// # Command Registry
///
/// Thread-safe handler table shared by the dispatcher and whoever configures
/// the EGM.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<CommandKey, Arc<dyn CommandHandler>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under every pair it declares.
    ///
    /// # Errors
    /// `RegistryError::DuplicateHandler` if any declared pair is taken; in that
    /// case nothing is registered.
    pub fn register(&self, handler: Arc<dyn CommandHandler>) -> Result<(), RegistryError> {
        let keys = handler.supported_commands();
        if keys.is_empty() {
            return Err(RegistryError::NothingToRegister);
        }

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(taken) = keys.iter().find(|key| handlers.contains_key(*key)) {
            return Err(RegistryError::DuplicateHandler { key: taken.clone() });
        }

        for key in keys {
            tracing::debug!(target: "lib_g2s::registry", %key, "handler registered");
            handlers.insert(key, Arc::clone(&handler));
        }
        Ok(())
    }

    /// The handler for the command's exact class and command type.
    pub fn lookup(&self, command: &Command) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&CommandKey::of(command))
            .cloned()
    }

    /// True if any handler serves the command's class, whatever the type.
    pub fn is_class_supported(&self, command: &Command) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|key| key.class_name == command.class_name())
    }

    /// Number of registered pairs.
    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every registration.
    pub fn clear(&self) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::{ClassCommand, SessionType};

    struct NoopHandler(Vec<CommandKey>);

    #[async_trait]
    impl CommandHandler for NoopHandler {
        fn supported_commands(&self) -> Vec<CommandKey> {
            self.0.clone()
        }

        async fn verify(&self, _command: &Command) -> anyhow::Result<Option<CommandError>> {
            Ok(None)
        }

        async fn handle(&self, _command: &mut Command) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn command(class_name: &str, command_type: &str) -> Command {
        Command::new(1, "EGM", 1, SessionType::Request, ClassCommand::new(class_name, 1, command_type))
    }

    #[test]
    fn test_lookup_matches_class_and_type() {
        let registry = CommandRegistry::new();
        registry
            .register(Arc::new(NoopHandler(vec![CommandKey::new("cabinet", "getCabinetStatus")])))
            .unwrap();

        assert!(registry.lookup(&command("cabinet", "getCabinetStatus")).is_some());
        assert!(registry.lookup(&command("cabinet", "setCabinetState")).is_none());
        assert!(registry.is_class_supported(&command("cabinet", "setCabinetState")));
        assert!(!registry.is_class_supported(&command("meters", "getMeterInfo")));
    }

    #[test]
    fn test_duplicate_registration_is_rejected_atomically() {
        let registry = CommandRegistry::new();
        registry
            .register(Arc::new(NoopHandler(vec![CommandKey::new("cabinet", "getCabinetStatus")])))
            .unwrap();

        let result = registry.register(Arc::new(NoopHandler(vec![
            CommandKey::new("cabinet", "setCabinetState"),
            CommandKey::new("cabinet", "getCabinetStatus"),
        ])));

        assert_eq!(
            result,
            Err(RegistryError::DuplicateHandler {
                key: CommandKey::new("cabinet", "getCabinetStatus")
            })
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&command("cabinet", "setCabinetState")).is_none());
    }

    #[test]
    fn test_clear_removes_everything() {
        let registry = CommandRegistry::new();
        registry
            .register(Arc::new(NoopHandler(vec![
                CommandKey::new("communications", "commsOnLine"),
                CommandKey::new("communications", "keepAlive"),
            ])))
            .unwrap();
        assert_eq!(registry.len(), 2);
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.lookup(&command("communications", "keepAlive")).is_none());
    }
}
