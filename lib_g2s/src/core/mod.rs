//! # Protocol Core Module
//!
//! The G2S protocol engine of the EGM. The components here move commands
//! between the EGM and its hosts: they route inbound commands to handlers,
//! track outstanding requests, queue and pump traffic per host, and manage
//! the registered hosts' lifecycle.
//!
//! ## Core Components:
//!
//! - **`command`**: the command model and protocol error codes.
//!
//! - **`registry`**: handler lookup keyed by class name and command type.
//!
//! - **`dispatcher`**: admission checks and verify/handle for inbound commands.
//!
//! - **`session`**: request sessions with retry-on-timeout and single
//!   completion.
//!
//! - **`command_queue`** and **`host_queue`**: the per-host orderings and the
//!   send and receive pumps that drain them.
//!
//! - **`host`** and **`egm`**: registered hosts, device role routing and the
//!   start/stop/restart lifecycle.
//!
//! - **`device`**, **`transport`**: the boundaries to devices and to the wire.
//!
//! - **`monitor`**: command events with a bounded replay history.

#![forbid(unsafe_code)]

pub mod command;
pub mod command_queue;
pub mod device;
/// Inbound command routing and admission checks.
pub mod dispatcher;
pub mod egm;
pub mod host;
/// Per-host send and receive pumps.
pub mod host_queue;
pub mod monitor;
/// Handler table keyed by class name and command type.
pub mod registry;
pub mod session;
pub mod transport;

// --- Public API Re-exports ---
pub use command::{ClassCommand, Command, CommandError, ErrorCode, SessionType, EGM_HOST_ID};
pub use command_queue::{CommandQueue, EnqueueError, QueueStats};
pub use device::{Device, DeviceRegistry, DeviceRoles, SimpleDevice, StartupContext};
pub use dispatcher::CommandDispatcher;
pub use egm::{EgmCore, EgmError};
pub use host::Host;
pub use host_queue::{HostQueue, HostState, RequestOptions};
pub use monitor::{CommandEvent, CommandMonitor, Direction, Subscription};
pub use registry::{CommandHandler, CommandKey, CommandRegistry, RegistryError};
pub use session::{Session, SessionCallback, SessionManager, SessionQueue, SessionStatus};
pub use transport::{
    ChannelReceiveEndpoint, EndpointProvider, InboundRouter, InboundSink, ReceiveEndpoint, SendEndpoint,
    StaticEndpoints, TransportResponse,
};
