//! # Protocol Commands
//!
//! The unit of G2S traffic. A [`Command`] wraps one opaque class element
//! ([`ClassCommand`]) with the header fields the engine needs for routing and
//! correlation: host id, session id, session type, command id and
//! time-to-live. The payload itself is carried as a `serde_json::Value` and is
//! never interpreted by the core; handlers own its meaning.
//!
//! ## Invariants
//!
//! - `session_id` is fixed when the command is built. Retries reuse it.
//! - `command_id` is assigned by the send pump at transport time, so every
//!   transmission (including retries) carries a fresh, host-scoped id.
//! - An `error` present on an inbound command short-circuits dispatch.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Host id reserved for the EGM itself.
pub const EGM_HOST_ID: i32 = 0;

/// Class name of the reserved communications class.
pub const COMMUNICATIONS_CLASS: &str = "communications";

/// Command type of the online/offline handshake in the communications class.
pub const COMMS_ON_LINE: &str = "commsOnLine";

/// # Error Code
///
/// An opaque protocol error code as it crosses the wire. The named constants
/// cover the codes the engine itself produces or reacts to; any other value
/// is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub String);

impl ErrorCode {
    /// No error.
    pub const NONE: &'static str = "G2S_none";
    /// The remote inbound queue is full; retry after the session timeout.
    pub const INBOUND_QUEUE_FULL: &'static str = "G2S_APX001";
    /// The local outbound queue reached its maximum depth.
    pub const OUTBOUND_QUEUE_FULL: &'static str = "G2S_APX002";
    /// No device matches the command's class and device id.
    pub const INVALID_DEVICE_ID: &'static str = "G2S_APX003";
    /// No registered handler declares the command's class.
    pub const CLASS_NOT_SUPPORTED: &'static str = "G2S_APX006";
    /// No registered handler accepts the command's concrete type.
    pub const COMMAND_NOT_SUPPORTED: &'static str = "G2S_APX007";
    /// Communications with the host are not online.
    pub const COMMS_NOT_ONLINE: &'static str = "G2S_APX008";
    /// The target device is disabled and the handler refuses disabled devices.
    pub const DEVICE_DISABLED: &'static str = "G2S_APX009";
    /// A handler failed in a way that has no more specific code.
    pub const UNEXPECTED_ERROR: &'static str = "G2S_APX999";

    /// Builds a code from its wire value.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The "no error" code.
    pub fn none() -> Self {
        Self::new(Self::NONE)
    }

    /// Returns the wire value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the "no error" code and for an empty code.
    pub fn is_none(&self) -> bool {
        self.0.is_empty() || self.0 == Self::NONE
    }

    /// True if this code equals the given wire value.
    pub fn is(&self, code: &str) -> bool {
        self.0 == code
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// An error attached to a command: code plus human-readable text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    /// Protocol error code.
    pub code: ErrorCode,
    /// Descriptive text sent alongside the code.
    pub text: String,
}

impl CommandError {
    /// Creates an error with the given code and text.
    pub fn new(code: &str, text: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::new(code),
            text: text.into(),
        }
    }

    /// Creates an error whose text is the default description of the code.
    pub fn from_code(code: &str) -> Self {
        Self::new(code, describe(code))
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.text)
    }
}

/// Default text for the codes the engine produces.
fn describe(code: &str) -> &'static str {
    match code {
        ErrorCode::NONE => "No error",
        ErrorCode::INBOUND_QUEUE_FULL => "Inbound queue full",
        ErrorCode::OUTBOUND_QUEUE_FULL => "Outbound queue full",
        ErrorCode::INVALID_DEVICE_ID => "Invalid device identifier",
        ErrorCode::CLASS_NOT_SUPPORTED => "Class not supported",
        ErrorCode::COMMAND_NOT_SUPPORTED => "Command not supported",
        ErrorCode::COMMS_NOT_ONLINE => "Communications not online",
        ErrorCode::DEVICE_DISABLED => "Device disabled",
        _ => "Unexpected error",
    }
}

/// Role of a command within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    /// Expects a response; tracked by a session.
    Request,
    /// Answers a request; correlated by session id.
    Response,
    /// Fire-and-forget.
    Notification,
}

/// # Class Command
///
/// The class element of a command: which class and device it addresses, the
/// concrete command type, and the opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassCommand {
    /// G2S class name (e.g. `communications`, `cabinet`).
    pub class_name: String,
    /// Device id within the class.
    pub device_id: i32,
    /// Concrete command type (e.g. `commsOnLine`, `getDeviceStatus`).
    pub command_type: String,
    /// Opaque command body.
    pub payload: Value,
}

impl ClassCommand {
    /// Creates a class command with an empty payload.
    pub fn new(class_name: impl Into<String>, device_id: i32, command_type: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            device_id,
            command_type: command_type.into(),
            payload: Value::Null,
        }
    }

    /// Replaces the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// True for the communications class online/offline handshake.
    pub fn is_comms_on_line(&self) -> bool {
        self.class_name == COMMUNICATIONS_CLASS && self.command_type == COMMS_ON_LINE
    }
}

/// # Command
///
/// One unit of protocol traffic, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Remote host this command is exchanged with.
    pub host_id: i32,
    /// Identifier of this EGM.
    pub egm_id: String,
    /// Host-scoped sequence number, assigned at transport send.
    pub command_id: i64,
    /// Session this command belongs to.
    pub session_id: i64,
    /// Role within the session.
    pub session_type: SessionType,
    /// Time after which the remote may discard the command.
    pub time_to_live: Duration,
    /// Creation timestamp.
    pub date_time: DateTime<Utc>,
    /// Error slot; `None` means no error.
    pub error: Option<CommandError>,
    /// The class element being carried.
    pub class: ClassCommand,
    /// Response fragments produced by a handler, in send order.
    pub responses: Vec<ClassCommand>,
}

impl Command {
    /// Builds a command for the given host and session.
    pub fn new(
        host_id: i32,
        egm_id: impl Into<String>,
        session_id: i64,
        session_type: SessionType,
        class: ClassCommand,
    ) -> Self {
        Self {
            host_id,
            egm_id: egm_id.into(),
            command_id: 0,
            session_id,
            session_type,
            time_to_live: Duration::ZERO,
            date_time: Utc::now(),
            error: None,
            class,
            responses: Vec::new(),
        }
    }

    /// Builds the response to an inbound command, carrying the given class
    /// element under the inbound command's session id.
    pub fn response_to(inbound: &Command, class: ClassCommand) -> Self {
        let mut response = Self::new(
            inbound.host_id,
            inbound.egm_id.clone(),
            inbound.session_id,
            SessionType::Response,
            class,
        );
        response.time_to_live = inbound.time_to_live;
        response
    }

    /// Sets the time-to-live.
    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    /// Attaches an error.
    pub fn with_error(mut self, error: CommandError) -> Self {
        self.error = Some(error);
        self
    }

    /// Class name of the carried class element.
    pub fn class_name(&self) -> &str {
        &self.class.class_name
    }

    /// Concrete command type of the carried class element.
    pub fn command_type(&self) -> &str {
        &self.class.command_type
    }

    /// Device id of the carried class element.
    pub fn device_id(&self) -> i32 {
        self.class.device_id
    }

    /// True if an error is attached.
    pub fn is_error(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.code.is_none())
    }

    /// Stamps an error built from one of the `ErrorCode` constants.
    pub fn set_error(&mut self, code: &str) {
        self.error = Some(CommandError::from_code(code));
    }

    /// True for a communications-class request, the traffic that proves the
    /// host is alive.
    pub fn is_communications_request(&self) -> bool {
        self.session_type == SessionType::Request && self.class.class_name == COMMUNICATIONS_CLASS
    }
}
