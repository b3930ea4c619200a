//! Capability interfaces of the signaling/media engine.
//!
//! The orchestrator never speaks SIP itself. A concrete engine (a WebRTC
//! user agent, a native SIP stack, or [`crate::loopback::LoopbackEngine`])
//! implements [`SignalingEngine`] and [`SessionHandle`] and reports what
//! happens on the wire through [`EngineEvent`]s.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::audio::RemoteAudio;
use crate::config::UaConfig;

/// Stable identifier of one call, assigned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Who caused a session or an event on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Originator {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteIdentity {
    /// Full URI, e.g. `sip:1001@pbx.example.com`
    pub uri: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoldState {
    pub local: bool,
    pub remote: bool,
}

impl HoldState {
    /// On hold from either end.
    pub fn is_held(&self) -> bool {
        self.local || self.remote
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Options for placing or accepting a media session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    pub extra_headers: Vec<Header>,
    pub audio: bool,
    pub video: bool,
}

impl CallOptions {
    /// Audio-only media constraints, no extra headers.
    pub fn audio_only() -> Self {
        Self {
            extra_headers: Vec::new(),
            audio: true,
            video: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push(Header::new(name, value));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferOptions {
    pub extra_headers: Vec<Header>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid session state: {0}")]
    InvalidState(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Local outbound audio track of a session.
pub trait AudioSender: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
}

/// Control verbs of one underlying signaling/media session.
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> SessionId;
    fn direction(&self) -> Direction;
    fn remote_identity(&self) -> RemoteIdentity;

    fn is_established(&self) -> bool;
    fn is_in_progress(&self) -> bool;
    fn is_on_hold(&self) -> HoldState;

    fn answer(&self, options: &CallOptions) -> Result<(), EngineError>;
    fn hold(&self) -> Result<(), EngineError>;
    fn unhold(&self) -> Result<(), EngineError>;
    fn terminate(&self) -> Result<(), EngineError>;
    fn refer(&self, target: &str, options: &ReferOptions) -> Result<(), EngineError>;
    fn send_dtmf(&self, tones: &str) -> Result<(), EngineError>;

    /// Sender carrying the local microphone track, if one is attached.
    fn audio_sender(&self) -> Option<Arc<dyn AudioSender>>;
}

/// The signaling user agent.
///
/// Sessions returned by [`SignalingEngine::call`] must not be announced again
/// through [`EngineEvent::NewSession`]; that event is reserved for sessions
/// the engine creates on its own (inbound calls).
pub trait SignalingEngine: Send + Sync {
    /// Connect and register. Lifecycle events are delivered on `events`.
    fn start(&self, config: &UaConfig, events: EngineEventSender) -> Result<(), EngineError>;
    fn stop(&self) -> Result<(), EngineError>;
    fn call(&self, target: &str, options: &CallOptions) -> Result<Arc<dyn SessionHandle>, EngineError>;
}

pub type EngineEventSender = UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = UnboundedReceiver<EngineEvent>;

/// Primitive events of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Progress { originator: Originator },
    Accepted { originator: Originator, status_code: Option<u16> },
    Confirmed { originator: Originator, ack: Option<String> },
    Muted,
    Unmuted,
    Hold { originator: Originator },
    Unhold { originator: Originator },
    Ended { originator: Originator, message: Option<String>, cause: String },
    Failed { originator: Originator, message: Option<String>, cause: String },
    PeerReady(RemoteAudio),
}

/// Everything the engine reports to the orchestrator.
#[derive(Clone)]
pub enum EngineEvent {
    Connected,
    Disconnected,
    Registered,
    Unregistered,
    RegistrationFailed { cause: String },
    NewSession { session: Arc<dyn SessionHandle>, originator: Originator },
    Session { session_id: SessionId, event: SessionEvent },
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("Connected"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Registered => f.write_str("Registered"),
            Self::Unregistered => f.write_str("Unregistered"),
            Self::RegistrationFailed { cause } => f
                .debug_struct("RegistrationFailed")
                .field("cause", cause)
                .finish(),
            Self::NewSession { session, originator } => f
                .debug_struct("NewSession")
                .field("session_id", &session.id())
                .field("originator", originator)
                .finish(),
            Self::Session { session_id, event } => f
                .debug_struct("Session")
                .field("session_id", session_id)
                .field("event", event)
                .finish(),
        }
    }
}
