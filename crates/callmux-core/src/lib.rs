//! Callmux core: multi-call orchestration for a SIP softphone.
//!
//! Pure Rust crate with no engine dependency. A signaling/media engine plugs
//! in through the traits of [`engine`]; consumers observe calls through the
//! [`events::EventBus`].

pub mod audio;
pub mod binder;
mod calls;
pub mod cause;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod loopback;
pub mod phone;
pub mod registry;
pub mod transfer;
pub mod uri;

pub use audio::{AudioSink, PlayoutRouter, RemoteAudio};
pub use cause::FailureCause;
pub use config::{PhoneSettings, UaConfig};
pub use engine::{Direction, EngineEvent, Originator, SessionEvent, SessionId, SignalingEngine};
pub use errors::PhoneError;
pub use events::{ConnectionState, EventTopic, PhoneEvent, PhoneEventListener};
pub use phone::PhoneManager;
pub use registry::{CallInfo, CallState};
