//! In-memory signaling engine.
//!
//! Plays both the local user agent and the remote parties: the orchestrator
//! drives it through [`SignalingEngine`]/[`SessionHandle`], while tests and the
//! simulator script the far end with the `remote_*` methods. Every request the
//! orchestrator issues is appended to an ordered journal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::audio::RemoteAudio;
use crate::config::UaConfig;
use crate::engine::{
    AudioSender, CallOptions, Direction, EngineError, EngineEvent, EngineEventSender, Header,
    HoldState, Originator, ReferOptions, RemoteIdentity, SessionEvent, SessionHandle, SessionId,
    SignalingEngine,
};

/// A request issued to the engine, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    Start { uri: String },
    Stop,
    Call { target: String, headers: Vec<Header> },
    Answer { session_id: SessionId },
    Hold { session_id: SessionId },
    Unhold { session_id: SessionId },
    Terminate { session_id: SessionId },
    Refer { session_id: SessionId, target: String, headers: Vec<Header> },
    SendDtmf { session_id: SessionId, tones: String },
}

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// `start` reports `Connected` then `Registered`.
    pub auto_register: bool,
    /// Control verbs report the session events a real engine would.
    pub echo_control_events: bool,
    /// New sessions carry a microphone sender.
    pub audio_sender: bool,
    /// When set, `call` fails with this transport error.
    pub fail_calls: Option<String>,
    /// When set, `refer` is rejected with this reason.
    pub fail_refer: Option<String>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            auto_register: true,
            echo_control_events: true,
            audio_sender: true,
            fail_calls: None,
            fail_refer: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    options: Mutex<LoopbackOptions>,
    journal: Mutex<Vec<EngineRequest>>,
    events: Mutex<Option<EngineEventSender>>,
    sessions: Mutex<HashMap<SessionId, Arc<LoopbackSession>>>,
}

impl Shared {
    fn record(&self, request: EngineRequest) {
        lock(&self.journal).push(request);
    }

    fn options(&self) -> LoopbackOptions {
        lock(&self.options).clone()
    }

    fn emit(&self, event: EngineEvent) {
        match lock(&self.events).as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!("loopback: event receiver dropped");
                }
            }
            None => tracing::debug!("loopback: not started, dropping {event:?}"),
        }
    }
}

#[derive(Clone)]
pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::with_options(LoopbackOptions::default())
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options: Mutex::new(options),
                journal: Mutex::new(Vec::new()),
                events: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn update_options(&self, f: impl FnOnce(&mut LoopbackOptions)) {
        f(&mut lock(&self.shared.options));
    }

    /// Every request issued so far, oldest first.
    pub fn journal(&self) -> Vec<EngineRequest> {
        lock(&self.shared.journal).clone()
    }

    pub fn clear_journal(&self) {
        lock(&self.shared.journal).clear();
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Arc<LoopbackSession>> {
        lock(&self.shared.sessions).get(session_id).cloned()
    }

    /// Report a raw engine event.
    pub fn emit(&self, event: EngineEvent) {
        self.shared.emit(event);
    }

    /// A remote party calls us.
    pub fn incoming(&self, from_uri: &str, display_name: Option<&str>) -> SessionId {
        let session = self.new_session(
            Direction::Incoming,
            RemoteIdentity {
                uri: from_uri.to_string(),
                display_name: display_name.map(str::to_string),
            },
        );
        let id = session.id.clone();
        self.shared.emit(EngineEvent::NewSession {
            session,
            originator: Originator::Remote,
        });
        id
    }

    pub fn remote_ringing(&self, session_id: &SessionId) -> Result<(), EngineError> {
        self.require(session_id)?;
        self.emit_session(session_id, SessionEvent::Progress { originator: Originator::Remote });
        Ok(())
    }

    /// The far end accepts one of our outbound calls.
    pub fn remote_answer(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let session = self.require(session_id)?;
        session.set_status(SessionStatus::Established);
        self.emit_session(
            session_id,
            SessionEvent::Accepted {
                originator: Originator::Remote,
                status_code: Some(200),
            },
        );
        self.emit_session(
            session_id,
            SessionEvent::Confirmed {
                originator: Originator::Local,
                ack: None,
            },
        );
        Ok(())
    }

    pub fn remote_hangup(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let session = self.require(session_id)?;
        session.set_status(SessionStatus::Terminated);
        self.emit_session(
            session_id,
            SessionEvent::Ended {
                originator: Originator::Remote,
                message: None,
                cause: "Terminated".to_string(),
            },
        );
        Ok(())
    }

    pub fn remote_fail(&self, session_id: &SessionId, cause: &str) -> Result<(), EngineError> {
        let session = self.require(session_id)?;
        session.set_status(SessionStatus::Terminated);
        self.emit_session(
            session_id,
            SessionEvent::Failed {
                originator: Originator::Remote,
                message: None,
                cause: cause.to_string(),
            },
        );
        Ok(())
    }

    pub fn remote_hold(&self, session_id: &SessionId, on_hold: bool) -> Result<(), EngineError> {
        let session = self.require(session_id)?;
        session.set_remote_hold(on_hold);
        let event = if on_hold {
            SessionEvent::Hold { originator: Originator::Remote }
        } else {
            SessionEvent::Unhold { originator: Originator::Remote }
        };
        self.emit_session(session_id, event);
        Ok(())
    }

    pub fn peer_ready(&self, session_id: &SessionId, audio: RemoteAudio) -> Result<(), EngineError> {
        self.require(session_id)?;
        self.emit_session(session_id, SessionEvent::PeerReady(audio));
        Ok(())
    }

    fn emit_session(&self, session_id: &SessionId, event: SessionEvent) {
        self.shared.emit(EngineEvent::Session {
            session_id: session_id.clone(),
            event,
        });
    }

    fn require(&self, session_id: &SessionId) -> Result<Arc<LoopbackSession>, EngineError> {
        self.session(session_id)
            .ok_or_else(|| EngineError::InvalidState(format!("unknown session {session_id}")))
    }

    fn new_session(&self, direction: Direction, remote: RemoteIdentity) -> Arc<LoopbackSession> {
        let audio = self
            .shared
            .options()
            .audio_sender
            .then(|| Arc::new(LoopbackAudioSender::new()));
        let session = Arc::new(LoopbackSession {
            id: SessionId::new(uuid::Uuid::new_v4().to_string()),
            direction,
            remote,
            state: Mutex::new(SessionState::default()),
            audio,
            engine: Arc::downgrade(&self.shared),
        });
        lock(&self.shared.sessions).insert(session.id.clone(), session.clone());
        session
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingEngine for LoopbackEngine {
    fn start(&self, config: &UaConfig, events: EngineEventSender) -> Result<(), EngineError> {
        self.shared.record(EngineRequest::Start {
            uri: config.uri.clone(),
        });
        *lock(&self.shared.events) = Some(events);
        if self.shared.options().auto_register {
            self.shared.emit(EngineEvent::Connected);
            self.shared.emit(EngineEvent::Registered);
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        self.shared.record(EngineRequest::Stop);
        self.shared.emit(EngineEvent::Unregistered);
        self.shared.emit(EngineEvent::Disconnected);
        lock(&self.shared.events).take();
        Ok(())
    }

    fn call(&self, target: &str, options: &CallOptions) -> Result<Arc<dyn SessionHandle>, EngineError> {
        self.shared.record(EngineRequest::Call {
            target: target.to_string(),
            headers: options.extra_headers.clone(),
        });
        if let Some(reason) = self.shared.options().fail_calls {
            return Err(EngineError::Transport(reason));
        }
        let session = self.new_session(
            Direction::Outgoing,
            RemoteIdentity {
                uri: target.to_string(),
                display_name: None,
            },
        );
        Ok(session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    InProgress,
    Established,
    Terminated,
}

#[derive(Debug, Default)]
struct SessionState {
    status: SessionStatus,
    hold: HoldState,
}

pub struct LoopbackSession {
    id: SessionId,
    direction: Direction,
    remote: RemoteIdentity,
    state: Mutex<SessionState>,
    audio: Option<Arc<LoopbackAudioSender>>,
    engine: Weak<Shared>,
}

impl LoopbackSession {
    /// A session with no engine behind it: verbs update state only.
    pub fn standalone(id: &str, direction: Direction, remote_uri: &str) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::from(id),
            direction,
            remote: RemoteIdentity {
                uri: remote_uri.to_string(),
                display_name: None,
            },
            state: Mutex::new(SessionState::default()),
            audio: Some(Arc::new(LoopbackAudioSender::new())),
            engine: Weak::new(),
        })
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    pub fn set_status(&self, status: SessionStatus) {
        lock(&self.state).status = status;
    }

    /// Whether the far end holds the call.
    pub fn set_remote_hold(&self, on_hold: bool) {
        lock(&self.state).hold.remote = on_hold;
    }

    /// The loopback microphone, to observe what mute did.
    pub fn microphone(&self) -> Option<Arc<LoopbackAudioSender>> {
        self.audio.clone()
    }

    fn record(&self, request: EngineRequest) {
        if let Some(engine) = self.engine.upgrade() {
            engine.record(request);
        }
    }

    fn echo(&self, event: SessionEvent) {
        let Some(engine) = self.engine.upgrade() else { return };
        if engine.options().echo_control_events {
            engine.emit(EngineEvent::Session {
                session_id: self.id.clone(),
                event,
            });
        }
    }

    fn require_established(&self, verb: &str) -> Result<(), EngineError> {
        if self.status() == SessionStatus::Established {
            Ok(())
        } else {
            Err(EngineError::InvalidState(format!("{verb} needs an established session")))
        }
    }
}

impl SessionHandle for LoopbackSession {
    fn id(&self) -> SessionId {
        self.id.clone()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn remote_identity(&self) -> RemoteIdentity {
        self.remote.clone()
    }

    fn is_established(&self) -> bool {
        self.status() == SessionStatus::Established
    }

    fn is_in_progress(&self) -> bool {
        self.status() == SessionStatus::InProgress
    }

    fn is_on_hold(&self) -> HoldState {
        lock(&self.state).hold
    }

    fn answer(&self, _options: &CallOptions) -> Result<(), EngineError> {
        if self.direction != Direction::Incoming || self.status() != SessionStatus::InProgress {
            return Err(EngineError::InvalidState("answer needs a ringing incoming session".into()));
        }
        self.record(EngineRequest::Answer { session_id: self.id.clone() });
        self.set_status(SessionStatus::Established);
        self.echo(SessionEvent::Accepted {
            originator: Originator::Local,
            status_code: None,
        });
        self.echo(SessionEvent::Confirmed {
            originator: Originator::Remote,
            ack: Some("ACK".to_string()),
        });
        Ok(())
    }

    fn hold(&self) -> Result<(), EngineError> {
        self.require_established("hold")?;
        if std::mem::replace(&mut lock(&self.state).hold.local, true) {
            return Ok(());
        }
        self.record(EngineRequest::Hold { session_id: self.id.clone() });
        self.echo(SessionEvent::Hold { originator: Originator::Local });
        Ok(())
    }

    fn unhold(&self) -> Result<(), EngineError> {
        self.require_established("unhold")?;
        if !std::mem::replace(&mut lock(&self.state).hold.local, false) {
            return Ok(());
        }
        self.record(EngineRequest::Unhold { session_id: self.id.clone() });
        self.echo(SessionEvent::Unhold { originator: Originator::Local });
        Ok(())
    }

    fn terminate(&self) -> Result<(), EngineError> {
        let previous = std::mem::replace(&mut lock(&self.state).status, SessionStatus::Terminated);
        if previous == SessionStatus::Terminated {
            return Err(EngineError::InvalidState("session already terminated".into()));
        }
        self.record(EngineRequest::Terminate { session_id: self.id.clone() });
        let event = match (previous, self.direction) {
            (SessionStatus::Established, _) => SessionEvent::Ended {
                originator: Originator::Local,
                message: None,
                cause: "Terminated".to_string(),
            },
            (_, Direction::Outgoing) => SessionEvent::Failed {
                originator: Originator::Local,
                message: None,
                cause: "Canceled".to_string(),
            },
            (_, Direction::Incoming) => SessionEvent::Failed {
                originator: Originator::Local,
                message: None,
                cause: "Rejected".to_string(),
            },
        };
        self.echo(event);
        Ok(())
    }

    fn refer(&self, target: &str, options: &ReferOptions) -> Result<(), EngineError> {
        self.require_established("refer")?;
        if let Some(reason) = self.engine.upgrade().and_then(|e| e.options().fail_refer) {
            return Err(EngineError::Rejected(reason));
        }
        self.record(EngineRequest::Refer {
            session_id: self.id.clone(),
            target: target.to_string(),
            headers: options.extra_headers.clone(),
        });
        Ok(())
    }

    fn send_dtmf(&self, tones: &str) -> Result<(), EngineError> {
        self.require_established("send_dtmf")?;
        self.record(EngineRequest::SendDtmf {
            session_id: self.id.clone(),
            tones: tones.to_string(),
        });
        Ok(())
    }

    fn audio_sender(&self) -> Option<Arc<dyn AudioSender>> {
        self.audio.clone().map(|a| a as Arc<dyn AudioSender>)
    }
}

pub struct LoopbackAudioSender {
    enabled: AtomicBool,
}

impl LoopbackAudioSender {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }
}

impl AudioSender for LoopbackAudioSender {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
