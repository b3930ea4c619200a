use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::audio::AudioSink;
use crate::binder::{Lifecycle, SessionBinder};
use crate::config::{PhoneSettings, UaConfig};
use crate::engine::{
    EngineEvent, EngineEventReceiver, Header, Originator, ReferOptions, SessionEvent, SessionHandle,
    SessionId, SignalingEngine,
};
use crate::errors::PhoneError;
use crate::events::{
    AccountStatus, ConnectionState, EventBus, EventTopic, PhoneEvent, PhoneEventListener, SocketStatus,
    SubscriptionId,
};
use crate::registry::{CallInfo, CallRecord, CallRegistry};
use crate::transfer::{TransferAction, TransferBook};

/// Mutable orchestrator state. Every engine event and every verb runs to
/// completion while holding it, so a call never changes under another's feet.
#[derive(Default)]
pub(crate) struct PhoneState {
    pub(crate) connection: ConnectionState,
    /// Account the engine was started with.
    pub(crate) account: Option<UaConfig>,
    pub(crate) registry: CallRegistry,
    pub(crate) binders: HashMap<SessionId, SessionBinder>,
    pub(crate) transfers: TransferBook,
}

/// Tracks every active call of one account and drives them through the engine.
///
/// Cheap to clone; clones share the same calls and listeners.
#[derive(Clone)]
pub struct PhoneManager {
    pub(crate) engine: Arc<dyn SignalingEngine>,
    pub(crate) emitter: EventBus,
    pub(crate) settings: Arc<Mutex<PhoneSettings>>,
    pub(crate) state: Arc<Mutex<PhoneState>>,
    pub(crate) audio_sink: Option<Arc<dyn AudioSink>>,
    event_loop: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PhoneManager {
    pub fn new(engine: Arc<dyn SignalingEngine>, settings: PhoneSettings) -> Self {
        Self {
            engine,
            emitter: EventBus::new(),
            settings: Arc::new(Mutex::new(settings)),
            state: Arc::new(Mutex::new(PhoneState::default())),
            audio_sink: None,
            event_loop: Arc::new(Mutex::new(None)),
        }
    }

    /// Route remote call audio to `sink`.
    pub fn with_audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    /// Register a listener for one topic.
    pub fn subscribe(&self, topic: EventTopic, listener: Arc<dyn PhoneEventListener>) -> SubscriptionId {
        self.emitter.subscribe(topic, listener)
    }

    /// Register a listener for every topic.
    pub fn add_listener(&self, listener: Arc<dyn PhoneEventListener>) -> SubscriptionId {
        self.emitter.subscribe_all(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    /// Set the account parameters used by the next [`connect`](Self::connect).
    pub async fn set_parameters(
        &self,
        host: &str,
        port: Option<u16>,
        username: &str,
        secret: &str,
    ) -> Result<(), PhoneError> {
        self.settings
            .lock()
            .await
            .set_parameters(host, port, username, secret)
            .inspect_err(|e| tracing::warn!("set_parameters: {e}"))
    }

    pub async fn settings(&self) -> PhoneSettings {
        self.settings.lock().await.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.connection
    }

    /// Snapshot of the active calls, oldest first.
    pub async fn calls(&self) -> Vec<CallInfo> {
        self.state.lock().await.registry.snapshot()
    }

    /// Start the engine and process its events on a background task.
    pub async fn connect(&self) -> Result<(), PhoneError> {
        let events = self.connect_detached().await?;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.event_loop(events).await;
        });
        if let Some(previous) = self.event_loop.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Start the engine and hand its events to the caller.
    ///
    /// For hosts that run their own loop: feed each received event to
    /// [`handle_engine_event`](Self::handle_engine_event).
    pub async fn connect_detached(&self) -> Result<EngineEventReceiver, PhoneError> {
        let ua = self
            .settings
            .lock()
            .await
            .validate()
            .inspect_err(|e| tracing::warn!("connect: {e}"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.start(&ua, tx).inspect_err(|e| {
            tracing::error!("connect: engine failed to start: {e}");
        })?;
        tracing::info!("connecting {} via {}", ua.uri, ua.socket_url);

        self.state.lock().await.account = Some(ua);
        Ok(rx)
    }

    /// Unregister the account and stop the engine.
    pub async fn unregister(&self) -> Result<(), PhoneError> {
        self.engine
            .stop()
            .inspect_err(|e| tracing::error!("unregister: {e}"))?;
        tracing::info!("unregister requested");
        Ok(())
    }

    /// Apply one engine event.
    pub async fn handle_engine_event(&self, event: EngineEvent) {
        let mut state = self.state.lock().await;
        let extension = state
            .account
            .as_ref()
            .map(|ua| ua.extension.clone())
            .unwrap_or_default();

        match event {
            EngineEvent::Connected => {
                state.connection.socket_status = SocketStatus::Up;
                tracing::info!("signaling socket connected");
                self.emitter.publish(PhoneEvent::Connected);
            }

            EngineEvent::Disconnected => {
                state.connection.socket_status = SocketStatus::Down;
                tracing::info!("signaling socket disconnected");
                self.emitter.publish(PhoneEvent::Disconnected);
            }

            EngineEvent::Registered => {
                state.connection.account_status = AccountStatus::Registered;
                tracing::info!("extension {extension} registered");
                self.emitter.publish(PhoneEvent::Registered {
                    extension,
                    registered: true,
                });
            }

            EngineEvent::Unregistered => {
                state.connection.account_status = AccountStatus::Unregistered;
                tracing::info!("extension {extension} unregistered");
                self.emitter.publish(PhoneEvent::Unregistered {
                    extension,
                    registered: false,
                });
            }

            EngineEvent::RegistrationFailed { cause } => {
                state.connection.account_status = AccountStatus::Unregistered;
                tracing::warn!("registration of {extension} failed: {cause}");
                self.emitter
                    .publish(PhoneEvent::RegistrationFailed { extension, cause });
            }

            EngineEvent::NewSession { session, originator } => {
                self.register_session(&mut state, session, originator);
            }

            EngineEvent::Session { session_id, event } => {
                self.on_session_event(&mut state, &session_id, event);
            }
        }
    }

    async fn event_loop(self, mut events: EngineEventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_engine_event(event).await;
        }
        tracing::info!("engine event loop ended");
    }

    /// Track a new session and bind its lifecycle. Known ids are left alone.
    pub(crate) fn register_session(
        &self,
        state: &mut PhoneState,
        session: Arc<dyn SessionHandle>,
        originator: Originator,
    ) -> SessionId {
        let record = CallRecord::new(session, originator);
        let session_id = record.session_id.clone();
        if state.registry.contains(&session_id) {
            tracing::debug!("session {session_id} already tracked");
            return session_id;
        }

        let event = PhoneEvent::NewSession {
            session_id: session_id.clone(),
            caller_id: record.caller_id.clone(),
            caller_name: record.caller_name.clone(),
            direction: record.direction,
            originator,
        };
        tracing::info!(
            "new {:?} session {session_id} with {} ({} active)",
            record.direction,
            record.caller_id,
            state.registry.len() + 1
        );
        state.binders.insert(session_id.clone(), SessionBinder::bind(&record));
        state.registry.insert(record);
        self.emitter.publish(event);
        session_id
    }

    fn on_session_event(&self, state: &mut PhoneState, session_id: &SessionId, event: SessionEvent) {
        let (Some(record), Some(binder)) = (
            state.registry.get_mut(session_id),
            state.binders.get_mut(session_id),
        ) else {
            tracing::debug!("event for untracked session {session_id}: {event:?}");
            return;
        };

        let answered = matches!(event, SessionEvent::Accepted { .. } | SessionEvent::Confirmed { .. });
        match binder.handle(event, record, &self.emitter, self.audio_sink.as_deref()) {
            Lifecycle::Live => {
                if answered {
                    state.transfers.on_session_answered(session_id);
                }
            }
            Lifecycle::Ended => {
                let removed = self.release(state, session_id);
                let action = state.transfers.on_session_ended(session_id);
                self.apply_transfer_action(state, action, removed.as_ref());
            }
            Lifecycle::Failed(cause) => {
                let removed = self.release(state, session_id);
                let action = state.transfers.on_session_failed(session_id, cause);
                self.apply_transfer_action(state, action, removed.as_ref());
            }
        }
    }

    fn release(&self, state: &mut PhoneState, session_id: &SessionId) -> Option<CallRecord> {
        state.binders.remove(session_id);
        let removed = state.registry.remove(session_id);
        tracing::info!("call {session_id} removed ({} active)", state.registry.len());
        removed
    }

    pub(crate) fn apply_transfer_action(
        &self,
        state: &mut PhoneState,
        action: Option<TransferAction>,
        consultation: Option<&CallRecord>,
    ) {
        match action {
            None => {}
            Some(TransferAction::Commit { original, consultation: consult_id }) => {
                let Some(refer_target) = consultation.map(|c| c.session.remote_identity().uri) else {
                    tracing::error!("transfer of {original}: consultation {consult_id} vanished");
                    state.transfers.finish(&original, Err("consultation call vanished".into()));
                    return;
                };
                self.commit_transfer(state, &original, refer_target);
            }
            Some(TransferAction::Abort { original, reason, terminate }) => {
                if let Some(consult_id) = terminate {
                    if let Some(record) = state.registry.get(&consult_id) {
                        if let Err(e) = terminate_record(record) {
                            tracing::error!("transfer of {original}: cannot end consultation {consult_id}: {e}");
                        }
                    }
                }
                tracing::warn!("transfer of {original} aborted: {reason}");
                self.emitter.publish(PhoneEvent::TransferFailed {
                    session_id: original,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Refer the original call to the consultation party, then hang it up.
    fn commit_transfer(&self, state: &mut PhoneState, original: &SessionId, refer_target: String) {
        let referred_by = state
            .account
            .as_ref()
            .map(|ua| ua.extension.clone())
            .unwrap_or_default();

        let outcome = match state.registry.get(original) {
            None => Err("original call is gone".to_string()),
            Some(record) => {
                let options = ReferOptions {
                    extra_headers: vec![
                        Header::new("Referred-By", referred_by),
                        Header::new("X-Transfer", "assisted"),
                    ],
                };
                record
                    .session
                    .refer(&refer_target, &options)
                    .map_err(|e| e.to_string())
                    .map(|()| {
                        if let Err(e) = terminate_record(record) {
                            tracing::error!("transfer of {original}: hangup after refer failed: {e}");
                        }
                    })
            }
        };

        let Some(saga) = state.transfers.finish(original, outcome.clone()) else {
            return;
        };
        match outcome {
            Ok(()) => {
                tracing::info!("call {original} transferred to {refer_target}");
                self.emitter.publish(PhoneEvent::TransferCompleted {
                    session_id: saga.original,
                    target: refer_target,
                });
            }
            Err(reason) => {
                tracing::error!("transfer of {original} to {refer_target} failed: {reason}");
                self.emitter.publish(PhoneEvent::TransferFailed {
                    session_id: saga.original,
                    reason: format!("refer failed: {reason}"),
                });
            }
        }
    }

    /// Abort transfers whose consultation leg went unanswered past the deadline.
    pub(crate) async fn expire_transfers(&self) {
        let mut state = self.state.lock().await;
        let actions = state.transfers.expire(tokio::time::Instant::now());
        for action in actions {
            self.apply_transfer_action(&mut state, Some(action), None);
        }
    }
}

/// Terminate a call that is established or still being set up.
pub(crate) fn terminate_record(record: &CallRecord) -> Result<bool, PhoneError> {
    let session = &record.session;
    if session.is_established() || session.is_in_progress() {
        session.terminate()?;
        tracing::info!("terminate requested for {}", record.session_id);
        Ok(true)
    } else {
        tracing::debug!("{} is not active, nothing to terminate", record.session_id);
        Ok(false)
    }
}
