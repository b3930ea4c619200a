//! Call verbs of [`PhoneManager`]: dial, answer, hold, mute, hangup,
//! assisted transfer and DTMF.

use std::sync::LazyLock;

use regex::Regex;
use tokio::time::Instant;

use crate::engine::{CallOptions, Direction, Originator, SessionId};
use crate::errors::PhoneError;
use crate::events::PhoneEvent;
use crate::phone::{PhoneManager, PhoneState, terminate_record};
use crate::transfer::TransferSaga;
use crate::uri;

static DTMF_TONES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Da-d*#,]+$").expect("static regex"));

impl PhoneManager {
    /// Place an outbound call.
    ///
    /// `caller_num` and `endpoint` travel as `callerNum`/`endpoint` headers for
    /// PBX-side routing. Every other established call is put on hold before
    /// the request goes out.
    pub async fn dial(&self, target: &str, caller_num: &str, endpoint: &str) -> Result<SessionId, PhoneError> {
        let allow_multiple = self.settings.lock().await.allow_multiple_calls;
        let mut state = self.state.lock().await;
        let host = ensure_ready(&state)?;
        let uri = uri::normalize_target(target, &host).inspect_err(|e| tracing::warn!("dial: {e}"))?;

        if !state.registry.is_empty() && !allow_multiple {
            tracing::warn!("dial {uri}: already in a call");
            return Err(PhoneError::CallLimitReached);
        }

        self.hold_others(&mut state, None);

        let options = CallOptions::audio_only()
            .with_header("callerNum", caller_num)
            .with_header("endpoint", endpoint);
        let session = self
            .engine
            .call(&uri, &options)
            .inspect_err(|e| tracing::warn!("dial {uri}: engine refused the call: {e}"))?;
        tracing::info!("call to {uri} launched");

        Ok(self.register_session(&mut state, session, Originator::Local))
    }

    /// Accept a ringing incoming call, holding every other established call first.
    pub async fn answer(&self, session_id: &SessionId) -> Result<(), PhoneError> {
        let allow_multiple = self.settings.lock().await.allow_multiple_calls;
        let mut state = self.state.lock().await;
        let session = find(&state, session_id, "answer")?.session.clone();

        if session.direction() != Direction::Incoming || session.is_established() {
            tracing::warn!("answer: {session_id} is not a ringing incoming call");
            return Err(PhoneError::InvalidState {
                session_id: session_id.clone(),
                reason: "only ringing incoming calls can be answered".into(),
            });
        }
        // A dial still in progress may be picked up at any moment.
        let other_active = state.registry.iter().any(|c| {
            &c.session_id != session_id
                && (c.session.is_established()
                    || (c.direction == Direction::Outgoing && c.session.is_in_progress()))
        });
        if other_active && !allow_multiple {
            tracing::warn!("answer {session_id}: already in a call");
            return Err(PhoneError::CallLimitReached);
        }

        self.hold_others(&mut state, Some(session_id));

        session
            .answer(&CallOptions::audio_only())
            .inspect_err(|e| tracing::error!("answer {session_id}: {e}"))?;
        tracing::info!("answered {session_id}");
        self.emitter.publish(PhoneEvent::Answered {
            session_id: session_id.clone(),
        });
        Ok(())
    }

    /// Toggle hold on an established call. Other calls are ignored.
    pub async fn hold(&self, session_id: &SessionId) -> Result<(), PhoneError> {
        let mut state = self.state.lock().await;
        let record = find_mut(&mut state, session_id, "hold")?;
        let session = record.session.clone();
        if !session.is_established() {
            tracing::debug!("hold: {session_id} is not established");
            return Ok(());
        }

        let hold_locally = !session.is_on_hold().local;
        let requested = if hold_locally { session.hold() } else { session.unhold() };
        requested.inspect_err(|e| tracing::error!("hold {session_id}: {e}"))?;

        // A call held by the far end stays on hold whatever we do locally.
        let is_on_hold = hold_locally || session.is_on_hold().remote;
        record.on_hold = is_on_hold;
        self.emitter.publish(PhoneEvent::OnHold {
            session_id: session_id.clone(),
            is_on_hold,
        });
        Ok(())
    }

    /// Toggle the local microphone of an established call.
    pub async fn mute(&self, session_id: &SessionId) -> Result<(), PhoneError> {
        let mut state = self.state.lock().await;
        let record = find_mut(&mut state, session_id, "mute")?;
        if !record.session.is_established() {
            tracing::debug!("mute: {session_id} is not established");
            return Ok(());
        }

        let Some(sender) = record.session.audio_sender() else {
            tracing::error!("mute: no audio sender found on {session_id}");
            return Err(PhoneError::NoAudioSender(session_id.clone()));
        };

        // The sender is the truth; the record only mirrors it.
        let is_muted = sender.is_enabled();
        sender.set_enabled(!is_muted);
        record.muted = is_muted;
        self.emitter.publish(PhoneEvent::OnMute {
            session_id: session_id.clone(),
            is_muted,
        });
        Ok(())
    }

    /// Terminate a call that is established or being set up.
    ///
    /// The call leaves the registry when the engine reports it ended.
    pub async fn hangup(&self, session_id: &SessionId) -> Result<(), PhoneError> {
        let state = self.state.lock().await;
        let record = find(&state, session_id, "hangup")?;
        terminate_record(record)
            .inspect_err(|e| tracing::error!("hangup {session_id}: {e}"))?;
        Ok(())
    }

    /// Start an assisted transfer of `session_id` to `target`.
    ///
    /// Places a consultation call to `target`. When that call ends normally,
    /// the original call is referred to the consultation party and hung up.
    /// Returns the consultation call's id.
    pub async fn assisted_transfer(&self, session_id: &SessionId, target: &str) -> Result<SessionId, PhoneError> {
        let timeout = self.settings.lock().await.transfer_timeout();
        let mut state = self.state.lock().await;
        let host = ensure_ready(&state)?;

        if target.trim().is_empty() {
            tracing::warn!("transfer {session_id}: no extension to transfer to");
            return Err(PhoneError::InvalidTarget("no extension to transfer to".into()));
        }
        find(&state, session_id, "transfer")?;
        if state.transfers.is_transferring(session_id) {
            tracing::warn!("transfer {session_id}: already transferring");
            return Err(PhoneError::TransferInProgress(session_id.clone()));
        }
        let uri = uri::normalize_target(target, &host).inspect_err(|e| tracing::warn!("transfer: {e}"))?;

        self.hold_others(&mut state, Some(session_id));

        let consultation = self
            .engine
            .call(&uri, &CallOptions::audio_only())
            .inspect_err(|e| tracing::warn!("transfer {session_id}: cannot call {uri}: {e}"))?;
        let consult_id = self.register_session(&mut state, consultation, Originator::Local);

        state.transfers.begin(TransferSaga::new(
            session_id.clone(),
            consult_id.clone(),
            uri.clone(),
            Instant::now() + timeout,
        ));
        tracing::info!("transfer of {session_id}: consulting {uri} on {consult_id}");
        self.emitter.publish(PhoneEvent::TransferStarted {
            session_id: session_id.clone(),
            consult_session_id: consult_id.clone(),
            target: uri,
        });

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire_transfers().await;
        });

        Ok(consult_id)
    }

    /// Send DTMF tones on an established call.
    pub async fn send_digits(&self, session_id: &SessionId, tones: &str) -> Result<(), PhoneError> {
        if !DTMF_TONES.is_match(tones) {
            tracing::warn!("send_digits {session_id}: invalid tones {tones:?}");
            return Err(PhoneError::InvalidDigits(tones.to_string()));
        }

        let state = self.state.lock().await;
        let record = find(&state, session_id, "send_digits")?;
        if !record.session.is_established() {
            tracing::warn!("send_digits: {session_id} is not established");
            return Err(PhoneError::InvalidState {
                session_id: session_id.clone(),
                reason: "tones need an established call".into(),
            });
        }

        record
            .session
            .send_dtmf(tones)
            .inspect_err(|e| tracing::error!("send_digits {session_id}: {e}"))?;
        self.emitter.publish(PhoneEvent::DigitsSent {
            session_id: session_id.clone(),
            tones: tones.to_string(),
        });
        Ok(())
    }

    /// Put every established call except `except` on hold.
    fn hold_others(&self, state: &mut PhoneState, except: Option<&SessionId>) {
        for record in state.registry.iter_mut() {
            if Some(&record.session_id) == except {
                continue;
            }
            let session = &record.session;
            if !session.is_established() || session.is_on_hold().local {
                continue;
            }
            match session.hold() {
                Ok(()) => {
                    record.on_hold = true;
                    tracing::info!("{} put on hold", record.session_id);
                    self.emitter.publish(PhoneEvent::OnHold {
                        session_id: record.session_id.clone(),
                        is_on_hold: true,
                    });
                }
                Err(e) => tracing::error!("cannot hold {}: {e}", record.session_id),
            }
        }
    }
}

/// Host of the connected account, or `NotConnected`.
fn ensure_ready(state: &PhoneState) -> Result<String, PhoneError> {
    match &state.account {
        Some(ua) if state.connection.is_ready() => Ok(ua.host.clone()),
        _ => {
            tracing::warn!("extension is not connected to the PBX");
            Err(PhoneError::NotConnected)
        }
    }
}

fn find<'a>(
    state: &'a PhoneState,
    session_id: &SessionId,
    verb: &str,
) -> Result<&'a crate::registry::CallRecord, PhoneError> {
    state.registry.get(session_id).ok_or_else(|| {
        tracing::warn!("{verb}: no call found with id {session_id}");
        PhoneError::NotFound(session_id.clone())
    })
}

fn find_mut<'a>(
    state: &'a mut PhoneState,
    session_id: &SessionId,
    verb: &str,
) -> Result<&'a mut crate::registry::CallRecord, PhoneError> {
    state.registry.get_mut(session_id).ok_or_else(|| {
        tracing::warn!("{verb}: no call found with id {session_id}");
        PhoneError::NotFound(session_id.clone())
    })
}
