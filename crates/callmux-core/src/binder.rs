use crate::audio::AudioSink;
use crate::cause::FailureCause;
use crate::engine::{Direction, SessionEvent, SessionId};
use crate::events::{EventBus, PhoneEvent};
use crate::registry::{CallRecord, CallState};

/// Where a session stands after the binder handled one of its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Live,
    Ended,
    Failed(FailureCause),
}

/// Translates the primitive events of one session into [`PhoneEvent`]s.
///
/// Keeps the call record's mirrors in step with what the engine reports.
/// After a terminal event (`Ended` or `Failed`) the binder releases the
/// session and ignores anything it still receives.
#[derive(Debug)]
pub struct SessionBinder {
    session_id: SessionId,
    direction: Direction,
    caller_id: String,
    bound: bool,
}

impl SessionBinder {
    pub fn bind(record: &CallRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            direction: record.direction,
            caller_id: record.caller_id.clone(),
            bound: true,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn handle(
        &mut self,
        event: SessionEvent,
        record: &mut CallRecord,
        bus: &EventBus,
        sink: Option<&dyn AudioSink>,
    ) -> Lifecycle {
        if !self.bound {
            tracing::debug!("session {} released, ignoring {event:?}", self.session_id);
            return Lifecycle::Live;
        }

        let session_id = self.session_id.clone();
        match event {
            SessionEvent::Progress { originator } => {
                if record.state != CallState::Established {
                    record.state = CallState::Ringing;
                }
                bus.publish(PhoneEvent::OnRinging {
                    session_id,
                    direction: self.direction,
                    originator,
                    caller_id: self.caller_id.clone(),
                });
            }

            SessionEvent::Accepted { originator, status_code } => {
                record.state = CallState::Established;
                tracing::info!("session {session_id} accepted");
                bus.publish(PhoneEvent::OnAnswer {
                    session_id,
                    direction: self.direction,
                    originator,
                    status_code,
                });
            }

            SessionEvent::Confirmed { originator, ack } => {
                record.state = CallState::Established;
                bus.publish(PhoneEvent::OnConfirmed {
                    session_id,
                    direction: self.direction,
                    originator,
                    caller_id: self.caller_id.clone(),
                    ack,
                });
            }

            SessionEvent::Muted | SessionEvent::Unmuted => {
                let is_muted = matches!(event, SessionEvent::Muted);
                if record.muted != is_muted {
                    record.muted = is_muted;
                    bus.publish(PhoneEvent::OnMute { session_id, is_muted });
                }
            }

            SessionEvent::Hold { .. } | SessionEvent::Unhold { .. } => {
                // Either end may still hold the call; the engine knows both.
                let is_on_hold = record.session.is_on_hold().is_held();
                if record.on_hold != is_on_hold {
                    record.on_hold = is_on_hold;
                    bus.publish(PhoneEvent::OnHold { session_id, is_on_hold });
                }
            }

            SessionEvent::Ended { originator, message, cause } => {
                self.release(record, sink);
                tracing::info!("session {session_id} ended by {originator:?}: {cause}");
                bus.publish(PhoneEvent::OnHangup {
                    originator,
                    message,
                    cause,
                    session_id,
                });
                return Lifecycle::Ended;
            }

            SessionEvent::Failed { cause, .. } => {
                self.release(record, sink);
                let response = FailureCause::from_engine_cause(&cause);
                tracing::info!("session {session_id} failed: {cause} ({response})");
                bus.publish(PhoneEvent::Failed {
                    session_id,
                    direction: self.direction,
                    response,
                });
                return Lifecycle::Failed(response);
            }

            SessionEvent::PeerReady(audio) => match sink {
                Some(sink) => sink.attach(&session_id, audio.into_stream()),
                None => tracing::error!("no audio sink configured; remote audio of {session_id} dropped"),
            },
        }

        Lifecycle::Live
    }

    fn release(&mut self, record: &mut CallRecord, sink: Option<&dyn AudioSink>) {
        self.bound = false;
        record.state = CallState::Terminated;
        if let Some(sink) = sink {
            sink.detach(&self.session_id);
        }
    }
}
