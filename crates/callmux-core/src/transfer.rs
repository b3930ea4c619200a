//! Assisted transfer as a two-phase saga.
//!
//! Phase one places a consultation call to the transfer target. When that
//! call ends normally the saga commits: the original call is referred to the
//! consultation party and then hung up. The saga aborts if the consultation
//! call fails, the original call goes away first, the refer is rejected, or
//! the consultation call is still unanswered when the deadline passes.

use std::fmt;

use tokio::time::Instant;

use crate::cause::FailureCause;
use crate::engine::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    ConsultationFailed(FailureCause),
    OriginalEnded,
    ReferFailed(String),
    TimedOut,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsultationFailed(cause) => write!(f, "consultation call failed: {cause}"),
            Self::OriginalEnded => f.write_str("original call ended before the transfer completed"),
            Self::ReferFailed(reason) => write!(f, "refer failed: {reason}"),
            Self::TimedOut => f.write_str("consultation call timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    Consulting,
    Committing,
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSaga {
    pub original: SessionId,
    pub consultation: SessionId,
    /// Target as dialled for the consultation leg.
    pub target: String,
    pub phase: TransferPhase,
    /// Cleared once the consultation call is answered.
    pub deadline: Option<Instant>,
}

impl TransferSaga {
    pub fn new(original: SessionId, consultation: SessionId, target: String, deadline: Instant) -> Self {
        Self {
            original,
            consultation,
            target,
            phase: TransferPhase::Consulting,
            deadline: Some(deadline),
        }
    }
}

/// What the orchestrator must do after a saga moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAction {
    /// Refer `original` to the consultation party, then hang it up.
    Commit { original: SessionId, consultation: SessionId },
    /// Report the abort; terminate the consultation leg if it is still up.
    Abort {
        original: SessionId,
        reason: AbortReason,
        terminate: Option<SessionId>,
    },
}

/// Sagas currently in flight, at most one per original call.
#[derive(Debug, Default)]
pub struct TransferBook {
    sagas: Vec<TransferSaga>,
}

impl TransferBook {
    pub fn new() -> Self {
        Self { sagas: Vec::new() }
    }

    pub fn begin(&mut self, saga: TransferSaga) -> bool {
        if self.is_transferring(&saga.original) {
            return false;
        }
        self.sagas.push(saga);
        true
    }

    pub fn is_transferring(&self, original: &SessionId) -> bool {
        self.sagas.iter().any(|s| &s.original == original)
    }

    pub fn active(&self) -> &[TransferSaga] {
        &self.sagas
    }

    /// A session was answered. An answered consultation no longer expires.
    pub fn on_session_answered(&mut self, session_id: &SessionId) {
        if let Some(saga) = self.sagas.iter_mut().find(|s| &s.consultation == session_id) {
            saga.deadline = None;
        }
    }

    /// A session ended normally.
    pub fn on_session_ended(&mut self, session_id: &SessionId) -> Option<TransferAction> {
        if let Some(saga) = self
            .sagas
            .iter_mut()
            .find(|s| &s.consultation == session_id && s.phase == TransferPhase::Consulting)
        {
            saga.phase = TransferPhase::Committing;
            return Some(TransferAction::Commit {
                original: saga.original.clone(),
                consultation: saga.consultation.clone(),
            });
        }
        self.abort_original(session_id)
    }

    pub fn on_session_failed(&mut self, session_id: &SessionId, cause: FailureCause) -> Option<TransferAction> {
        if let Some(saga) = self.take(|s| &s.consultation == session_id) {
            return Some(TransferAction::Abort {
                original: saga.original,
                reason: AbortReason::ConsultationFailed(cause),
                terminate: None,
            });
        }
        self.abort_original(session_id)
    }

    /// Close a committing saga with the outcome of the refer.
    pub fn finish(&mut self, original: &SessionId, outcome: Result<(), String>) -> Option<TransferSaga> {
        let mut saga = self.take(|s| &s.original == original)?;
        saga.phase = match outcome {
            Ok(()) => TransferPhase::Completed,
            Err(reason) => TransferPhase::Aborted(AbortReason::ReferFailed(reason)),
        };
        Some(saga)
    }

    /// Abort every unanswered consultation past its deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<TransferAction> {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sagas)
            .into_iter()
            .partition(|s| s.phase == TransferPhase::Consulting && s.deadline.is_some_and(|d| d <= now));
        self.sagas = live;
        expired
            .into_iter()
            .map(|saga| TransferAction::Abort {
                original: saga.original,
                reason: AbortReason::TimedOut,
                terminate: Some(saga.consultation),
            })
            .collect()
    }

    fn abort_original(&mut self, session_id: &SessionId) -> Option<TransferAction> {
        let saga = self.take(|s| &s.original == session_id && s.phase == TransferPhase::Consulting)?;
        Some(TransferAction::Abort {
            original: saga.original,
            reason: AbortReason::OriginalEnded,
            terminate: None,
        })
    }

    fn take(&mut self, pred: impl Fn(&TransferSaga) -> bool) -> Option<TransferSaga> {
        let index = self.sagas.iter().position(pred)?;
        Some(self.sagas.remove(index))
    }
}
