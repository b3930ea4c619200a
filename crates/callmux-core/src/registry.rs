use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::{Direction, Originator, SessionHandle, SessionId};
use crate::uri;

/// Signaling progress of a call. Hold and mute are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Dialing,
    Ringing,
    Established,
    Terminated,
}

/// One active call.
pub struct CallRecord {
    pub session_id: SessionId,
    pub direction: Direction,
    pub originator: Originator,
    pub session: Arc<dyn SessionHandle>,
    /// Full remote URI for incoming calls, user part for outgoing ones.
    pub caller_id: String,
    pub caller_name: Option<String>,
    pub state: CallState,
    /// Mirrors of the engine's media state, overwritten by engine events.
    pub muted: bool,
    pub on_hold: bool,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(session: Arc<dyn SessionHandle>, originator: Originator) -> Self {
        let direction = session.direction();
        let remote = session.remote_identity();
        let (caller_id, caller_name, state) = match direction {
            Direction::Incoming => (remote.uri, remote.display_name, CallState::Ringing),
            Direction::Outgoing => (uri::user_part(&remote.uri).to_string(), None, CallState::Dialing),
        };

        Self {
            session_id: session.id(),
            direction,
            originator,
            session,
            caller_id,
            caller_name,
            state,
            muted: false,
            on_hold: false,
            created_at: Utc::now(),
        }
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            session_id: self.session_id.clone(),
            direction: self.direction,
            originator: self.originator,
            caller_id: self.caller_id.clone(),
            caller_name: self.caller_name.clone(),
            state: self.state,
            muted: self.muted,
            on_hold: self.on_hold,
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("session_id", &self.session_id)
            .field("direction", &self.direction)
            .field("originator", &self.originator)
            .field("caller_id", &self.caller_id)
            .field("state", &self.state)
            .field("muted", &self.muted)
            .field("on_hold", &self.on_hold)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a call handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub session_id: SessionId,
    pub direction: Direction,
    pub originator: Originator,
    pub caller_id: String,
    pub caller_name: Option<String>,
    pub state: CallState,
    pub muted: bool,
    pub on_hold: bool,
    pub created_at: DateTime<Utc>,
}

/// Ordered set of active calls, keyed by session id.
///
/// Written only by the orchestrator. Read by consumers through snapshots.
#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: Vec<CallRecord>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self { calls: Vec::new() }
    }

    /// Add a call. Returns false, leaving the registry untouched, if the id is taken.
    pub fn insert(&mut self, record: CallRecord) -> bool {
        if self.contains(&record.session_id) {
            return false;
        }
        self.calls.push(record);
        true
    }

    pub fn remove(&mut self, session_id: &SessionId) -> Option<CallRecord> {
        let index = self.calls.iter().position(|c| &c.session_id == session_id)?;
        Some(self.calls.remove(index))
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&CallRecord> {
        self.calls.iter().find(|c| &c.session_id == session_id)
    }

    pub fn get_mut(&mut self, session_id: &SessionId) -> Option<&mut CallRecord> {
        self.calls.iter_mut().find(|c| &c.session_id == session_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.get(session_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallRecord> {
        self.calls.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CallRecord> {
        self.calls.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn snapshot(&self) -> Vec<CallInfo> {
        self.calls.iter().map(CallRecord::info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackSession;

    fn outgoing(id: &str) -> CallRecord {
        CallRecord::new(
            LoopbackSession::standalone(id, Direction::Outgoing, "sip:1001@pbx"),
            Originator::Local,
        )
    }

    fn incoming(id: &str) -> CallRecord {
        CallRecord::new(
            LoopbackSession::standalone(id, Direction::Incoming, "sip:2002@pbx"),
            Originator::Remote,
        )
    }

    #[test]
    fn caller_id_depends_on_direction() {
        let out = outgoing("a");
        assert_eq!(out.caller_id, "1001");
        assert_eq!(out.state, CallState::Dialing);

        let inc = incoming("b");
        assert_eq!(inc.caller_id, "sip:2002@pbx");
        assert_eq!(inc.state, CallState::Ringing);
        assert!(!inc.muted && !inc.on_hold);
    }

    #[test]
    fn insert_and_retrieve_call() {
        let mut reg = CallRegistry::new();
        assert!(reg.insert(outgoing("a")));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&SessionId::from("a")).unwrap().direction, Direction::Outgoing);
    }

    #[test]
    fn no_duplicate_session_ids() {
        let mut reg = CallRegistry::new();
        assert!(reg.insert(outgoing("a")));
        assert!(!reg.insert(incoming("a")));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&SessionId::from("a")).unwrap().direction, Direction::Outgoing);
    }

    #[test]
    fn remove_returns_exactly_that_call() {
        let mut reg = CallRegistry::new();
        reg.insert(outgoing("a"));
        reg.insert(incoming("b"));

        let removed = reg.remove(&SessionId::from("a")).unwrap();
        assert_eq!(removed.session_id, SessionId::from("a"));
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(&SessionId::from("a")).is_none());
        assert!(reg.contains(&SessionId::from("b")));
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let mut reg = CallRegistry::new();
        reg.insert(incoming("b"));
        reg.insert(outgoing("a"));
        reg.get_mut(&SessionId::from("a")).unwrap().on_hold = true;

        let snap = reg.snapshot();
        assert_eq!(snap[0].session_id, SessionId::from("b"));
        assert_eq!(snap[1].session_id, SessionId::from("a"));
        assert!(snap[1].on_hold);
    }
}
