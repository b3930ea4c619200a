use std::sync::{Mutex, PoisonError};

use crate::engine::SessionId;

/// Remote media handed over by the engine once the peer connection is ready.
///
/// Which variant an engine produces depends on the media API it was built
/// against; it never changes at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAudio {
    /// Per-track notification (`ontrack` style).
    Track { track_id: String },
    /// Whole-stream notification (`onaddstream` style).
    Stream { stream_id: String, track_ids: Vec<String> },
}

/// Remote audio as attached to an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStream {
    pub stream_id: String,
    pub track_ids: Vec<String>,
}

impl RemoteAudio {
    /// Normalise to a stream, wrapping a lone track in a single-track stream.
    pub fn into_stream(self) -> AudioStream {
        match self {
            Self::Track { track_id } => AudioStream {
                stream_id: format!("stream-{track_id}"),
                track_ids: vec![track_id],
            },
            Self::Stream { stream_id, track_ids } => AudioStream { stream_id, track_ids },
        }
    }
}

/// Rendering target for remote call audio.
pub trait AudioSink: Send + Sync {
    fn attach(&self, session_id: &SessionId, stream: AudioStream);
    fn detach(&self, session_id: &SessionId);
}

/// Routes remote call audio to a single output, like one audio element.
///
/// Every session keeps its attached stream; the most recently attached one is
/// the one being played. When it is detached, playback falls back to the
/// previous session still attached.
pub struct PlayoutRouter {
    attached: Mutex<Vec<(SessionId, AudioStream)>>,
}

impl PlayoutRouter {
    pub fn new() -> Self {
        Self {
            attached: Mutex::new(Vec::new()),
        }
    }

    /// The stream currently routed to the output.
    pub fn current(&self) -> Option<(SessionId, AudioStream)> {
        self.lock().last().cloned()
    }

    pub fn stream_for(&self, session_id: &SessionId) -> Option<AudioStream> {
        self.lock()
            .iter()
            .find(|(id, _)| id == session_id)
            .map(|(_, stream)| stream.clone())
    }

    pub fn attached_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SessionId, AudioStream)>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PlayoutRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for PlayoutRouter {
    fn attach(&self, session_id: &SessionId, stream: AudioStream) {
        let mut attached = self.lock();
        // Re-attaching moves the session to the front of playback.
        attached.retain(|(id, _)| id != session_id);
        tracing::debug!("remote audio {} routed for session {session_id}", stream.stream_id);
        attached.push((session_id.clone(), stream));
    }

    fn detach(&self, session_id: &SessionId) {
        self.lock().retain(|(id, _)| id != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> AudioStream {
        RemoteAudio::Track { track_id: id.to_string() }.into_stream()
    }

    #[test]
    fn track_is_wrapped_in_a_single_track_stream() {
        let stream = track("t1");
        assert_eq!(stream.track_ids, vec!["t1".to_string()]);
        assert_eq!(stream.stream_id, "stream-t1");

        let stream = RemoteAudio::Stream {
            stream_id: "s".into(),
            track_ids: vec!["a".into(), "b".into()],
        }
        .into_stream();
        assert_eq!(stream.stream_id, "s");
        assert_eq!(stream.track_ids.len(), 2);
    }

    #[test]
    fn last_attached_session_is_played() {
        let router = PlayoutRouter::new();
        router.attach(&SessionId::from("a"), track("ta"));
        router.attach(&SessionId::from("b"), track("tb"));

        let (id, stream) = router.current().unwrap();
        assert_eq!(id, SessionId::from("b"));
        assert_eq!(stream.track_ids, vec!["tb".to_string()]);
    }

    #[test]
    fn detach_falls_back_to_previous_session() {
        let router = PlayoutRouter::new();
        router.attach(&SessionId::from("a"), track("ta"));
        router.attach(&SessionId::from("b"), track("tb"));
        router.detach(&SessionId::from("b"));

        assert_eq!(router.current().unwrap().0, SessionId::from("a"));
        assert!(router.stream_for(&SessionId::from("b")).is_none());
    }

    #[test]
    fn reattach_replaces_instead_of_duplicating() {
        let router = PlayoutRouter::new();
        router.attach(&SessionId::from("a"), track("t1"));
        router.attach(&SessionId::from("b"), track("tb"));
        router.attach(&SessionId::from("a"), track("t2"));

        assert_eq!(router.attached_count(), 2);
        let (id, stream) = router.current().unwrap();
        assert_eq!(id, SessionId::from("a"));
        assert_eq!(stream.track_ids, vec!["t2".to_string()]);
    }
}
