use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::cause::FailureCause;
use crate::engine::{Direction, Originator, SessionId};

/// Events published by the orchestrator to UI, logging and telemetry consumers.
///
/// Serialises as `{"topic": "<name>", ...camelCase fields}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "topic", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PhoneEvent {
    Connected,
    Disconnected,
    Registered {
        extension: String,
        registered: bool,
    },
    Unregistered {
        extension: String,
        registered: bool,
    },
    RegistrationFailed {
        extension: String,
        cause: String,
    },
    NewSession {
        session_id: SessionId,
        #[serde(rename = "callerID")]
        caller_id: String,
        caller_name: Option<String>,
        direction: Direction,
        originator: Originator,
    },
    OnRinging {
        session_id: SessionId,
        direction: Direction,
        originator: Originator,
        #[serde(rename = "callerid")]
        caller_id: String,
    },
    OnAnswer {
        session_id: SessionId,
        direction: Direction,
        originator: Originator,
        status_code: Option<u16>,
    },
    OnConfirmed {
        session_id: SessionId,
        direction: Direction,
        originator: Originator,
        #[serde(rename = "callerid")]
        caller_id: String,
        ack: Option<String>,
    },
    OnMute {
        session_id: SessionId,
        is_muted: bool,
    },
    OnHold {
        session_id: SessionId,
        is_on_hold: bool,
    },
    OnHangup {
        originator: Originator,
        message: Option<String>,
        cause: String,
        session_id: SessionId,
    },
    Failed {
        session_id: SessionId,
        direction: Direction,
        response: FailureCause,
    },
    Answered {
        session_id: SessionId,
    },
    DigitsSent {
        session_id: SessionId,
        tones: String,
    },
    TransferStarted {
        session_id: SessionId,
        consult_session_id: SessionId,
        target: String,
    },
    TransferCompleted {
        session_id: SessionId,
        target: String,
    },
    TransferFailed {
        session_id: SessionId,
        reason: String,
    },
}

/// Signaling transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketStatus {
    #[default]
    Down,
    Up,
}

/// Registration status of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Unregistered,
    Registered,
}

/// Connectivity context. Outbound actions need the socket up and the account registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub socket_status: SocketStatus,
    pub account_status: AccountStatus,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        self.socket_status == SocketStatus::Up && self.account_status == AccountStatus::Registered
    }
}

/// Discriminant of [`PhoneEvent`], used to subscribe to a single kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    Connected,
    Disconnected,
    Registered,
    Unregistered,
    RegistrationFailed,
    NewSession,
    OnRinging,
    OnAnswer,
    OnConfirmed,
    OnMute,
    OnHold,
    OnHangup,
    Failed,
    Answered,
    DigitsSent,
    TransferStarted,
    TransferCompleted,
    TransferFailed,
}

impl PhoneEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            Self::Connected => EventTopic::Connected,
            Self::Disconnected => EventTopic::Disconnected,
            Self::Registered { .. } => EventTopic::Registered,
            Self::Unregistered { .. } => EventTopic::Unregistered,
            Self::RegistrationFailed { .. } => EventTopic::RegistrationFailed,
            Self::NewSession { .. } => EventTopic::NewSession,
            Self::OnRinging { .. } => EventTopic::OnRinging,
            Self::OnAnswer { .. } => EventTopic::OnAnswer,
            Self::OnConfirmed { .. } => EventTopic::OnConfirmed,
            Self::OnMute { .. } => EventTopic::OnMute,
            Self::OnHold { .. } => EventTopic::OnHold,
            Self::OnHangup { .. } => EventTopic::OnHangup,
            Self::Failed { .. } => EventTopic::Failed,
            Self::Answered { .. } => EventTopic::Answered,
            Self::DigitsSent { .. } => EventTopic::DigitsSent,
            Self::TransferStarted { .. } => EventTopic::TransferStarted,
            Self::TransferCompleted { .. } => EventTopic::TransferCompleted,
            Self::TransferFailed { .. } => EventTopic::TransferFailed,
        }
    }

    /// Session the event is about, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Connected
            | Self::Disconnected
            | Self::Registered { .. }
            | Self::Unregistered { .. }
            | Self::RegistrationFailed { .. } => None,
            Self::NewSession { session_id, .. }
            | Self::OnRinging { session_id, .. }
            | Self::OnAnswer { session_id, .. }
            | Self::OnConfirmed { session_id, .. }
            | Self::OnMute { session_id, .. }
            | Self::OnHold { session_id, .. }
            | Self::OnHangup { session_id, .. }
            | Self::Failed { session_id, .. }
            | Self::Answered { session_id }
            | Self::DigitsSent { session_id, .. }
            | Self::TransferStarted { session_id, .. }
            | Self::TransferCompleted { session_id, .. }
            | Self::TransferFailed { session_id, .. } => Some(session_id),
        }
    }
}

/// Trait for receiving events from the orchestrator.
/// Implementations must be Send + Sync (called from tokio tasks).
///
/// Listeners run synchronously inside the publishing call and must not block
/// on the orchestrator; spawn a task to issue verbs in response to an event.
pub trait PhoneEventListener: Send + Sync {
    fn on_event(&self, event: PhoneEvent);
}

impl<F> PhoneEventListener for F
where
    F: Fn(PhoneEvent) + Send + Sync,
{
    fn on_event(&self, event: PhoneEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every topic.
    topic: Option<EventTopic>,
    listener: Arc<dyn PhoneEventListener>,
}

/// Publish/subscribe hub dispatching [`PhoneEvent`]s to registered listeners.
///
/// Listeners are invoked in subscription order. A panicking listener is
/// logged and skipped; the remaining listeners still receive the event.
#[derive(Clone)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe to a single topic.
    pub fn subscribe(&self, topic: EventTopic, listener: Arc<dyn PhoneEventListener>) -> SubscriptionId {
        self.insert(Some(topic), listener)
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self, listener: Arc<dyn PhoneEventListener>) -> SubscriptionId {
        self.insert(None, listener)
    }

    /// Remove a subscription. Unknown ids are ignored; returns whether one was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Number of listeners that would receive an event of `topic`.
    pub fn listener_count(&self, topic: EventTopic) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.topic.is_none_or(|t| t == topic))
            .count()
    }

    pub fn publish(&self, event: PhoneEvent) {
        let topic = event.topic();
        // Snapshot so listeners may (un)subscribe while being notified.
        let listeners: Vec<Arc<dyn PhoneEventListener>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.topic.is_none_or(|t| t == topic))
            .map(|s| s.listener.clone())
            .collect();

        for listener in listeners {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event.clone())));
            if delivered.is_err() {
                tracing::error!("event listener panicked while handling {topic:?}; continuing");
            }
        }
    }

    fn insert(&self, topic: Option<EventTopic>, listener: Arc<dyn PhoneEventListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, topic, listener });
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl PhoneEventListener for CountingListener {
        fn on_event(&self, _event: PhoneEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingListener;

    impl PhoneEventListener for PanickingListener {
        fn on_event(&self, _event: PhoneEvent) {
            panic!("listener bug");
        }
    }

    fn hold_event(id: &str) -> PhoneEvent {
        PhoneEvent::OnHold {
            session_id: SessionId::from(id),
            is_on_hold: true,
        }
    }

    #[test]
    fn bus_dispatches_to_listener() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe_all(Arc::new(CountingListener { count: count.clone() }));

        bus.publish(PhoneEvent::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bus_dispatches_to_multiple_listeners() {
        let bus = EventBus::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventTopic::Connected, Arc::new(CountingListener { count: count1.clone() }));
        bus.subscribe(EventTopic::Connected, Arc::new(CountingListener { count: count2.clone() }));

        bus.publish(PhoneEvent::Connected);

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            bus.subscribe(EventTopic::OnHold, Arc::new(move |_: PhoneEvent| order.lock().unwrap().push(n)));
        }

        bus.publish(hold_event("a"));

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn topic_subscriptions_only_see_their_topic() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventTopic::OnMute, Arc::new(CountingListener { count: count.clone() }));

        bus.publish(hold_event("a"));
        bus.publish(PhoneEvent::OnMute {
            session_id: SessionId::from("a"),
            is_muted: true,
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventTopic::OnMute), 1);
        assert_eq!(bus.listener_count(EventTopic::OnHold), 0);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(PhoneEvent::Disconnected);
    }

    #[test]
    fn unsubscribe_stops_delivery_and_ignores_unknown_ids() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe_all(Arc::new(CountingListener { count: count.clone() }));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(PhoneEvent::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_starve_the_rest() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe_all(Arc::new(PanickingListener));
        bus.subscribe_all(Arc::new(CountingListener { count: count.clone() }));

        bus.publish(PhoneEvent::Connected);
        bus.publish(PhoneEvent::Disconnected);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_may_unsubscribe_itself_while_notified() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let id = {
            let bus2 = bus.clone();
            let slot = slot.clone();
            let count = count.clone();
            bus.subscribe_all(Arc::new(move |_: PhoneEvent| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *slot.lock().unwrap() {
                    bus2.unsubscribe(id);
                }
            }))
        };
        *slot.lock().unwrap() = Some(id);

        bus.publish(PhoneEvent::Connected);
        bus.publish(PhoneEvent::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_serialize_with_wire_topic_names() {
        let json = serde_json::to_value(PhoneEvent::OnHangup {
            originator: Originator::Remote,
            message: None,
            cause: "BYE".to_string(),
            session_id: SessionId::from("s1"),
        })
        .unwrap();
        assert_eq!(json["topic"], "onHangup");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["originator"], "remote");

        let json = serde_json::to_value(PhoneEvent::NewSession {
            session_id: SessionId::from("s2"),
            caller_id: "1001".to_string(),
            caller_name: None,
            direction: Direction::Outgoing,
            originator: Originator::Local,
        })
        .unwrap();
        assert_eq!(json["topic"], "newSession");
        assert_eq!(json["callerID"], "1001");
        assert_eq!(json["direction"], "outgoing");

        let json = serde_json::to_value(PhoneEvent::Failed {
            session_id: SessionId::from("s3"),
            direction: Direction::Incoming,
            response: FailureCause::Busy,
        })
        .unwrap();
        assert_eq!(json["topic"], "failed");
        assert_eq!(json["response"], "BUSY");
    }

    #[test]
    fn session_id_accessor() {
        assert_eq!(hold_event("x").session_id(), Some(&SessionId::from("x")));
        assert_eq!(PhoneEvent::Connected.session_id(), None);
    }
}
