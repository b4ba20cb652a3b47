//! Transaction event bus
//!
//! Typed session events fanned out to a fixed list of observers. Subscribers
//! are registered on an [`EventBusBuilder`]; once [`EventBusBuilder::build`] is
//! called the list is frozen and the resulting [`EventBus`] can be shared
//! across tasks. Delivery is synchronous, in registration order, and a failing
//! observer never stops delivery to the ones after it.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::models::Transaction;
use crate::transport::TransportMode;

/// Which endpoint an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    DirectProxy,
    RelayClient,
    RelayServer,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::DirectProxy => f.write_str("proxy"),
            EndpointKind::RelayClient => f.write_str("relay client"),
            EndpointKind::RelayServer => f.write_str("relay server"),
        }
    }
}

/// Addresses reported once a session is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub mode: TransportMode,
    /// Bound proxy listener; `None` in relay-client mode
    pub proxy: Option<SocketAddr>,
    /// Bound relay server, when one was requested and started
    pub relay_server: Option<SocketAddr>,
    /// Outward relay target in relay-client mode
    pub relay_target: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    TransactionObserved(Arc<Transaction>),
    SessionStarted(SessionInfo),
    SessionStopped,
    SessionFailed { cause: String },
    /// A non-fatal endpoint failure; the session keeps running.
    EndpointFailed { endpoint: EndpointKind, cause: String },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::TransactionObserved(_) => "transaction_observed",
            SessionEvent::SessionStarted(_) => "session_started",
            SessionEvent::SessionStopped => "session_stopped",
            SessionEvent::SessionFailed { .. } => "session_failed",
            SessionEvent::EndpointFailed { .. } => "endpoint_failed",
        }
    }
}

/// A passive consumer of session events.
///
/// Implementations must return quickly: `on_event` runs on the publisher's
/// task. Long work belongs behind a channel.
pub trait Observer: Send + Sync {
    /// Used in log lines when the observer fails.
    fn name(&self) -> &str;

    fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()>;
}

/// Outcome of a single [`EventBus::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct EventBusBuilder {
    subscribers: Vec<Arc<dyn Observer>>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn Observer>) -> &mut Self {
        tracing::debug!("Subscribing observer {}", observer.name());
        self.subscribers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn build(self) -> Arc<EventBus> {
        Arc::new(EventBus {
            subscribers: self.subscribers,
        })
    }
}

pub struct EventBus {
    subscribers: Vec<Arc<dyn Observer>>,
}

impl EventBus {
    /// A bus with no subscribers.
    pub fn empty() -> Arc<Self> {
        EventBusBuilder::new().build()
    }

    pub fn subscriber_names(&self) -> Vec<String> {
        self.subscribers
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn publish(&self, event: &SessionEvent) -> Delivery {
        let mut delivery = Delivery::default();
        for subscriber in &self.subscribers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event)));
            match outcome {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(err)) => {
                    delivery.failed += 1;
                    tracing::warn!(
                        "Observer {} failed on {}: {:#}",
                        subscriber.name(),
                        event.name(),
                        err
                    );
                }
                Err(_) => {
                    delivery.failed += 1;
                    tracing::error!(
                        "Observer {} panicked on {}",
                        subscriber.name(),
                        event.name()
                    );
                }
            }
        }
        delivery
    }

    pub fn publish_transaction(&self, tx: Transaction) -> Delivery {
        self.publish(&SessionEvent::TransactionObserved(Arc::new(tx)))
    }
}

/// Observer that records every event; handy for embedding and tests.
#[derive(Default)]
pub struct EventRecorder {
    events: std::sync::Mutex<Vec<SessionEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::TransactionObserved(tx) => Some(tx),
                _ => None,
            })
            .collect()
    }
}

impl Observer for EventRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("recorder lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, HttpMethod};
    use std::sync::Mutex;

    struct Probe {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        behaviour: Behaviour,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Ok,
        Fail,
        Panic,
    }

    impl Observer for Probe {
        fn name(&self) -> &str {
            self.label
        }

        fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, event.name()));
            match self.behaviour {
                Behaviour::Ok => Ok(()),
                Behaviour::Fail => Err(anyhow::anyhow!("{} refused", self.label)),
                Behaviour::Panic => panic!("{} exploded", self.label),
            }
        }
    }

    fn bus_with(behaviours: &[(&'static str, Behaviour)]) -> (Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = EventBusBuilder::new();
        for (label, behaviour) in behaviours {
            builder.subscribe(Arc::new(Probe {
                label,
                log: log.clone(),
                behaviour: *behaviour,
            }));
        }
        (builder.build(), log)
    }

    fn transaction() -> Transaction {
        Exchange::new(HttpMethod::Get, "http", "example.com", 80, "/", Vec::new()).finish(200, "OK")
    }

    #[test]
    fn delivers_in_registration_order() {
        let (bus, log) = bus_with(&[("a", Behaviour::Ok), ("b", Behaviour::Ok), ("c", Behaviour::Ok)]);
        let delivery = bus.publish(&SessionEvent::SessionStopped);

        assert_eq!(delivery, Delivery { delivered: 3, failed: 0 });
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:session_stopped", "b:session_stopped", "c:session_stopped"]
        );
    }

    #[test]
    fn failing_subscriber_does_not_block_later_ones() {
        let (bus, log) = bus_with(&[
            ("first", Behaviour::Ok),
            ("broken", Behaviour::Fail),
            ("after", Behaviour::Ok),
            ("last", Behaviour::Ok),
        ]);
        let delivery = bus.publish_transaction(transaction());

        assert_eq!(delivery, Delivery { delivered: 3, failed: 1 });
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2], "after:transaction_observed");
        assert_eq!(seen[3], "last:transaction_observed");
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let (bus, log) = bus_with(&[("boom", Behaviour::Panic), ("survivor", Behaviour::Ok)]);
        let delivery = bus.publish(&SessionEvent::SessionFailed {
            cause: "test".into(),
        });

        assert_eq!(delivery, Delivery { delivered: 1, failed: 1 });
        assert!(log
            .lock()
            .unwrap()
            .contains(&"survivor:session_failed".to_string()));
    }

    #[test]
    fn each_subscriber_sees_the_same_transaction() {
        let first = EventRecorder::new();
        let second = EventRecorder::new();
        let mut builder = EventBusBuilder::new();
        builder.subscribe(first.clone()).subscribe(second.clone());
        let bus = builder.build();

        bus.publish_transaction(transaction());
        bus.publish_transaction(transaction());

        let a = first.transactions();
        let b = second.transactions();
        assert_eq!(a.len(), 2);
        assert!(Arc::ptr_eq(&a[0], &b[0]));
        assert!(Arc::ptr_eq(&a[1], &b[1]));
        assert_ne!(a[0].id, a[1].id);
    }

    #[test]
    fn empty_bus_delivers_nothing() {
        let bus = EventBus::empty();
        assert_eq!(bus.publish(&SessionEvent::SessionStopped), Delivery::default());
        assert!(bus.subscriber_names().is_empty());
    }
}
