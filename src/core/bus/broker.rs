//! Event bus implementation
//!
//! A single dispatcher thread drains an unbounded FIFO queue and calls the
//! handlers of each event's topic one after another, so delivery order is the
//! publish order across all topics.

use super::events::{Event, Topic};
use super::BusError;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Subscription handle for unsubscribing from events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: SubscriptionId,
    /// Sequence number taken at registration; only later events are delivered
    since: u64,
    once: bool,
    handler: Handler,
}

enum Envelope {
    Deliver { seq: u64, event: Event },
    Flush(Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct Registry {
    handlers: RwLock<HashMap<Topic, Vec<Registration>>>,
    sequence: AtomicU64,
}

impl Registry {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        for registrations in handlers.values_mut() {
            if let Some(pos) = registrations.iter().position(|r| r.id == id) {
                registrations.remove(pos);
                return true;
            }
        }
        false
    }

    fn dispatch(&self, seq: u64, event: &Event) {
        let targets: Vec<(SubscriptionId, bool, Handler)> = {
            let handlers = self.handlers.read();
            match handlers.get(&event.topic()) {
                Some(registrations) => registrations
                    .iter()
                    .filter(|r| r.since < seq)
                    .map(|r| (r.id, r.once, r.handler.clone()))
                    .collect(),
                None => return,
            }
        };

        for (id, once, handler) in targets {
            // A one-shot handler fires only if this delivery is the one that removes it
            if once && !self.remove(id) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!("Handler {} for {} panicked; skipped", id, event.topic());
            }
        }
    }
}

enum DispatcherState {
    Idle(Receiver<Envelope>),
    Running(JoinHandle<()>),
    Stopped,
}

struct Inner {
    sender: Sender<Envelope>,
    registry: Arc<Registry>,
    dispatcher: Mutex<DispatcherState>,
    dispatcher_thread: RwLock<Option<ThreadId>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// In-process publish/subscribe broker
///
/// Cloning is cheap; every clone talks to the same queue and dispatcher.
/// Construct one per application instance and hand clones to every component.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a new event bus. The dispatcher starts on first use.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(Inner {
                sender,
                registry: Arc::new(Registry::default()),
                dispatcher: Mutex::new(DispatcherState::Idle(receiver)),
                dispatcher_thread: RwLock::new(None),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an event. Never blocks on handlers.
    pub fn publish(&self, event: Event) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            tracing::debug!("Bus shut down; dropping {} event", event.topic());
            return;
        }
        let seq = self.inner.registry.next_sequence();
        self.ensure_dispatcher();
        if self.inner.sender.send(Envelope::Deliver { seq, event }).is_err() {
            tracing::debug!("Bus queue closed; event dropped");
        }
    }

    /// Publish a `log:line` event
    pub fn publish_log(&self, line: impl Into<String>) {
        self.publish(Event::log(line));
    }

    /// Register a handler for `topic`
    ///
    /// Handlers of one topic run in registration order on the dispatcher
    /// thread. A slow handler delays delivery for every topic.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(topic, false, Arc::new(handler))
    }

    /// Register a handler that is removed after its first delivery
    pub fn subscribe_once<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(topic, true, Arc::new(handler))
    }

    /// Register a handler by wire name, rejecting unknown topic keys
    pub fn subscribe_topic<F>(&self, topic: &str, handler: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let topic: Topic = topic.parse()?;
        Ok(self.subscribe(topic, handler))
    }

    /// Forward events of `topic` into a channel for async consumers
    pub fn subscribe_channel(&self, topic: Topic) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(topic, move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Remove a subscription. Returns true if it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.registry.remove(id);
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    /// Number of registered handlers across all topics
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .registry
            .handlers
            .read()
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Wait until every event published before this call has been dispatched
    ///
    /// Returns false on timeout, after shutdown, or when called from a handler.
    pub fn flush(&self, timeout: Duration) -> bool {
        if !self.inner.started.load(Ordering::SeqCst) {
            return true;
        }
        if self.is_dispatcher_thread() || self.inner.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.inner.sender.send(Envelope::Flush(ack_tx)).is_err() {
            return false;
        }
        match ack_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Stop the dispatcher after it drains the events already queued
    ///
    /// Later publishes are dropped. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = std::mem::replace(&mut *self.inner.dispatcher.lock(), DispatcherState::Stopped);
        if let DispatcherState::Running(handle) = state {
            let _ = self.inner.sender.send(Envelope::Shutdown);
            if self.is_dispatcher_thread() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("Bus dispatcher exited with a panic");
            }
        }
        tracing::debug!("Event bus shut down");
    }

    fn register(&self, topic: Topic, once: bool, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId::new();
        {
            let mut handlers = self.inner.registry.handlers.write();
            let since = self.inner.registry.next_sequence();
            handlers.entry(topic).or_default().push(Registration {
                id,
                since,
                once,
                handler,
            });
        }
        self.ensure_dispatcher();
        tracing::debug!("Subscription {} added for {}", id, topic);
        id
    }

    fn is_dispatcher_thread(&self) -> bool {
        *self.inner.dispatcher_thread.read() == Some(thread::current().id())
    }

    fn ensure_dispatcher(&self) {
        if self.inner.started.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.inner.dispatcher.lock();
        let receiver = match &*state {
            DispatcherState::Idle(receiver) => receiver.clone(),
            _ => return,
        };
        let registry = self.inner.registry.clone();
        let spawned = thread::Builder::new()
            .name("event-bus".to_string())
            .spawn(move || run_dispatcher(receiver, registry));
        match spawned {
            Ok(handle) => {
                *self.inner.dispatcher_thread.write() = Some(handle.thread().id());
                *state = DispatcherState::Running(handle);
                self.inner.started.store(true, Ordering::Release);
            }
            Err(e) => tracing::error!("Failed to start bus dispatcher: {}", e),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

fn run_dispatcher(receiver: Receiver<Envelope>, registry: Arc<Registry>) {
    tracing::debug!("Bus dispatcher started");
    while let Ok(envelope) = receiver.recv() {
        match envelope {
            Envelope::Deliver { seq, event } => registry.dispatch(seq, &event),
            Envelope::Flush(ack) => {
                let _ = ack.send(());
            }
            Envelope::Shutdown => break,
        }
    }
    tracing::debug!("Bus dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bus::{ConnectionState, ScanReport};
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new();

        let id = bus.subscribe(Topic::LogLine, |_| {});
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);

        // Double unsubscribe should return false
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_handlers_see_publish_order() {
        let bus = EventBus::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let sink = first.clone();
        bus.subscribe(Topic::LogLine, move |e| {
            sink.lock().push(e.as_log_line().unwrap_or_default().to_string());
        });
        let sink = second.clone();
        bus.subscribe(Topic::LogLine, move |e| {
            sink.lock().push(e.as_log_line().unwrap_or_default().to_string());
        });

        for i in 0..200 {
            bus.publish_log(format!("line {i}"));
        }
        assert!(bus.flush(WAIT));

        let expected: Vec<String> = (0..200).map(|i| format!("line {i}")).collect();
        assert_eq!(*first.lock(), expected);
        assert_eq!(*second.lock(), expected);
    }

    #[test]
    fn test_total_order_across_topics() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for topic in Topic::ALL {
            let sink = seen.clone();
            bus.subscribe(topic, move |e| sink.lock().push(e.topic()));
        }

        bus.publish(Event::ConnState(ConnectionState::connected("COM3")));
        bus.publish_log("a");
        bus.publish(Event::ScanResult(ScanReport::default()));
        bus.publish_log("b");
        assert!(bus.flush(WAIT));

        assert_eq!(
            *seen.lock(),
            vec![Topic::ConnState, Topic::LogLine, Topic::ScanResult, Topic::LogLine]
        );
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Topic::LogLine, |_| panic!("handler failure"));
        let c = counter.clone();
        bus.subscribe(Topic::LogLine, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_log("one");
        bus.publish_log("two");
        assert!(bus.flush(WAIT));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_late_subscriber_misses_queued_events() {
        let bus = EventBus::new();
        let gate = Arc::new(Mutex::new(()));
        let counter = Arc::new(AtomicUsize::new(0));

        // Hold the dispatcher inside a handler so the next event stays queued
        let blocker = gate.clone();
        bus.subscribe(Topic::ConnState, move |_| {
            let _held = blocker.lock();
        });

        let held = gate.lock();
        bus.publish(Event::ConnState(ConnectionState::disconnected(None)));
        bus.publish_log("queued before subscribe");

        let c = counter.clone();
        bus.subscribe(Topic::LogLine, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(held);

        bus.publish_log("after subscribe");
        assert!(bus.flush(WAIT));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_once_fires_once() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        bus.subscribe_once(Topic::ScanResult, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(Event::ScanResult(ScanReport::default()));
        bus.publish(Event::ScanResult(ScanReport::default()));
        assert!(bus.flush(WAIT));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_unknown_topic_rejected() {
        let bus = EventBus::new();
        assert!(bus.subscribe_topic("conn:state", |_| {}).is_ok());
        assert!(matches!(
            bus.subscribe_topic("conn:status", |_| {}),
            Err(BusError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_shutdown_drops_later_events() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        bus.subscribe(Topic::LogLine, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_log("delivered");
        bus.shutdown();
        bus.shutdown();
        bus.publish_log("dropped");

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!bus.flush(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel(Topic::ConnState);

        bus.publish(Event::ConnState(ConnectionState::connected("/dev/ttyACM0")));
        bus.publish_log("not forwarded");

        let received = tokio::time::timeout(WAIT, rx.recv()).await.ok().flatten();
        assert_eq!(
            received,
            Some(Event::ConnState(ConnectionState::connected("/dev/ttyACM0")))
        );
        assert!(rx.try_recv().is_err());
    }
}
