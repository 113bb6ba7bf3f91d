use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::event::{Event, EventFilter, EventKind};

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Counters exposed by `EventBus::stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventBusStats {
    pub events_published: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub handler_errors: u64,
    pub subscribers: usize,
    pub queue_size: usize,
    pub running: bool,
}

struct Inner {
    capacity: usize,

    /// Sending half of the bounded queue; taken on stop
    tx: Mutex<Option<mpsc::Sender<Event>>>,

    /// Receiving half, taken by the consumer loop on start
    rx: Mutex<Option<mpsc::Receiver<Event>>>,

    /// Handlers grouped by filter
    handlers: RwLock<HashMap<EventFilter, Vec<(u64, Handler)>>>,

    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
    running: AtomicBool,
    next_handler_id: AtomicU64,

    events_published: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
    handler_errors: AtomicU64,
}

/// Async publish/subscribe backbone.
///
/// Events go through a bounded queue drained by a single consumer loop. Each
/// event is handed to every matching handler concurrently; a failing or
/// panicking handler is counted and logged but never affects other handlers
/// or the publisher. Cloning is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

/// Handle returned by `subscribe`; call `unsubscribe` to detach the handler.
pub struct Subscription {
    id: u64,
    filter: EventFilter,
    bus: Weak<Inner>,
}

impl Subscription {
    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut handlers = inner.handlers.write().unwrap_or_else(|p| p.into_inner());
        let Some(list) = handlers.get_mut(&self.filter) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&self.filter);
        }
        removed
    }
}

impl EventBus {
    /// Create a bus whose queue holds at most `capacity` pending events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                capacity,
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                handlers: RwLock::new(HashMap::new()),
                consumer: tokio::sync::Mutex::new(None),
                accepting: AtomicBool::new(true),
                running: AtomicBool::new(false),
                next_handler_id: AtomicU64::new(1),
                events_published: AtomicU64::new(0),
                events_dispatched: AtomicU64::new(0),
                events_dropped: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the consumer loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut consumer = self.inner.consumer.lock().await;
        if consumer.is_some() {
            return;
        }
        let rx = self.inner.rx.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(mut rx) = rx else {
            warn!("Event bus was already stopped; not starting");
            return;
        };

        let inner = self.inner.clone();
        self.inner.running.store(true, Ordering::SeqCst);
        *consumer = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(&inner, event).await;
            }
            inner.running.store(false, Ordering::SeqCst);
            debug!("Event bus consumer loop finished");
        }));
        info!("Event bus started (capacity {})", self.inner.capacity);
    }

    /// Stop accepting events, dispatch everything already queued, then return.
    pub async fn stop(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        // Dropping the last sender lets the consumer exit once the queue is empty
        self.inner.tx.lock().unwrap_or_else(|p| p.into_inner()).take();

        let handle = self.inner.consumer.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Event bus consumer ended abnormally: {}", e);
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
        info!("Event bus stopped");
    }

    fn sender(&self) -> Option<mpsc::Sender<Event>> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.tx.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Queue an event, waiting for room when the queue is full.
    /// Returns false once the bus is stopped.
    pub async fn publish(&self, event: Event) -> bool {
        let Some(tx) = self.sender() else {
            debug!("Event bus stopped, discarding {}", event.kind);
            return false;
        };
        match tx.send(event).await {
            Ok(()) => {
                self.inner.events_published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Queue an event without waiting. Drops it with a warning when the
    /// queue is full.
    pub fn publish_sync(&self, event: Event) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => {
                self.inner.events_published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.inner.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Event queue full, dropping {} event {}", event.kind, event.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Build and publish an event in one call.
    pub async fn emit(&self, kind: EventKind, data: Map<String, Value>, source: &str) -> bool {
        self.publish(Event::new(kind, source).with_data(data)).await
    }

    /// Register `handler` for every event matching `filter`.
    pub fn subscribe<F, Fut>(&self, filter: impl Into<EventFilter>, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let filter = filter.into();
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));

        self.inner
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(filter.clone())
            .or_default()
            .push((id, handler));

        debug!("Subscribed handler {} to {:?}", id, filter);
        Subscription {
            id,
            filter,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn stats(&self) -> EventBusStats {
        let queue_size = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|tx| self.inner.capacity - tx.capacity())
            .unwrap_or(0);

        EventBusStats {
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            events_dispatched: self.inner.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.inner.events_dropped.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
            subscribers: self.handler_count(),
            queue_size,
            running: self.inner.running.load(Ordering::SeqCst),
        }
    }
}

/// Run every handler matching `event` concurrently and wait for all of them.
async fn dispatch(inner: &Arc<Inner>, event: Event) {
    let matching: Vec<(u64, Handler)> = {
        let handlers = inner.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers
            .iter()
            .filter(|(filter, _)| filter.matches(event.kind))
            .flat_map(|(_, list)| list.iter().cloned())
            .collect()
    };

    let kind = event.kind;
    let runs = matching.into_iter().map(|(id, handler)| {
        let event = event.clone();
        let task = tokio::spawn(async move { handler(event).await });
        async move { (id, task.await) }
    });

    for (id, outcome) in join_all(runs).await {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                inner.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Handler {} failed on {}: {:#}", id, kind, e);
            }
            Err(e) => {
                inner.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!("Handler {} panicked on {}: {}", id, kind, e);
            }
        }
    }
    inner.events_dispatched.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_handler(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
        move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_never_blocks() {
        let bus = EventBus::new(2);
        bus.start().await;
        for _ in 0..10 {
            bus.publish_sync(Event::new(EventKind::TaskQueued, "test"));
        }
        assert!(bus.publish(Event::new(EventKind::TaskQueued, "test")).await);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_publish_sync_drops_when_full() {
        // Not started: nothing drains the queue
        let bus = EventBus::new(1);
        assert!(bus.publish_sync(Event::new(EventKind::TaskQueued, "test")));
        assert!(!bus.publish_sync(Event::new(EventKind::TaskQueued, "test")));
        assert_eq!(bus.stats().events_dropped, 1);
        assert_eq!(bus.stats().queue_size, 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new(16);
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::TaskFailed, |_event| async {
            Err::<(), _>(anyhow::anyhow!("handler always fails"))
        });
        bus.subscribe(EventKind::TaskFailed, |event: Event| async move {
            if event.kind == EventKind::TaskFailed {
                panic!("handler panics");
            }
            Ok::<(), anyhow::Error>(())
        });
        bus.subscribe(EventKind::TaskFailed, counter_handler(delivered.clone()));

        bus.start().await;
        for _ in 0..3 {
            assert!(bus.publish(Event::new(EventKind::TaskFailed, "test")).await);
        }
        bus.stop().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 3);
        let stats = bus.stats();
        assert_eq!(stats.handler_errors, 6);
        assert_eq!(stats.events_dispatched, 3);
    }

    #[tokio::test]
    async fn test_wildcard_and_namespace_delivery() {
        let bus = EventBus::new(16);
        let all = Arc::new(AtomicUsize::new(0));
        let tasks = Arc::new(AtomicUsize::new(0));
        let exact = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventFilter::All, counter_handler(all.clone()));
        bus.subscribe(EventFilter::Namespace("task".into()), counter_handler(tasks.clone()));
        bus.subscribe(EventKind::TaskCompleted, counter_handler(exact.clone()));

        bus.start().await;
        bus.emit(EventKind::TaskCompleted, Map::new(), "test").await;
        bus.emit(EventKind::TaskStarted, Map::new(), "test").await;
        bus.emit(EventKind::CircuitOpened, Map::new(), "test").await;
        bus.stop().await;

        assert_eq!(all.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.load(Ordering::SeqCst), 2);
        assert_eq!(exact.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let sub = bus.subscribe(EventKind::TaskQueued, counter_handler(count.clone()));
        assert_eq!(bus.handler_count(), 1);
        assert!(sub.unsubscribe());
        assert_eq!(bus.handler_count(), 0);

        bus.start().await;
        bus.publish(Event::new(EventKind::TaskQueued, "test")).await;
        bus.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_drains_queued_events_and_rejects_new_ones() {
        let bus = EventBus::new(64);
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventFilter::All, counter_handler(count.clone()));

        // Queue before the consumer runs, then start and stop immediately
        for _ in 0..20 {
            assert!(bus.publish_sync(Event::new(EventKind::TaskQueued, "test")));
        }
        bus.start().await;
        bus.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 20);
        assert!(!bus.publish(Event::new(EventKind::TaskQueued, "test")).await);
        assert!(!bus.publish_sync(Event::new(EventKind::TaskQueued, "test")));
        assert!(!bus.stats().running);
    }
}
