//! Event delivery to listeners
//!
//! Three delivery modes share one interface:
//!
//! - [`SyncDispatcher`] calls listeners on the emitting thread.
//! - [`AsyncDispatcher`] enqueues into a bounded queue drained in batches
//!   by background workers. A full queue blocks briefly or drops, and
//!   every drop is counted.
//! - [`BufferedDispatcher`] coalesces bursts of progress events per
//!   operator before handing them to an [`AsyncDispatcher`]. A burst is
//!   forwarded once the coalesce window closes, even if nothing follows.
//!
//! Every listener call runs inside its own unwind boundary, so a failing
//! listener never stops the others or the emitting operator.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{
    self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use static_assertions::assert_impl_all;

use crate::config::{DispatchConfig, EventMode, OverflowPolicy};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::listener::SharedListener;
use crate::transform::panic_message;

assert_impl_all!(EventDispatcher: Send, Sync);

/// Which events a registered listener receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerScope {
    /// Every event of the pipeline
    All,
    /// Only events emitted by the named operator
    Operator(String),
}

impl ListenerScope {
    fn matches(&self, operator: &str) -> bool {
        match self {
            ListenerScope::All => true,
            ListenerScope::Operator(name) => name == operator,
        }
    }
}

/// Ordered set of listeners with their scopes
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    entries: Vec<(ListenerScope, SharedListener)>,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; delivery follows registration order
    pub fn register(&mut self, scope: ListenerScope, listener: SharedListener) {
        self.entries.push((scope, listener));
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn deliver(&self, event: &Event, counters: &Counters) {
        for (scope, listener) in &self.entries {
            if !scope.matches(&event.operator) {
                continue;
            }
            if let Err(err) = deliver_one(listener, event) {
                counters.listener_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    operator = %event.operator,
                    event = event.kind_name(),
                    error = %err,
                    "listener failed"
                );
            }
        }
        counters.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

fn deliver_one(listener: &SharedListener, event: &Event) -> Result<()> {
    let mut guard = listener.lock().unwrap_or_else(PoisonError::into_inner);
    match panic::catch_unwind(AssertUnwindSafe(|| guard.on_event(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Listener(format!("{err:#}"))),
        Err(payload) => Err(Error::Listener(format!(
            "panicked: {}",
            panic_message(&*payload)
        ))),
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    delivered: AtomicU64,
    batches: AtomicU64,
    listener_errors: AtomicU64,
    dropped: AtomicU64,
    coalesced: AtomicU64,
}

/// Snapshot of dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events handed to the dispatcher
    pub events_queued: u64,

    /// Events delivered to the listener set
    pub events_delivered: u64,

    /// Delivery batches processed by background workers
    pub batches_delivered: u64,

    /// Listener calls that returned an error or panicked
    pub listener_errors: u64,

    /// Events dropped because the queue was full or closed
    pub dropped: u64,

    /// Progress events replaced by a newer one before delivery
    pub coalesced: u64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            events_queued: self.queued.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            batches_delivered: self.batches.load(Ordering::Relaxed),
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Delivers on the emitting thread
pub struct SyncDispatcher {
    registry: ListenerRegistry,
    counters: Arc<Counters>,
}

impl SyncDispatcher {
    /// Create a dispatcher over `registry`
    pub fn new(registry: ListenerRegistry) -> Self {
        Self {
            registry,
            counters: Arc::default(),
        }
    }

    /// Deliver `event` to every matching listener before returning
    pub fn notify(&self, event: Event) {
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.registry.deliver(&event, &self.counters);
    }
}

/// Number of events accepted but not yet delivered
#[derive(Default)]
struct Pending {
    count: Mutex<u64>,
    drained: Condvar,
}

impl Pending {
    fn add(&self, n: u64) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += n;
    }

    fn done(&self, n: u64) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(n);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .drained
            .wait_timeout_while(count, timeout, |c| *c > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }
}

/// Queues events and delivers them in batches from worker threads
pub struct AsyncDispatcher {
    sender: RwLock<Option<Sender<Event>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    overflow: OverflowPolicy,
    counters: Arc<Counters>,
    pending: Arc<Pending>,
}

impl AsyncDispatcher {
    /// Start the delivery workers
    pub fn new(config: &DispatchConfig, registry: ListenerRegistry) -> Result<Self> {
        Self::with_counters(config, registry, Arc::default())
    }

    fn with_counters(
        config: &DispatchConfig,
        registry: ListenerRegistry,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let (tx, rx) = channel::bounded(config.queue_capacity.max(1));
        let registry = Arc::new(registry);
        let pending = Arc::new(Pending::default());

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for i in 0..config.workers.max(1) {
            let rx = rx.clone();
            let registry = Arc::clone(&registry);
            let counters = Arc::clone(&counters);
            let pending = Arc::clone(&pending);
            let batch_size = config.batch_size.max(1);
            let batch_timeout = config.batch_timeout();
            let handle = thread::Builder::new()
                .name(format!("pipeinfer-events-{i}"))
                .spawn(move || {
                    deliver_batches(&rx, &registry, &counters, &pending, batch_size, batch_timeout);
                })
                .map_err(|e| Error::resource(format!("failed to spawn event worker: {e}")))?;
            workers.push(handle);
        }

        tracing::debug!(
            workers = workers.len(),
            capacity = config.queue_capacity,
            "event dispatcher started"
        );

        Ok(Self {
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            overflow: config.overflow,
            counters,
            pending,
        })
    }

    /// Enqueue `event`, applying the overflow policy when the queue is full
    pub fn notify(&self, event: Event) {
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sender.as_ref() else {
            self.count_drop("dispatcher is shut down");
            return;
        };

        self.pending.add(1);
        let accepted = match self.overflow {
            OverflowPolicy::Drop => match tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
            },
            OverflowPolicy::Block { timeout_ms } => {
                match tx.send_timeout(event, Duration::from_millis(timeout_ms)) {
                    Ok(()) => true,
                    Err(SendTimeoutError::Timeout(_) | SendTimeoutError::Disconnected(_)) => false,
                }
            }
        };
        if !accepted {
            self.pending.done(1);
            self.count_drop("event queue full");
        }
    }

    fn count_drop(&self, reason: &str) {
        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(dropped, reason, "event dropped");
    }

    /// Block until every accepted event was delivered
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        if self.pending.wait_drained(timeout) {
            Ok(())
        } else {
            Err(Error::Timeout {
                point: "event dispatcher flush".into(),
                waited: timeout,
                during_shutdown: true,
            })
        }
    }

    /// Drain the queue, stop accepting events and join the workers
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let flushed = self.flush(timeout);
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if flushed.is_ok() {
            let workers = {
                let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *workers)
            };
            for worker in workers {
                if worker.join().is_err() {
                    tracing::error!("event worker panicked");
                }
            }
        }
        flushed
    }
}

impl Drop for AsyncDispatcher {
    fn drop(&mut self) {
        // Workers exit on their own once the queue is closed and drained.
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn deliver_batches(
    rx: &Receiver<Event>,
    registry: &ListenerRegistry,
    counters: &Counters,
    pending: &Pending,
    batch_size: usize,
    batch_timeout: Duration,
) {
    let mut batch = Vec::with_capacity(batch_size);
    while let Ok(first) = rx.recv() {
        batch.push(first);
        let deadline = Instant::now() + batch_timeout;
        while batch.len() < batch_size {
            match rx.recv_deadline(deadline) {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }

        let n = batch.len() as u64;
        for event in batch.drain(..) {
            registry.deliver(&event, counters);
        }
        counters.batches.fetch_add(1, Ordering::Relaxed);
        pending.done(n);
    }
}

#[derive(Default)]
struct CoalesceBuffer {
    events: Vec<Event>,
    opened: Option<Instant>,
    received: usize,
}

struct Coalescer {
    inner: AsyncDispatcher,
    buffer: Mutex<CoalesceBuffer>,
    window: Duration,
    max: usize,
}

impl Coalescer {
    fn lock(&self) -> MutexGuard<'_, CoalesceBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(&self, buffer: &mut CoalesceBuffer) {
        for event in buffer.events.drain(..) {
            self.inner.notify(event);
        }
        buffer.opened = None;
        buffer.received = 0;
    }

    /// Time left before the open window closes, or a full window if none is open
    fn until_due(&self) -> Duration {
        match self.lock().opened {
            Some(opened) => self.window.saturating_sub(opened.elapsed()),
            None => self.window,
        }
    }

    fn drain_due(&self) {
        let mut buffer = self.lock();
        if buffer.opened.is_some_and(|t| t.elapsed() >= self.window) {
            self.drain(&mut buffer);
        }
    }
}

/// Closes coalesce windows that no later event arrives to close
fn run_flusher(coalescer: &Coalescer, stop: &Receiver<()>) {
    loop {
        match stop.recv_timeout(coalescer.until_due()) {
            Err(RecvTimeoutError::Timeout) => coalescer.drain_due(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Coalesces progress bursts, then delivers asynchronously.
///
/// A background flusher forwards a buffered burst once its window has
/// been open for `coalesce_window_ms`, so the last progress of a burst
/// is never held back waiting for another event.
pub struct BufferedDispatcher {
    coalescer: Arc<Coalescer>,
    stop: Mutex<Option<Sender<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedDispatcher {
    /// Start the underlying asynchronous dispatcher and the window flusher
    pub fn new(config: &DispatchConfig, registry: ListenerRegistry) -> Result<Self> {
        let coalescer = Arc::new(Coalescer {
            inner: AsyncDispatcher::new(config, registry)?,
            buffer: Mutex::new(CoalesceBuffer::default()),
            window: config.coalesce_window(),
            max: config.coalesce_max.max(1),
        });

        // A zero window drains on every event, leaving nothing to time.
        if coalescer.window.is_zero() {
            return Ok(Self {
                coalescer,
                stop: Mutex::new(None),
                flusher: Mutex::new(None),
            });
        }
        let (stop_tx, stop_rx) = channel::bounded(1);
        let shared = Arc::clone(&coalescer);
        let flusher = thread::Builder::new()
            .name("pipeinfer-events-flush".into())
            .spawn(move || run_flusher(&shared, &stop_rx))
            .map_err(|e| Error::resource(format!("failed to spawn event flusher: {e}")))?;

        Ok(Self {
            coalescer,
            stop: Mutex::new(Some(stop_tx)),
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Buffer progress events; forward everything else after a flush
    pub fn notify(&self, event: Event) {
        let coalescer = &*self.coalescer;
        let mut buffer = coalescer.lock();
        if !event.is_progress() {
            coalescer.drain(&mut buffer);
            coalescer.inner.notify(event);
            return;
        }

        buffer.received += 1;
        buffer.opened.get_or_insert_with(Instant::now);
        if let Some(slot) = buffer
            .events
            .iter_mut()
            .find(|e| e.operator == event.operator)
        {
            *slot = event;
            coalescer.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        } else {
            buffer.events.push(event);
        }

        let expired = buffer.opened.is_some_and(|t| t.elapsed() >= coalescer.window);
        if buffer.received >= coalescer.max || expired {
            coalescer.drain(&mut buffer);
        }
    }

    /// Forward buffered events and wait for delivery
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        {
            let mut buffer = self.coalescer.lock();
            self.coalescer.drain(&mut buffer);
        }
        self.coalescer.inner.flush(timeout)
    }

    /// Stop the flusher, forward what is buffered, then stop the
    /// underlying dispatcher
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.stop_flusher();
        {
            let mut buffer = self.coalescer.lock();
            self.coalescer.drain(&mut buffer);
        }
        self.coalescer.inner.shutdown(timeout)
    }

    fn stop_flusher(&self) {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        let flusher = self.flusher.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(flusher) = flusher {
            if flusher.join().is_err() {
                tracing::error!("event flusher panicked");
            }
        }
    }

    fn stats(&self) -> DispatchStats {
        self.coalescer.inner.counters.snapshot()
    }
}

impl Drop for BufferedDispatcher {
    fn drop(&mut self) {
        // The flusher sees the closed channel and exits on its next wakeup.
        self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Listener-facing dispatcher in one of three modes
pub enum EventDispatcher {
    /// See [`SyncDispatcher`]
    Sync(SyncDispatcher),
    /// See [`AsyncDispatcher`]
    Async(AsyncDispatcher),
    /// See [`BufferedDispatcher`]
    Buffered(BufferedDispatcher),
}

impl EventDispatcher {
    /// Build the dispatcher described by `config`
    pub fn new(config: &DispatchConfig, registry: ListenerRegistry) -> Result<Self> {
        config.validate()?;
        Ok(match config.mode {
            EventMode::Sync => EventDispatcher::Sync(SyncDispatcher::new(registry)),
            EventMode::Async => EventDispatcher::Async(AsyncDispatcher::with_counters(
                config,
                registry,
                Arc::default(),
            )?),
            EventMode::Buffered => {
                EventDispatcher::Buffered(BufferedDispatcher::new(config, registry)?)
            }
        })
    }

    /// A synchronous dispatcher over `registry`
    pub fn sync(registry: ListenerRegistry) -> Self {
        EventDispatcher::Sync(SyncDispatcher::new(registry))
    }

    /// Delivery mode
    pub fn mode(&self) -> EventMode {
        match self {
            EventDispatcher::Sync(_) => EventMode::Sync,
            EventDispatcher::Async(_) => EventMode::Async,
            EventDispatcher::Buffered(_) => EventMode::Buffered,
        }
    }

    /// Hand an event to the listeners
    pub fn notify(&self, event: Event) {
        match self {
            EventDispatcher::Sync(d) => d.notify(event),
            EventDispatcher::Async(d) => d.notify(event),
            EventDispatcher::Buffered(d) => d.notify(event),
        }
    }

    /// Wait until every accepted event was delivered
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        match self {
            EventDispatcher::Sync(_) => Ok(()),
            EventDispatcher::Async(d) => d.flush(timeout),
            EventDispatcher::Buffered(d) => d.flush(timeout),
        }
    }

    /// Deliver what is queued and release background workers
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        match self {
            EventDispatcher::Sync(_) => Ok(()),
            EventDispatcher::Async(d) => d.shutdown(timeout),
            EventDispatcher::Buffered(d) => d.shutdown(timeout),
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> DispatchStats {
        match self {
            EventDispatcher::Sync(d) => d.counters.snapshot(),
            EventDispatcher::Async(d) => d.counters.snapshot(),
            EventDispatcher::Buffered(d) => d.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{shared, CollectingListener, EventListener};

    mockall::mock! {
        pub Listener {}
        impl EventListener for Listener {
            fn on_event(&mut self, event: &Event) -> anyhow::Result<()>;
        }
    }

    struct Failing;

    impl EventListener for Failing {
        fn on_event(&mut self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("listener is broken")
        }
    }

    struct Panicking;

    impl EventListener for Panicking {
        fn on_event(&mut self, _event: &Event) -> anyhow::Result<()> {
            panic!("listener exploded")
        }
    }

    fn registry_with(listeners: Vec<SharedListener>) -> ListenerRegistry {
        let mut registry = ListenerRegistry::new();
        for listener in listeners {
            registry.register(ListenerScope::All, listener);
        }
        registry
    }

    #[test]
    fn test_sync_isolates_failing_listeners() {
        let collector = CollectingListener::new();
        let registry = registry_with(vec![
            shared(Failing),
            shared(Panicking),
            shared(collector.clone()),
        ]);
        let dispatcher = EventDispatcher::sync(registry);

        dispatcher.notify(Event::operator_start("a"));
        dispatcher.notify(Event::operator_start("b"));

        assert_eq!(collector.len(), 2);
        let stats = dispatcher.stats();
        assert_eq!(stats.listener_errors, 4);
        assert_eq!(stats.events_delivered, 2);
    }

    #[test]
    fn test_sync_calls_in_registration_order() {
        let mut first = MockListener::new();
        first.expect_on_event().times(1).returning(|_| Ok(()));
        let mut second = MockListener::new();
        second.expect_on_event().times(1).returning(|_| Ok(()));

        let dispatcher = EventDispatcher::sync(registry_with(vec![shared(first), shared(second)]));
        dispatcher.notify(Event::operator_start("a"));
    }

    #[test]
    fn test_operator_scope() {
        let collector = CollectingListener::new();
        let mut registry = ListenerRegistry::new();
        registry.register(ListenerScope::Operator("b".into()), shared(collector.clone()));
        let dispatcher = EventDispatcher::sync(registry);

        dispatcher.notify(Event::operator_start("a"));
        dispatcher.notify(Event::operator_start("b"));

        let events = collector.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operator, "b");
    }

    #[test]
    fn test_async_delivers_in_batches() {
        let collector = CollectingListener::new();
        let config = DispatchConfig {
            mode: EventMode::Async,
            batch_size: 10,
            batch_timeout_ms: 5,
            workers: 1,
            ..DispatchConfig::default()
        };
        let dispatcher =
            EventDispatcher::new(&config, registry_with(vec![shared(collector.clone())])).unwrap();

        for i in 0..100 {
            dispatcher.notify(Event::progress("tiles", i, Some(100)));
        }
        dispatcher.shutdown(Duration::from_secs(5)).unwrap();

        assert_eq!(collector.len(), 100);
        let stats = dispatcher.stats();
        assert_eq!(stats.events_queued, 100);
        assert_eq!(stats.events_delivered, 100);
        assert_eq!(stats.dropped, 0);
        assert!(stats.batches_delivered >= 10);
    }

    #[test]
    fn test_async_drop_policy_counts_drops() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();

        let blocker = {
            let gate = Arc::clone(&gate);
            move |_: &Event| {
                let _guard = gate.lock().unwrap();
            }
        };

        let config = DispatchConfig {
            mode: EventMode::Async,
            queue_capacity: 2,
            batch_size: 1,
            batch_timeout_ms: 1,
            workers: 1,
            overflow: OverflowPolicy::Drop,
            ..DispatchConfig::default()
        };
        let dispatcher =
            EventDispatcher::new(&config, registry_with(vec![shared(blocker)])).unwrap();

        for i in 0..20 {
            dispatcher.notify(Event::progress("tiles", i, None));
        }
        drop(held);
        dispatcher.shutdown(Duration::from_secs(5)).unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.events_queued, 20);
        assert!(stats.dropped > 0);
        assert_eq!(stats.events_delivered + stats.dropped, 20);
    }

    #[test]
    fn test_flush_times_out_on_stuck_listener() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let blocker = {
            let gate = Arc::clone(&gate);
            move |_: &Event| {
                let _guard = gate.lock().unwrap();
            }
        };

        let config = DispatchConfig::with_mode(EventMode::Async);
        let dispatcher =
            EventDispatcher::new(&config, registry_with(vec![shared(blocker)])).unwrap();
        dispatcher.notify(Event::operator_start("a"));

        let err = dispatcher.flush(Duration::from_millis(50)).unwrap_err();
        assert!(err.is_fatal());
        drop(held);
        dispatcher.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_buffered_coalesces_progress() {
        let collector = CollectingListener::new();
        let config = DispatchConfig {
            mode: EventMode::Buffered,
            coalesce_max: 1_000,
            coalesce_window_ms: 60_000,
            batch_timeout_ms: 1,
            ..DispatchConfig::default()
        };
        let dispatcher =
            EventDispatcher::new(&config, registry_with(vec![shared(collector.clone())])).unwrap();

        dispatcher.notify(Event::operator_start("tiles"));
        for i in 1..=50 {
            dispatcher.notify(Event::progress("tiles", i, Some(50)));
        }
        dispatcher.notify(Event::operator_complete("tiles", Duration::from_millis(1), 50, 50));
        dispatcher.shutdown(Duration::from_secs(5)).unwrap();

        let events = collector.events();
        let progress = collector.of_kind("progress");
        assert_eq!(progress.len(), 1);
        assert_eq!(
            progress[0].kind,
            crate::event::EventKind::Progress {
                processed: 50,
                total_estimate: Some(50)
            }
        );
        assert_eq!(events.len(), 3);
        assert_eq!(dispatcher.stats().coalesced, 49);
    }

    #[test]
    fn test_buffered_forwards_burst_when_window_closes() {
        let collector = CollectingListener::new();
        let config = DispatchConfig {
            mode: EventMode::Buffered,
            coalesce_max: 1_000,
            coalesce_window_ms: 30,
            batch_timeout_ms: 1,
            ..DispatchConfig::default()
        };
        let dispatcher =
            EventDispatcher::new(&config, registry_with(vec![shared(collector.clone())])).unwrap();

        for i in 1..=3 {
            dispatcher.notify(Event::progress("tiles", i, Some(3)));
        }
        thread::sleep(Duration::from_millis(300));

        let progress = collector.of_kind("progress");
        assert_eq!(progress.len(), 1);
        assert_eq!(
            progress[0].kind,
            crate::event::EventKind::Progress {
                processed: 3,
                total_estimate: Some(3)
            }
        );
        dispatcher.shutdown(Duration::from_secs(5)).unwrap();
        assert_eq!(collector.of_kind("progress").len(), 1);
    }

    #[test]
    fn test_buffered_flushes_on_count() {
        let collector = CollectingListener::new();
        let config = DispatchConfig {
            mode: EventMode::Buffered,
            coalesce_max: 5,
            coalesce_window_ms: 60_000,
            batch_timeout_ms: 1,
            ..DispatchConfig::default()
        };
        let dispatcher =
            EventDispatcher::new(&config, registry_with(vec![shared(collector.clone())])).unwrap();

        for i in 1..=10 {
            dispatcher.notify(Event::progress("tiles", i, None));
        }
        dispatcher.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(collector.of_kind("progress").len(), 2);
        dispatcher.shutdown(Duration::from_secs(5)).unwrap();
    }
}
