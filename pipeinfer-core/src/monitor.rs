//! Process-wide performance monitor
//!
//! A single [`SharedMonitor`] samples process CPU and memory on an
//! interval and caches the result, so operators never pay for a system
//! query on their hot path. Sampling runs only while at least one
//! [`MonitorHandle`] is alive: the first `acquire` starts the sampler
//! thread and dropping the last handle stops it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::event::{Event, EventKind};

/// Default sampling interval
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Cached process metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSnapshot {
    /// CPU usage of this process across all cores (0-100)
    pub cpu_percent: f32,

    /// Resident memory of this process in bytes
    pub memory_bytes: u64,

    /// Age of the sample when it was read
    pub age: Duration,
}

/// Monitor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Sessions ever started
    pub total_sessions: u64,

    /// Sessions currently open
    pub active_sessions: u64,

    /// System samples taken
    pub samples_taken: u64,

    /// Snapshot reads
    pub snapshot_queries: u64,

    /// Snapshot reads served from the cache
    pub cache_hits: u64,

    /// Performance events produced
    pub events_generated: u64,
}

impl MonitorStats {
    /// Fraction of snapshot reads served from the cache
    pub fn cache_hit_rate(&self) -> f64 {
        if self.snapshot_queries == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.snapshot_queries as f64
        }
    }
}

struct Collector {
    system: System,
    pid: Pid,
    cpus: f32,
}

impl Collector {
    fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Self {
            system,
            pid,
            cpus: num_cpus::get().max(1) as f32,
        }
    }

    fn sample(&mut self) -> (f32, u64) {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system
            .process(self.pid)
            .map_or((0.0, 0), |p| (p.cpu_usage() / self.cpus, p.memory()))
    }
}

#[derive(Default)]
struct Lifecycle {
    refs: usize,
    stop: Option<Sender<()>>,
    sampler: Option<JoinHandle<()>>,
}

struct SessionInfo {
    operator: Arc<str>,
    started: Instant,
}

struct MonitorInner {
    interval: Duration,
    epoch: Instant,
    lifecycle: Mutex<Lifecycle>,
    collector: Mutex<Option<Collector>>,
    cpu_bits: AtomicU32,
    memory: AtomicU64,
    sampled_at_us: AtomicU64,
    has_sample: AtomicBool,
    sessions: Mutex<HashMap<u64, SessionInfo>>,
    next_session: AtomicU64,
    total_sessions: AtomicU64,
    samples_taken: AtomicU64,
    snapshot_queries: AtomicU64,
    cache_hits: AtomicU64,
    events_generated: AtomicU64,
}

impl MonitorInner {
    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn sample(&self) {
        let (cpu, memory) = {
            let mut collector = self.collector.lock().unwrap_or_else(PoisonError::into_inner);
            collector.get_or_insert_with(Collector::new).sample()
        };
        self.cpu_bits.store(cpu.to_bits(), Ordering::Relaxed);
        self.memory.store(memory, Ordering::Relaxed);
        self.sampled_at_us.store(self.now_us(), Ordering::Release);
        self.has_sample.store(true, Ordering::Release);
        self.samples_taken.fetch_add(1, Ordering::Relaxed);
    }

    fn cached_age(&self) -> Option<Duration> {
        if !self.has_sample.load(Ordering::Acquire) {
            return None;
        }
        let at = self.sampled_at_us.load(Ordering::Acquire);
        Some(Duration::from_micros(self.now_us().saturating_sub(at)))
    }
}

/// Handle to the shared sampler; clones refer to the same monitor
#[derive(Clone)]
pub struct SharedMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for SharedMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMonitor")
            .field("interval", &self.inner.interval)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl SharedMonitor {
    /// Create a monitor that samples every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                interval: interval.max(Duration::from_millis(1)),
                epoch: Instant::now(),
                lifecycle: Mutex::new(Lifecycle::default()),
                collector: Mutex::new(None),
                cpu_bits: AtomicU32::new(0),
                memory: AtomicU64::new(0),
                sampled_at_us: AtomicU64::new(0),
                has_sample: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                total_sessions: AtomicU64::new(0),
                samples_taken: AtomicU64::new(0),
                snapshot_queries: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                events_generated: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide instance, created on first use.
    ///
    /// Only top-level constructors should call this; everything below
    /// them receives the monitor explicitly.
    pub fn shared() -> Self {
        static SHARED: OnceLock<SharedMonitor> = OnceLock::new();
        SHARED
            .get_or_init(|| SharedMonitor::new(DEFAULT_SAMPLE_INTERVAL))
            .clone()
    }

    /// Sampling interval
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Take a reference; the first one starts the sampler thread
    pub fn acquire(&self) -> MonitorHandle {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        lifecycle.refs += 1;
        if lifecycle.refs == 1 {
            let (stop_tx, stop_rx) = channel::bounded::<()>(0);
            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name("pipeinfer-monitor".into())
                .spawn(move || loop {
                    inner.sample();
                    match stop_rx.recv_timeout(inner.interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                });
            match spawned {
                Ok(handle) => {
                    lifecycle.stop = Some(stop_tx);
                    lifecycle.sampler = Some(handle);
                    tracing::info!(interval = ?self.inner.interval, "performance monitor started");
                }
                // Snapshots fall back to on-demand sampling.
                Err(err) => tracing::warn!(error = %err, "failed to start monitor sampler"),
            }
        }
        MonitorHandle {
            monitor: self.clone(),
        }
    }

    fn release(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        lifecycle.refs = lifecycle.refs.saturating_sub(1);
        if lifecycle.refs == 0 {
            drop(lifecycle.stop.take());
            if let Some(handle) = lifecycle.sampler.take() {
                if handle.join().is_err() {
                    tracing::error!("monitor sampler panicked");
                }
                tracing::info!("performance monitor stopped");
            }
        }
    }

    /// Number of live handles
    pub fn ref_count(&self) -> usize {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refs
    }

    /// Whether the sampler thread is running
    pub fn is_running(&self) -> bool {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sampler
            .is_some()
    }

    /// Latest metrics, sampling only if the cache is older than the interval
    pub fn snapshot(&self) -> SystemSnapshot {
        let inner = &self.inner;
        inner.snapshot_queries.fetch_add(1, Ordering::Relaxed);
        let age = match inner.cached_age() {
            Some(age) if age < inner.interval => {
                inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                age
            }
            _ => {
                inner.sample();
                Duration::ZERO
            }
        };
        SystemSnapshot {
            cpu_percent: f32::from_bits(inner.cpu_bits.load(Ordering::Relaxed)),
            memory_bytes: inner.memory.load(Ordering::Relaxed),
            age,
        }
    }

    /// Names of operators with an open session
    pub fn active_sessions(&self) -> Vec<String> {
        let sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = sessions.values().map(|s| s.operator.to_string()).collect();
        names.sort();
        names
    }

    /// Counter snapshot
    pub fn stats(&self) -> MonitorStats {
        let inner = &self.inner;
        let active = inner.sessions.lock().unwrap_or_else(PoisonError::into_inner).len();
        MonitorStats {
            total_sessions: inner.total_sessions.load(Ordering::Relaxed),
            active_sessions: active as u64,
            samples_taken: inner.samples_taken.load(Ordering::Relaxed),
            snapshot_queries: inner.snapshot_queries.load(Ordering::Relaxed),
            cache_hits: inner.cache_hits.load(Ordering::Relaxed),
            events_generated: inner.events_generated.load(Ordering::Relaxed),
        }
    }
}

/// A live reference to a [`SharedMonitor`]; dropping it releases the reference
pub struct MonitorHandle {
    monitor: SharedMonitor,
}

impl MonitorHandle {
    /// The monitor this handle refers to
    pub fn monitor(&self) -> &SharedMonitor {
        &self.monitor
    }

    /// Open a session attributing load to `operator`
    pub fn start_session(&self, operator: impl Into<Arc<str>>) -> Session {
        let inner = &self.monitor.inner;
        let id = inner.next_session.fetch_add(1, Ordering::Relaxed);
        let operator = operator.into();
        let started = Instant::now();
        inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                SessionInfo {
                    operator: Arc::clone(&operator),
                    started,
                },
            );
        inner.total_sessions.fetch_add(1, Ordering::Relaxed);
        Session {
            id,
            operator,
            started,
            items: AtomicU64::new(0),
        }
    }

    /// Count processed items against a session
    #[inline]
    pub fn record(&self, session: &Session, items: u64) {
        session.record(items);
    }

    /// Close a session and produce its `Performance` event
    pub fn end_session(&self, session: Session) -> Event {
        let inner = &self.monitor.inner;
        let started = inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session.id)
            .map_or(session.started, |info| info.started);

        let duration = started.elapsed();
        let items = session.items.load(Ordering::Relaxed);
        let secs = duration.as_secs_f64();
        let throughput = if secs > 0.0 { items as f64 / secs } else { 0.0 };
        let snapshot = self.monitor.snapshot();
        inner.events_generated.fetch_add(1, Ordering::Relaxed);

        Event::new(
            session.operator.as_ref(),
            EventKind::Performance {
                cpu_percent: snapshot.cpu_percent,
                memory_bytes: snapshot.memory_bytes,
                throughput,
                items,
                duration,
            },
        )
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.monitor.release();
    }
}

/// Per-operator accounting opened by [`MonitorHandle::start_session`]
#[derive(Debug)]
pub struct Session {
    id: u64,
    operator: Arc<str>,
    started: Instant,
    items: AtomicU64,
}

impl Session {
    /// Count processed items; a single atomic add
    #[inline]
    pub fn record(&self, items: u64) {
        self.items.fetch_add(items, Ordering::Relaxed);
    }

    /// Items recorded so far
    pub fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }

    /// Operator the session belongs to
    pub fn operator(&self) -> &str {
        &self.operator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_counted_lifecycle() {
        let monitor = SharedMonitor::new(Duration::from_millis(10));
        assert!(!monitor.is_running());

        let first = monitor.acquire();
        let second = monitor.acquire();
        assert!(monitor.is_running());
        assert_eq!(monitor.ref_count(), 2);

        drop(first);
        assert!(monitor.is_running());
        drop(second);
        assert!(!monitor.is_running());
        assert_eq!(monitor.ref_count(), 0);

        let _again = monitor.acquire();
        assert!(monitor.is_running());
    }

    #[test]
    fn test_snapshot_is_cached() {
        let monitor = SharedMonitor::new(Duration::from_secs(60));
        let _first = monitor.snapshot();
        for _ in 0..10 {
            monitor.snapshot();
        }
        let stats = monitor.stats();
        assert_eq!(stats.snapshot_queries, 11);
        assert_eq!(stats.cache_hits, 10);
        assert_eq!(stats.samples_taken, 1);
        assert!(stats.cache_hit_rate() > 0.9);
    }

    #[test]
    fn test_session_produces_performance_event() {
        let monitor = SharedMonitor::new(Duration::from_millis(20));
        let handle = monitor.acquire();
        let session = handle.start_session("infer");
        assert_eq!(monitor.active_sessions(), vec!["infer".to_string()]);

        for _ in 0..100 {
            handle.record(&session, 1);
        }
        std::thread::sleep(Duration::from_millis(5));
        let event = handle.end_session(session);

        assert_eq!(event.operator, "infer");
        match event.kind {
            EventKind::Performance { items, throughput, duration, .. } => {
                assert_eq!(items, 100);
                assert!(throughput > 0.0);
                assert!(duration >= Duration::from_millis(5));
            }
            other => panic!("unexpected kind {other:?}"),
        }

        let stats = monitor.stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.events_generated, 1);
    }
}
