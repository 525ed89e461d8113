//! Process-wide signaling gate.
//!
//! The signaling service bans peers that create too many endpoints per
//! minute, so every endpoint creation in the process funnels through this
//! single rate-limited queue. The gate is an explicit handle passed to
//! every component — never a hidden static.
//!
//! Two priorities exist: `High` (our own persistent endpoint) preempts
//! `Normal` (elections, probes), but entries never reorder within a
//! priority. Scheduled jobs carry an is-still-active predicate so that a
//! namespace teardown cancels its queued elections without draining the
//! whole gate.
//!
//! On a reported signaling failure the gate runs a non-signaling
//! reachability probe (cached 10 s). A reachable network means we are
//! being throttled: the emission interval backs off exponentially, capped
//! at 15 s. An unreachable network pauses the queue entirely until a
//! success is reported. Throttle counts decay one per successful
//! registration and reset after 60 s without a new throttle.

use crate::transport::Reachability;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Base emission interval when not throttled.
pub const BASE_INTERVAL: Duration = Duration::from_millis(1500);

/// Hard cap on the backed-off emission interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(15);

/// How long a reachability probe result stays cached.
const PROBE_CACHE: Duration = Duration::from_secs(10);

/// Idle time after which the throttle count fully resets.
const THROTTLE_IDLE_RESET: Duration = Duration::from_secs(60);

/// Scheduling priority of a gate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Our own persistent endpoint; preempts normal entries.
    High,
    /// Everything else (elections, peer-slot claims, probes).
    Normal,
}

/// Snapshot of the gate's externally visible state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateStatus {
    /// Entries waiting in both queues.
    pub pending: usize,
    /// Current inter-emission interval in milliseconds.
    pub interval_ms: u64,
    /// Consecutive throttle count driving the backoff.
    pub throttle_count: u32,
    /// Whether the queue is paused on a dead network.
    pub network_down: bool,
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFn = Box<dyn FnOnce() -> JobFuture + Send>;
type ActiveFn = Box<dyn Fn() -> bool + Send>;

struct Entry {
    run: JobFn,
    active: ActiveFn,
}

#[derive(Default)]
struct Queues {
    high: VecDeque<Entry>,
    normal: VecDeque<Entry>,
}

struct Adaptive {
    throttle_count: u32,
    last_throttle: Option<Instant>,
    probe_cache: Option<(Instant, bool)>,
}

struct GateInner {
    queues: Mutex<Queues>,
    adaptive: Mutex<Adaptive>,
    network_down: AtomicBool,
    shutdown: AtomicBool,
    notify: Notify,
    status_tx: watch::Sender<GateStatus>,
    probe: Arc<dyn Reachability>,
}

/// Handle to the process-wide signaling gate.
#[derive(Clone)]
pub struct SignalingGate {
    inner: Arc<GateInner>,
}

impl SignalingGate {
    /// Create the gate and spawn its worker task.
    pub fn spawn(probe: Arc<dyn Reachability>) -> Self {
        let (status_tx, _) = watch::channel(GateStatus {
            pending: 0,
            interval_ms: BASE_INTERVAL.as_millis() as u64,
            throttle_count: 0,
            network_down: false,
        });
        let inner = Arc::new(GateInner {
            queues: Mutex::new(Queues::default()),
            adaptive: Mutex::new(Adaptive {
                throttle_count: 0,
                last_throttle: None,
                probe_cache: None,
            }),
            network_down: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
            status_tx,
            probe,
        });
        let gate = Self { inner };
        tokio::spawn(worker(Arc::clone(&gate.inner)));
        gate
    }

    /// Queue a job behind the gate.
    ///
    /// The job runs at most once, only while `active` still returns true
    /// at its dequeue time. Results flow through channels the closure
    /// captures; the gate itself reports nothing back.
    pub fn schedule<F, Fut>(&self, priority: Priority, active: impl Fn() -> bool + Send + 'static, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let entry = Entry {
            run: Box::new(move || Box::pin(job()) as JobFuture),
            active: Box::new(active),
        };
        {
            let mut queues = lock(&self.inner.queues);
            match priority {
                Priority::High => queues.high.push_back(entry),
                Priority::Normal => queues.normal.push_back(entry),
            }
        }
        self.publish_status();
        self.inner.notify.notify_one();
    }

    /// Report a successful endpoint registration.
    ///
    /// Clears a network-down pause and decays the throttle count by one.
    pub fn report_success(&self) {
        {
            let mut adaptive = lock(&self.inner.adaptive);
            adaptive.throttle_count = adaptive.throttle_count.saturating_sub(1);
        }
        if self.inner.network_down.swap(false, Ordering::SeqCst) {
            debug!("signaling gate resumed after network recovery");
        }
        self.publish_status();
        self.inner.notify.notify_one();
    }

    /// Report a signaling failure.
    ///
    /// Probes reachability to decide between throttle backoff and a
    /// network-down pause.
    pub async fn report_failure(&self) {
        let reachable = self.probe_cached().await;
        if reachable {
            let mut adaptive = lock(&self.inner.adaptive);
            adaptive.throttle_count = adaptive.throttle_count.saturating_add(1);
            adaptive.last_throttle = Some(Instant::now());
            warn!(
                count = adaptive.throttle_count,
                "signaling throttled, backing off"
            );
        } else {
            self.inner.network_down.store(true, Ordering::SeqCst);
            warn!("network unreachable, signaling gate paused");
        }
        self.publish_status();
    }

    /// Drop every queued entry.
    pub fn cancel_all(&self) {
        {
            let mut queues = lock(&self.inner.queues);
            queues.high.clear();
            queues.normal.clear();
        }
        self.publish_status();
    }

    /// Observe gate state changes.
    pub fn subscribe(&self) -> watch::Receiver<GateStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Current state snapshot.
    pub fn status(&self) -> GateStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Whether the gate is paused on a dead network.
    pub fn is_network_down(&self) -> bool {
        self.inner.network_down.load(Ordering::SeqCst)
    }

    /// Stop the worker task. Queued entries are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.cancel_all();
        self.inner.notify.notify_one();
    }

    async fn probe_cached(&self) -> bool {
        {
            let adaptive = lock(&self.inner.adaptive);
            if let Some((at, result)) = adaptive.probe_cache {
                if at.elapsed() < PROBE_CACHE {
                    return result;
                }
            }
        }
        let result = self.inner.probe.reachable().await;
        let mut adaptive = lock(&self.inner.adaptive);
        adaptive.probe_cache = Some((Instant::now(), result));
        result
    }

    fn publish_status(&self) {
        let pending = {
            let queues = lock(&self.inner.queues);
            queues.high.len() + queues.normal.len()
        };
        let (interval, throttle_count) = {
            let mut adaptive = lock(&self.inner.adaptive);
            decay_if_idle(&mut adaptive);
            (interval_for(adaptive.throttle_count), adaptive.throttle_count)
        };
        let status = GateStatus {
            pending,
            interval_ms: interval.as_millis() as u64,
            throttle_count,
            network_down: self.inner.network_down.load(Ordering::SeqCst),
        };
        let _ = self.inner.status_tx.send_replace(status);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Emission interval for a given throttle count.
///
/// `min(15 s, 1.5 s * 3^min(count, 4))`.
pub fn interval_for(throttle_count: u32) -> Duration {
    let factor = 3u64.pow(throttle_count.min(4));
    let backed_off = BASE_INTERVAL * factor as u32;
    backed_off.min(MAX_INTERVAL)
}

fn decay_if_idle(adaptive: &mut Adaptive) {
    if let Some(last) = adaptive.last_throttle {
        if last.elapsed() >= THROTTLE_IDLE_RESET && adaptive.throttle_count > 0 {
            adaptive.throttle_count = 0;
            adaptive.last_throttle = None;
        }
    }
}

async fn worker(inner: Arc<GateInner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if inner.network_down.load(Ordering::SeqCst) {
            inner.notify.notified().await;
            continue;
        }
        let entry = {
            let mut queues = lock(&inner.queues);
            queues.high.pop_front().or_else(|| queues.normal.pop_front())
        };
        let Some(entry) = entry else {
            inner.notify.notified().await;
            continue;
        };
        if !(entry.active)() {
            // Cancelled before its turn; no interval is burned.
            continue;
        }
        (entry.run)().await;

        let interval = {
            let mut adaptive = lock(&inner.adaptive);
            decay_if_idle(&mut adaptive);
            interval_for(adaptive.throttle_count)
        };
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FixedProbe(AtomicBool);

    #[async_trait::async_trait]
    impl Reachability for FixedProbe {
        async fn reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn probe(up: bool) -> Arc<FixedProbe> {
        Arc::new(FixedProbe(AtomicBool::new(up)))
    }

    #[test]
    fn test_interval_policy() {
        assert_eq!(interval_for(0), Duration::from_millis(1500));
        assert_eq!(interval_for(1), Duration::from_millis(4500));
        assert_eq!(interval_for(2), Duration::from_millis(13500));
        // 1.5 * 27 = 40.5 s, capped at 15 s.
        assert_eq!(interval_for(3), Duration::from_secs(15));
        assert_eq!(interval_for(4), Duration::from_secs(15));
        // Exponent saturates at 4.
        assert_eq!(interval_for(40), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_at_base_interval() {
        let gate = SignalingGate::spawn(probe(true));
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            gate.schedule(Priority::Normal, || true, move || {
                let ran = Arc::clone(&ran);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        // First job fires immediately, the rest 1.5 s apart.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        gate.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_preempts() {
        let gate = SignalingGate::spawn(probe(true));
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["n1", "n2"] {
            let order = Arc::clone(&order);
            gate.schedule(Priority::Normal, || true, move || {
                let order = Arc::clone(&order);
                async move {
                    lock(&order).push(label);
                }
            });
        }
        let order_h = Arc::clone(&order);
        gate.schedule(Priority::High, || true, move || {
            let order = Arc::clone(&order_h);
            async move {
                lock(&order).push("h1");
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        // n1 may already be dequeued when h1 arrives; h1 must run before n2.
        let seen = lock(&order).clone();
        let h = seen.iter().position(|s| *s == "h1").expect("h1 ran");
        let n2 = seen.iter().position(|s| *s == "n2").expect("n2 ran");
        assert!(h < n2, "high entry did not preempt: {seen:?}");
        gate.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_entry_skipped() {
        let gate = SignalingGate::spawn(probe(true));
        let ran = Arc::new(AtomicUsize::new(0));
        let alive = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&alive);
        let ran2 = Arc::clone(&ran);
        gate.schedule(
            Priority::Normal,
            move || flag.load(Ordering::SeqCst),
            move || {
                let ran = Arc::clone(&ran2);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        gate.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_backoff_and_idle_reset() {
        let gate = SignalingGate::spawn(probe(true));

        for _ in 0..3 {
            gate.report_failure().await;
        }
        let status = gate.status();
        assert_eq!(status.throttle_count, 3);
        assert_eq!(status.interval_ms, 15_000);
        assert!(!status.network_down);

        // 60 s with no new throttles resets to base.
        tokio::time::sleep(Duration::from_secs(61)).await;
        gate.schedule(Priority::Normal, || true, || async {});
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.status().throttle_count, 0);
        assert_eq!(gate.status().interval_ms, 1500);
        gate.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_down_pauses_until_success() {
        let gate = SignalingGate::spawn(probe(false));
        let ran = Arc::new(AtomicUsize::new(0));

        gate.report_failure().await;
        assert!(gate.status().network_down);

        let ran2 = Arc::clone(&ran);
        gate.schedule(Priority::Normal, || true, move || {
            let ran = Arc::clone(&ran2);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "gate ran while paused");

        gate.report_success();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!gate.status().network_down);
        gate.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_decays_throttle() {
        let gate = SignalingGate::spawn(probe(true));
        gate.report_failure().await;
        gate.report_failure().await;
        assert_eq!(gate.status().throttle_count, 2);

        gate.report_success();
        assert_eq!(gate.status().throttle_count, 1);
        gate.report_success();
        assert_eq!(gate.status().throttle_count, 0);
        gate.shutdown();
    }
}
