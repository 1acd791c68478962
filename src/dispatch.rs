//! Render dispatcher: the single point of contact with the renderer.
//!
//! Every renderer call (interactive conversion, image export, batch file)
//! goes through one [`RenderDispatcher`]. It keeps a priority queue ordered
//! by `(plan tier, arrival)` and one worker task that admits the best pending
//! item whenever a renderer slot frees up, so:
//!
//! * global throughput stays under the renderer's concurrency ceiling
//!   (`max_in_flight`) and call rate (`min_call_interval_ms`);
//! * higher tiers never wait behind a lower-tier backlog;
//! * within a tier, arrival order is preserved, and the queue drains
//!   continuously, so no tier starves.
//!
//! ```text
//!  enqueue() ──push──▶ ┌──────────────┐  permit + pacing  ┌──────────┐
//!  enqueue() ──push──▶ │ AdmissionQ   │ ──────pop───────▶ │ renderer │
//!  enqueue() ──push──▶ │ (tier, seq)  │                   └────┬─────┘
//!        ▲             └──────────────┘                        │
//!        └────────────────── oneshot reply ◀───────────────────┘
//! ```
//!
//! The dispatcher does not retry. A retried item would have to re-acquire
//! its place in line, which is a policy decision for the caller; see
//! [`Zpl2PdfError::is_retriable`].

use crate::config::{LabelSize, ServiceConfig};
use crate::error::{RenderError, Zpl2PdfError};
use crate::pipeline::parse::count_label_markers;
use crate::renderer::{RenderRequest, Renderer};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

// ── Plan tiers ───────────────────────────────────────────────────────────

/// User plan tier, used only for queue ordering.
///
/// The derived `Ord` is the priority order: `Free < Pro < Enterprise`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    /// Numeric priority; larger is served first.
    pub fn priority_rank(self) -> u8 {
        match self {
            PlanTier::Free => 0,
            PlanTier::Pro => 1,
            PlanTier::Enterprise => 2,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanTier::Free => write!(f, "free"),
            PlanTier::Pro => write!(f, "pro"),
            PlanTier::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl FromStr for PlanTier {
    type Err = Zpl2PdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "pro" => Ok(PlanTier::Pro),
            "enterprise" => Ok(PlanTier::Enterprise),
            other => Err(Zpl2PdfError::InvalidConfig(format!(
                "Unknown plan tier '{other}' (expected free, pro or enterprise)"
            ))),
        }
    }
}

// ── Queue items ──────────────────────────────────────────────────────────

/// A render request as submitted to the dispatcher.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub job_id: String,
    pub user_id: String,
    pub tier: PlanTier,
    /// Concatenated `^XA…^XZ` blocks of one chunk.
    pub zpl: String,
    pub label_size: LabelSize,
    pub label_count: usize,
}

type Reply = oneshot::Sender<Result<Vec<u8>, RenderError>>;

/// A queued job with its ordering key and reply channel.
struct Pending {
    rank: u8,
    seq: u64,
    job: RenderJob,
    reply: Reply,
}

impl Pending {
    fn key(&self) -> (u8, Reverse<u64>) {
        (self.rank, Reverse(self.seq))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Pending items ordered by `(tier rank desc, arrival asc)`.
#[derive(Default)]
struct AdmissionQueue {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
    closed: bool,
}

impl AdmissionQueue {
    fn push(&mut self, job: RenderJob, reply: Reply) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Pending {
            rank: job.tier.priority_rank(),
            seq,
            job,
            reply,
        });
        seq
    }

    fn pop(&mut self) -> Option<Pending> {
        self.heap.pop()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    /// 1-based rank of the job's best pending item.
    fn position(&self, job_id: &str) -> Option<usize> {
        let best = self
            .heap
            .iter()
            .filter(|p| p.job.job_id == job_id)
            .map(Pending::key)
            .max()?;
        Some(self.heap.iter().filter(|p| p.key() > best).count() + 1)
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────

struct Shared {
    queue: Mutex<AdmissionQueue>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AdmissionQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Closes the queue once the last dispatcher clone is dropped.
struct DispatcherHandle {
    shared: Arc<Shared>,
    label_cap: usize,
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

/// Cloneable handle to the process-wide render queue.
///
/// Must be created inside a Tokio runtime: construction spawns the worker.
#[derive(Clone)]
pub struct RenderDispatcher {
    handle: Arc<DispatcherHandle>,
}

impl fmt::Debug for RenderDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderDispatcher")
            .field("label_cap", &self.handle.label_cap)
            .field("pending", &self.pending())
            .finish()
    }
}

impl RenderDispatcher {
    /// Start a dispatcher in front of `renderer`.
    pub fn new(renderer: Arc<dyn Renderer>, config: &ServiceConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(AdmissionQueue::default()),
            notify: Notify::new(),
        });

        tokio::spawn(run_worker(
            Arc::clone(&shared),
            renderer,
            Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            Duration::from_millis(config.min_call_interval_ms),
        ));

        Self {
            handle: Arc::new(DispatcherHandle {
                shared,
                label_cap: config.label_cap,
            }),
        }
    }

    /// Queue a render job and wait for its PDF.
    ///
    /// # Errors
    /// * [`Zpl2PdfError::LabelCapExceeded`] — the payload holds more labels
    ///   than the renderer cap; nothing is sent.
    /// * [`Zpl2PdfError::PayloadTooLarge`] — the renderer refused the size.
    /// * [`Zpl2PdfError::RendererUnavailable`] — any transient failure.
    /// * [`Zpl2PdfError::DispatcherClosed`] — the worker is gone.
    pub async fn enqueue(&self, job: RenderJob) -> Result<Vec<u8>, Zpl2PdfError> {
        let cap = self.handle.label_cap;
        let found = count_label_markers(&job.zpl);
        if found > cap {
            error!(
                job_id = %job.job_id,
                label_size = %job.label_size,
                found,
                cap,
                "Chunk exceeds renderer label cap; refusing to dispatch"
            );
            return Err(Zpl2PdfError::LabelCapExceeded {
                job_id: job.job_id,
                found,
                cap,
            });
        }

        let job_id = job.job_id.clone();
        let label_size = job.label_size;
        let label_count = job.label_count;
        let (tx, rx) = oneshot::channel();

        {
            let mut queue = self.handle.shared.lock();
            if queue.closed {
                return Err(Zpl2PdfError::DispatcherClosed { job_id });
            }
            let seq = queue.push(job, tx);
            debug!(
                job_id = %job_id,
                seq,
                pending = queue.len(),
                "Render job queued"
            );
        }
        self.handle.shared.notify.notify_one();

        match rx.await {
            Ok(Ok(pdf)) => Ok(pdf),
            Ok(Err(RenderError::PayloadTooLarge)) => {
                error!(
                    job_id = %job_id,
                    label_size = %label_size,
                    label_count,
                    status = 413,
                    "Renderer rejected chunk as too large"
                );
                Err(Zpl2PdfError::PayloadTooLarge {
                    job_id,
                    label_count,
                })
            }
            Ok(Err(RenderError::Transient { status, detail })) => {
                warn!(
                    job_id = %job_id,
                    label_size = %label_size,
                    label_count,
                    status = ?status,
                    "Renderer call failed: {}",
                    detail
                );
                Err(Zpl2PdfError::RendererUnavailable { status, detail })
            }
            Err(_) => Err(Zpl2PdfError::DispatcherClosed { job_id }),
        }
    }

    /// Current 1-based queue rank of `job_id`, or `None` if nothing of that
    /// job is waiting (not queued, already admitted, or finished).
    pub fn queue_position(&self, job_id: &str) -> Option<usize> {
        self.handle.shared.lock().position(job_id)
    }

    /// Number of items waiting for admission.
    pub fn pending(&self) -> usize {
        self.handle.shared.lock().len()
    }
}

/// What the worker does next once it holds a slot.
enum Admission {
    Pop(Option<Pending>),
    Sleep(Instant),
    Wait,
}

/// Admission loop: wait for a free slot, respect pacing, then take the best
/// pending item. Deciding only once a slot is free is what makes admission
/// strictly priority-ordered.
async fn run_worker(
    shared: Arc<Shared>,
    renderer: Arc<dyn Renderer>,
    slots: Arc<Semaphore>,
    min_interval: Duration,
) {
    let mut last_start: Option<Instant> = None;

    loop {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            return;
        };

        let next = loop {
            // The guard must not live across an await point.
            let step = {
                let mut queue = shared.lock();
                match last_start {
                    // Pace before popping so late high-tier arrivals still win.
                    Some(at) if !queue.heap.is_empty() && at.elapsed() < min_interval => {
                        Admission::Sleep(at + min_interval)
                    }
                    _ if !queue.heap.is_empty() => Admission::Pop(queue.pop()),
                    _ if queue.closed => Admission::Pop(None),
                    _ => Admission::Wait,
                }
            };
            match step {
                Admission::Pop(next) => break next,
                Admission::Sleep(until) => tokio::time::sleep_until(until).await,
                Admission::Wait => shared.notify.notified().await,
            }
        };

        let Some(pending) = next else {
            debug!("Render dispatcher closed; worker exiting");
            return;
        };

        last_start = Some(Instant::now());
        let renderer = Arc::clone(&renderer);
        tokio::spawn(async move {
            let Pending { job, reply, seq, .. } = pending;
            debug!(
                job_id = %job.job_id,
                user_id = %job.user_id,
                tier = %job.tier,
                seq,
                labels = job.label_count,
                "Render job admitted"
            );
            let request = RenderRequest {
                zpl: job.zpl,
                label_size: job.label_size,
                label_count: job.label_count,
            };
            let result = renderer.render(&request).await;
            // The caller may have stopped waiting; the result is simply dropped.
            let _ = reply.send(result);
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn job(id: &str, tier: PlanTier) -> RenderJob {
        RenderJob {
            job_id: id.to_string(),
            user_id: format!("user-{id}"),
            tier,
            zpl: format!("^XA^FD{id}^FS^XZ"),
            label_size: LabelSize::default(),
            label_count: 1,
        }
    }

    fn drain_order(queue: &mut AdmissionQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop().map(|p| p.job.job_id)).collect()
    }

    #[test]
    fn tier_order_is_total() {
        assert!(PlanTier::Enterprise > PlanTier::Pro);
        assert!(PlanTier::Pro > PlanTier::Free);
        assert_eq!("Enterprise".parse::<PlanTier>().unwrap(), PlanTier::Enterprise);
        assert!("gold".parse::<PlanTier>().is_err());
    }

    #[test]
    fn fifo_within_same_tier() {
        let mut q = AdmissionQueue::default();
        for id in ["a", "b", "c"] {
            q.push(job(id, PlanTier::Pro), oneshot::channel().0);
        }
        assert_eq!(drain_order(&mut q), vec!["a", "b", "c"]);
    }

    #[test]
    fn higher_tier_admitted_first_regardless_of_arrival() {
        let mut q = AdmissionQueue::default();
        q.push(job("free-1", PlanTier::Free), oneshot::channel().0);
        q.push(job("pro-1", PlanTier::Pro), oneshot::channel().0);
        q.push(job("free-2", PlanTier::Free), oneshot::channel().0);
        q.push(job("ent-1", PlanTier::Enterprise), oneshot::channel().0);
        q.push(job("pro-2", PlanTier::Pro), oneshot::channel().0);
        assert_eq!(
            drain_order(&mut q),
            vec!["ent-1", "pro-1", "pro-2", "free-1", "free-2"]
        );
    }

    #[test]
    fn position_reports_rank_without_mutating() {
        let mut q = AdmissionQueue::default();
        q.push(job("free", PlanTier::Free), oneshot::channel().0);
        q.push(job("pro", PlanTier::Pro), oneshot::channel().0);
        q.push(job("free", PlanTier::Free), oneshot::channel().0);
        q.push(job("ent", PlanTier::Enterprise), oneshot::channel().0);

        assert_eq!(q.position("ent"), Some(1));
        assert_eq!(q.position("pro"), Some(2));
        assert_eq!(q.position("free"), Some(3));
        assert_eq!(q.position("missing"), None);
        assert_eq!(q.len(), 4);
    }

    /// Records call order; blocks every call until the gate is opened.
    struct GatedRenderer {
        calls: Mutex<Vec<String>>,
        gate: Semaphore,
    }

    #[async_trait]
    impl Renderer for GatedRenderer {
        async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
            self.calls.lock().unwrap().push(request.zpl.clone());
            let _permit = self.gate.acquire().await.unwrap();
            Ok(request.zpl.as_bytes().to_vec())
        }
    }

    fn test_config(max_in_flight: usize) -> ServiceConfig {
        ServiceConfig::builder()
            .max_in_flight(max_in_flight)
            .min_call_interval_ms(0)
            .build()
            .unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn admission_follows_priority_then_arrival() {
        let renderer = Arc::new(GatedRenderer {
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        });
        let dispatcher = RenderDispatcher::new(renderer.clone(), &test_config(1));

        // Occupy the only slot.
        let d = dispatcher.clone();
        let first = tokio::spawn(async move { d.enqueue(job("A", PlanTier::Free)).await });
        wait_until(|| renderer.calls.lock().unwrap().len() == 1).await;

        let mut handles = Vec::new();
        for (id, tier) in [
            ("B", PlanTier::Free),
            ("C", PlanTier::Enterprise),
            ("D", PlanTier::Pro),
        ] {
            let d = dispatcher.clone();
            handles.push(tokio::spawn(async move { d.enqueue(job(id, tier)).await }));
            let expected = handles.len();
            wait_until(|| dispatcher.pending() == expected).await;
        }

        assert_eq!(dispatcher.queue_position("C"), Some(1));
        assert_eq!(dispatcher.queue_position("D"), Some(2));
        assert_eq!(dispatcher.queue_position("B"), Some(3));
        assert_eq!(dispatcher.queue_position("A"), None, "A is in flight");

        renderer.gate.add_permits(16);
        first.await.unwrap().unwrap();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let calls = renderer.calls.lock().unwrap().clone();
        let order: Vec<&str> = calls
            .iter()
            .map(|z| &z[z.find("^FD").unwrap() + 3..z.find("^FS").unwrap()])
            .collect();
        assert_eq!(order, vec!["A", "C", "D", "B"]);
    }

    #[tokio::test]
    async fn over_cap_payload_never_reaches_renderer() {
        let renderer = Arc::new(GatedRenderer {
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(16),
        });
        let config = ServiceConfig::builder()
            .label_cap(2)
            .min_call_interval_ms(0)
            .build()
            .unwrap();
        let dispatcher = RenderDispatcher::new(renderer.clone(), &config);

        let mut over = job("big", PlanTier::Pro);
        over.zpl = "^XA^FD1^FS^XZ^XA^FD2^FS^XZ^XA^FD3^FS^XZ".into();
        over.label_count = 2; // caller miscounted; the payload is what counts

        let err = dispatcher.enqueue(over).await.unwrap_err();
        assert!(matches!(
            err,
            Zpl2PdfError::LabelCapExceeded { found: 3, cap: 2, .. }
        ));
        assert!(renderer.calls.lock().unwrap().is_empty());
    }

    struct FailingRenderer(RenderError);

    #[async_trait]
    impl Renderer for FailingRenderer {
        async fn render(&self, _request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
            Err(self.0.clone())
        }
    }

    #[tokio::test]
    async fn payload_too_large_is_distinct_and_not_retriable() {
        let dispatcher = RenderDispatcher::new(
            Arc::new(FailingRenderer(RenderError::PayloadTooLarge)),
            &test_config(1),
        );
        let err = dispatcher.enqueue(job("x", PlanTier::Free)).await.unwrap_err();
        assert!(matches!(err, Zpl2PdfError::PayloadTooLarge { .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn transient_failure_is_surfaced_once() {
        let renderer = Arc::new(FailingRenderer(RenderError::Transient {
            status: Some(503),
            detail: "upstream down".into(),
        }));
        let dispatcher = RenderDispatcher::new(renderer, &test_config(1));
        let err = dispatcher.enqueue(job("x", PlanTier::Free)).await.unwrap_err();
        match err {
            Zpl2PdfError::RendererUnavailable { status, detail } => {
                assert_eq!(status, Some(503));
                assert_eq!(detail, "upstream down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Tracks the highest number of simultaneous calls.
    struct ConcurrencyGauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Renderer for ConcurrencyGauge {
        async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
            let now = self.current.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(now, AtomicOrdering::SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            self.current.fetch_sub(1, AtomicOrdering::SeqCst);
            Ok(request.zpl.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn in_flight_calls_never_exceed_ceiling() {
        let gauge = Arc::new(ConcurrencyGauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let dispatcher = RenderDispatcher::new(gauge.clone(), &test_config(2));

        let jobs: Vec<_> = (0..8)
            .map(|i| {
                let d = dispatcher.clone();
                tokio::spawn(async move { d.enqueue(job(&format!("j{i}"), PlanTier::Pro)).await })
            })
            .collect();
        for j in jobs {
            j.await.unwrap().unwrap();
        }

        let peak = gauge.peak.load(AtomicOrdering::SeqCst);
        assert!(peak <= 2, "peak concurrency {peak} exceeded ceiling");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn pacing_spaces_out_call_starts() {
        let gauge = Arc::new(ConcurrencyGauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let config = ServiceConfig::builder()
            .max_in_flight(4)
            .min_call_interval_ms(40)
            .build()
            .unwrap();
        let dispatcher = RenderDispatcher::new(gauge, &config);

        let started = Instant::now();
        let jobs: Vec<_> = (0..3)
            .map(|i| {
                let d = dispatcher.clone();
                tokio::spawn(async move { d.enqueue(job(&format!("p{i}"), PlanTier::Free)).await })
            })
            .collect();
        for j in jobs {
            j.await.unwrap().unwrap();
        }
        // Three starts need at least two full intervals between them.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn worker_future_can_be_spawned() {
        let shared = Arc::new(Shared {
            queue: Mutex::new(AdmissionQueue::default()),
            notify: Notify::new(),
        });
        let renderer: Arc<dyn Renderer> = Arc::new(FailingRenderer(RenderError::PayloadTooLarge));
        let worker = run_worker(
            Arc::clone(&shared),
            renderer,
            Arc::new(Semaphore::new(1)),
            Duration::from_millis(5),
        );
        assert_send(&worker);

        shared.lock().closed = true;
        shared.notify.notify_one();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker exits once the queue is closed and empty");
    }
}
