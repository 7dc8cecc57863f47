// Worker thread pools
// Named pools of OS threads that run jobs off the coordinating runtime

//! # Thread Pools
//!
//! A [`ThreadPool`] owns a set of worker threads. Each worker is a plain OS
//! thread driving its own single-threaded tokio runtime, so adapter timers and
//! retries spawned by a job keep running on that worker between jobs.
//!
//! ## Job Protocol
//!
//! Workers never share memory with the coordinator. A job is a name plus a
//! JSON payload sent over a channel; the reply comes back on a oneshot. The
//! handlers a worker can run are built by a [`WorkerSetup`] on the worker
//! thread itself, before it accepts work. The setup also declares the job
//! names up front, so an unknown job is rejected before anything is dispatched.
//!
//! ## Sizing
//!
//! - Free worker available: dispatch immediately
//! - Fewer than `min_workers`, or fewer than `max_workers` while the share of
//!   jobs that had to wait exceeds `queue_tolerance` percent: start a worker
//! - Otherwise: wait in FIFO order for the next released worker
//!
//! ## Lifecycle
//!
//! `close` stops intake, `drain` waits for in-flight jobs (with a deadline),
//! `reload` swaps every worker for a fresh one (optionally built by a new
//! setup) and `destroy` stops everything. Lifecycle changes are published on
//! the coordinator's broker as `poolOpen_*`, `poolClose_*` and `poolDrain_*`.
//!
//! ## Rust Learning Notes:
//!
//! ### Why `std::sync::Mutex` here?
//! The pool state is only touched in short synchronous sections and the lock
//! is never held across an `.await`, so the blocking mutex is both correct
//! and cheaper than `tokio::sync::Mutex`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::engine::broker::EventBroker;
use crate::engine::domain_events;
use crate::models::{Event, Job, JobResult, PublishOptions};
use crate::{PortflowError, Result};

/// Origin stamped on events forwarded from workers.
pub const WORKER_ORIGIN: &str = "worker";

/// Sizing and deadlines for one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolOptions {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_tolerance: u32,
    /// Start `min_workers` when the pool is created instead of on first use.
    pub preload: bool,
    pub drain_timeout: Duration,
    pub worker_start_timeout: Duration,
    pub worker_stop_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolConfig::default().options()
    }
}

impl PoolOptions {
    pub fn fixed(workers: usize) -> Self {
        Self {
            min_workers: workers,
            max_workers: workers,
            ..Self::default()
        }
    }
}

/// Runs one kind of job on a worker thread.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, data: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, data: Value) -> anyhow::Result<Value> {
        (self)(data).await
    }
}

/// Job name to handler map, built once per worker.
#[derive(Clone, Default)]
pub struct JobTable {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, name: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.insert(name, Arc::new(handler));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTable").field("jobs", &self.names()).finish()
    }
}

/// Sends events from a worker to the coordinator's broker.
#[derive(Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventForwarder {
    /// Queue `event` for re-publication. Returns false once the pool is gone.
    pub fn forward(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// What a worker knows about itself while it sets up.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: String,
    pub worker_id: usize,
    pub events: EventForwarder,
}

/// The worker entry point: builds the job table on the worker thread.
pub trait WorkerSetup: Send + Sync + 'static {
    /// Every job name the table built by [`WorkerSetup::setup`] will contain.
    fn job_names(&self) -> Vec<String>;

    fn setup(&self, context: &WorkerContext) -> Result<JobTable>;
}

/// A setup that hands every worker the same job table.
#[derive(Clone, Debug)]
pub struct StaticJobs(pub JobTable);

impl WorkerSetup for StaticJobs {
    fn job_names(&self) -> Vec<String> {
        self.0.names()
    }

    fn setup(&self, _context: &WorkerContext) -> Result<JobTable> {
        Ok(self.0.clone())
    }
}

type Reply = std::result::Result<Value, String>;

enum WorkerMessage {
    Run { job: Job, reply: oneshot::Sender<Reply> },
    Shutdown,
}

struct WorkerStats {
    thread: String,
    created_at: DateTime<Utc>,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_run_ms: AtomicU64,
}

enum Execution {
    Done(Value),
    Failed(String),
    Crashed,
}

struct Worker {
    id: usize,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    async fn spawn(
        pool: &str,
        id: usize,
        setup: Arc<dyn WorkerSetup>,
        events: EventForwarder,
        start_timeout: Duration,
    ) -> Result<Worker> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_name = format!("{}-worker-{}", pool.to_lowercase(), id);
        let context = WorkerContext {
            pool: pool.to_string(),
            worker_id: id,
            events,
        };

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker_main(context, setup, rx, ready_tx))
            .map_err(|e| PortflowError::WorkerStart {
                pool: pool.to_string(),
                reason: e.to_string(),
            })?;

        let start_error = |reason: String| PortflowError::WorkerStart {
            pool: pool.to_string(),
            reason,
        };
        match tokio::time::timeout(start_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => return Err(start_error(reason)),
            Ok(Err(_)) => return Err(start_error("worker exited during setup".into())),
            Err(_) => {
                let _ = tx.send(WorkerMessage::Shutdown);
                return Err(start_error(format!(
                    "not ready within {}ms",
                    start_timeout.as_millis()
                )));
            }
        }

        debug!(pool, worker = id, "Worker started");
        Ok(Worker {
            id,
            tx,
            thread: Some(thread),
            stats: Arc::new(WorkerStats {
                thread: thread_name,
                created_at: Utc::now(),
                jobs_completed: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
                total_run_ms: AtomicU64::new(0),
            }),
        })
    }

    async fn execute(&self, job: Job) -> Execution {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerMessage::Run { job, reply: reply_tx })
            .is_err()
        {
            return Execution::Crashed;
        }
        match reply_rx.await {
            Ok(Ok(value)) => Execution::Done(value),
            Ok(Err(message)) => Execution::Failed(message),
            Err(_) => Execution::Crashed,
        }
    }

    async fn stop(mut self, timeout: Duration) {
        let _ = self.tx.send(WorkerMessage::Shutdown);
        let Some(thread) = self.thread.take() else {
            return;
        };
        let joined = tokio::task::spawn_blocking(move || thread.join());
        match tokio::time::timeout(timeout, joined).await {
            Ok(Ok(Ok(()))) => debug!(worker = self.id, "Worker stopped"),
            Ok(Ok(Err(_))) => warn!(worker = self.id, "Worker thread had panicked"),
            Ok(Err(e)) => warn!(worker = self.id, error = %e, "Could not join worker thread"),
            Err(_) => warn!(
                worker = self.id,
                timeout_ms = timeout.as_millis() as u64,
                "Worker did not stop in time, detaching"
            ),
        }
    }
}

fn worker_main(
    context: WorkerContext,
    setup: Arc<dyn WorkerSetup>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(format!("could not build worker runtime: {e}")));
            return;
        }
    };

    runtime.block_on(async move {
        let jobs = match setup.setup(&context) {
            Ok(jobs) => jobs,
            Err(e) => {
                let _ = ready.send(Err(e.to_string()));
                return;
            }
        };
        let missing: Vec<String> = setup
            .job_names()
            .into_iter()
            .filter(|name| jobs.get(name).is_none())
            .collect();
        if !missing.is_empty() {
            let _ = ready.send(Err(format!("setup is missing jobs: {}", missing.join(", "))));
            return;
        }
        if ready.send(Ok(())).is_err() {
            return;
        }

        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Run { job, reply } => {
                    let outcome = match jobs.get(&job.name) {
                        Some(handler) => handler.run(job.data).await.map_err(|e| format!("{e:#}")),
                        None => Err(format!("unknown job {}", job.name)),
                    };
                    let _ = reply.send(outcome);
                }
                WorkerMessage::Shutdown => break,
            }
        }
        debug!(pool = %context.pool, worker = context.worker_id, "Worker loop finished");
    });
}

/// Per-worker metadata in a pool status report.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub thread: String,
    pub created_at: DateTime<Utc>,
    pub busy: bool,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub avg_run_ms: u64,
}

/// Pool status report.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub open: bool,
    pub min: usize,
    pub max: usize,
    pub total: usize,
    pub waiting: usize,
    pub available: usize,
    pub transactions: u64,
    pub queue_rate: u32,
    pub tolerance: u32,
    pub reloads: u32,
    pub workers: Vec<WorkerStatus>,
}

enum Handoff {
    Worker(Worker),
    /// A worker crashed; the waiter should start its own.
    Spawn,
}

enum Claim {
    Ready(Worker),
    Spawn,
    Wait(oneshot::Receiver<Handoff>),
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<Worker>,
    waiting: VecDeque<oneshot::Sender<Handoff>>,
    /// Live workers plus workers being started
    total: usize,
    closed: bool,
    jobs_requested: u64,
    jobs_queued: u64,
    transactions: u64,
    reloads: u32,
    workers: BTreeMap<usize, Arc<WorkerStats>>,
}

impl PoolState {
    fn queue_rate(&self) -> u32 {
        if self.jobs_requested == 0 {
            return 0;
        }
        (self.jobs_queued * 100 / self.jobs_requested) as u32
    }
}

struct InFlight<'a>(&'a watch::Sender<usize>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Returns its worker to the pool unless explicitly discarded.
struct Lease<'a> {
    pool: &'a ThreadPool,
    worker: Option<Worker>,
}

impl Lease<'_> {
    fn discard(mut self) -> Option<Worker> {
        self.worker.take()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}

/// A named pool of worker threads.
pub struct ThreadPool {
    name: String,
    options: PoolOptions,
    setup: RwLock<Arc<dyn WorkerSetup>>,
    job_names: RwLock<HashSet<String>>,
    state: Mutex<PoolState>,
    in_flight: watch::Sender<usize>,
    broker: Arc<EventBroker>,
    events: EventForwarder,
    next_worker_id: AtomicUsize,
    forwarder: JoinHandle<()>,
}

impl ThreadPool {
    /// Create a pool. Must be called inside a tokio runtime.
    pub async fn start(
        name: impl AsRef<str>,
        options: PoolOptions,
        setup: Arc<dyn WorkerSetup>,
        broker: Arc<EventBroker>,
    ) -> Result<Arc<ThreadPool>> {
        let name = name.as_ref().to_uppercase();
        if options.max_workers == 0 || options.min_workers > options.max_workers {
            return Err(PortflowError::InvalidInput(format!(
                "pool {name}: need 0 <= min_workers ({}) <= max_workers ({}) and max_workers >= 1",
                options.min_workers, options.max_workers
            )));
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let forward_broker = Arc::clone(&broker);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                forward_broker
                    .publish(&event.name, event.payload, PublishOptions::from_origin(WORKER_ORIGIN))
                    .await;
            }
        });

        let job_names = setup.job_names().into_iter().collect();
        let (in_flight, _) = watch::channel(0usize);
        let pool = Arc::new(ThreadPool {
            name,
            options,
            setup: RwLock::new(setup),
            job_names: RwLock::new(job_names),
            state: Mutex::new(PoolState::default()),
            in_flight,
            broker,
            events: EventForwarder { tx: events_tx },
            next_worker_id: AtomicUsize::new(1),
            forwarder,
        });

        if pool.options.preload {
            let mut started = Vec::with_capacity(pool.options.min_workers);
            for _ in 0..pool.options.min_workers {
                started.push(pool.start_worker().await?);
            }
            let mut state = pool.state();
            state.total += started.len();
            state.free.extend(started);
        }

        info!(pool = %pool.name, min = pool.options.min_workers, max = pool.options.max_workers, "Thread pool created");
        pool.publish(domain_events::pool_open(&pool.name)).await;
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn accepts_job(&self, job_name: &str) -> bool {
        self.job_names
            .read()
            .map(|names| names.contains(job_name))
            .unwrap_or(false)
    }

    /// Run `job_name` on a worker and wait for its result.
    pub async fn run(&self, job_name: &str, data: Value) -> Result<JobResult> {
        if !self.accepts_job(job_name) {
            return Err(PortflowError::UnknownJob {
                pool: self.name.clone(),
                job: job_name.to_string(),
            });
        }

        let claim = {
            let mut state = self.state();
            if state.closed {
                return Err(PortflowError::PoolClosed {
                    pool: self.name.clone(),
                });
            }
            state.jobs_requested += 1;
            self.in_flight.send_modify(|n| *n += 1);

            if let Some(worker) = state.free.pop_front() {
                Claim::Ready(worker)
            } else if self.should_grow(&state) {
                state.total += 1;
                Claim::Spawn
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiting.push_back(tx);
                state.jobs_queued += 1;
                Claim::Wait(rx)
            }
        };
        let _in_flight = InFlight(&self.in_flight);

        let worker = match claim {
            Claim::Ready(worker) => worker,
            Claim::Spawn => self.spawn_counted().await?,
            Claim::Wait(rx) => match rx.await {
                Ok(Handoff::Worker(worker)) => worker,
                Ok(Handoff::Spawn) => self.spawn_counted().await?,
                Err(_) => {
                    return Err(PortflowError::PoolClosed {
                        pool: self.name.clone(),
                    })
                }
            },
        };

        let lease = Lease {
            pool: self,
            worker: Some(worker),
        };
        let job = Job::new(job_name, data);
        let job_id = job.id;
        let (worker_id, stats) = match &lease.worker {
            Some(worker) => (worker.id, Arc::clone(&worker.stats)),
            None => return Err(PortflowError::Internal("lease without a worker".into())),
        };

        let started = Instant::now();
        let execution = match &lease.worker {
            Some(worker) => worker.execute(job).await,
            None => Execution::Crashed,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match execution {
            Execution::Done(value) => {
                stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
                stats.total_run_ms.fetch_add(duration_ms, Ordering::Relaxed);
                self.state().transactions += 1;
                debug!(pool = %self.name, worker = worker_id, job = job_name, duration_ms, "Job completed");
                Ok(JobResult {
                    job_id,
                    job: job_name.to_string(),
                    pool: self.name.clone(),
                    worker_id,
                    value,
                    duration_ms,
                })
            }
            Execution::Failed(message) => {
                stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                self.state().transactions += 1;
                warn!(pool = %self.name, worker = worker_id, job = job_name, error = %message, "Job failed");
                Err(PortflowError::JobFailed {
                    job: job_name.to_string(),
                    message,
                })
            }
            Execution::Crashed => {
                if let Some(worker) = lease.discard() {
                    self.forget(worker);
                }
                error!(pool = %self.name, worker = worker_id, job = job_name, "Worker crashed");
                Err(PortflowError::WorkerCrashed {
                    pool: self.name.clone(),
                    worker: worker_id,
                    job: job_name.to_string(),
                })
            }
        }
    }

    fn should_grow(&self, state: &PoolState) -> bool {
        state.total < self.options.min_workers.max(1)
            || (state.total < self.options.max_workers
                && state.queue_rate() > self.options.queue_tolerance)
    }

    /// Start a worker whose slot was already counted in `total`.
    async fn spawn_counted(&self) -> Result<Worker> {
        match self.start_worker().await {
            Ok(worker) => Ok(worker),
            Err(e) => {
                self.state().total -= 1;
                error!(pool = %self.name, error = %e, "Could not start worker");
                Err(e)
            }
        }
    }

    async fn start_worker(&self) -> Result<Worker> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let setup = self
            .setup
            .read()
            .map(|setup| Arc::clone(&setup))
            .map_err(|_| PortflowError::Internal("worker setup lock poisoned".into()))?;
        let worker = Worker::spawn(
            &self.name,
            id,
            setup,
            self.events.clone(),
            self.options.worker_start_timeout,
        )
        .await?;
        self.state().workers.insert(id, Arc::clone(&worker.stats));
        Ok(worker)
    }

    fn release(&self, mut worker: Worker) {
        let mut state = self.state();
        while let Some(waiter) = state.waiting.pop_front() {
            match waiter.send(Handoff::Worker(worker)) {
                Ok(()) => return,
                Err(Handoff::Worker(returned)) => worker = returned,
                Err(Handoff::Spawn) => return,
            }
        }
        state.free.push_back(worker);
    }

    /// Drop a crashed worker; a queued job gets the right to start a new one.
    fn forget(&self, worker: Worker) {
        let mut state = self.state();
        state.total = state.total.saturating_sub(1);
        state.workers.remove(&worker.id);
        drop(worker);

        if state.closed {
            return;
        }
        while let Some(waiter) = state.waiting.pop_front() {
            if waiter.send(Handoff::Spawn).is_ok() {
                state.total += 1;
                return;
            }
        }
    }

    async fn publish(&self, event_name: String) {
        let payload = json!({ "pool": self.name });
        self.broker
            .publish(&event_name, payload, PublishOptions::default())
            .await;
    }

    /// Stop accepting jobs. Jobs already queued still run.
    pub async fn close(&self) {
        self.state().closed = true;
        info!(pool = %self.name, "Thread pool closed");
        self.publish(domain_events::pool_close(&self.name)).await;
    }

    pub async fn open(&self) {
        self.state().closed = false;
        info!(pool = %self.name, "Thread pool opened");
        self.publish(domain_events::pool_open(&self.name)).await;
    }

    pub fn is_open(&self) -> bool {
        !self.state().closed
    }

    /// Wait until no job is queued or running. The pool must be closed first.
    pub async fn drain(&self) -> Result<()> {
        if !self.state().closed {
            return Err(PortflowError::PoolNotClosed {
                pool: self.name.clone(),
            });
        }
        self.publish(domain_events::pool_drain(&self.name)).await;

        let mut rx = self.in_flight.subscribe();
        let idle = async move { rx.wait_for(|n| *n == 0).await.map(|_| ()) };
        match tokio::time::timeout(self.options.drain_timeout, idle).await {
            Ok(_) => {
                debug!(pool = %self.name, "Thread pool drained");
                Ok(())
            }
            Err(_) => {
                warn!(pool = %self.name, timeout_ms = self.options.drain_timeout.as_millis() as u64, "Drain timed out");
                Err(PortflowError::DrainTimeout {
                    pool: self.name.clone(),
                    timeout_ms: self.options.drain_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Replace every worker with a fresh one, optionally built by `setup`.
    pub async fn reload(&self, setup: Option<Arc<dyn WorkerSetup>>) -> Result<()> {
        info!(pool = %self.name, "Reloading thread pool");
        self.close().await;
        if let Err(e) = self.drain().await {
            self.open().await;
            return Err(e);
        }

        if let Some(setup) = setup {
            let names: HashSet<String> = setup.job_names().into_iter().collect();
            if let Ok(mut current) = self.setup.write() {
                *current = setup;
            }
            if let Ok(mut current) = self.job_names.write() {
                *current = names;
            }
        }

        let mut fresh = Vec::with_capacity(self.options.min_workers);
        for _ in 0..self.options.min_workers {
            match self.start_worker().await {
                Ok(worker) => fresh.push(worker),
                Err(e) => {
                    self.stop_workers(fresh).await;
                    self.open().await;
                    return Err(e);
                }
            }
        }

        let retired: Vec<Worker> = {
            let mut state = self.state();
            let retired: Vec<Worker> = state.free.drain(..).collect();
            for worker in &retired {
                state.workers.remove(&worker.id);
            }
            state.total = state.total.saturating_sub(retired.len()) + fresh.len();
            state.free.extend(fresh);
            state.reloads += 1;
            retired
        };
        self.stop_workers(retired).await;

        self.open().await;
        info!(pool = %self.name, reloads = self.state().reloads, "Thread pool reloaded");
        Ok(())
    }

    /// Close, drain and stop every worker. Queued callers get `PoolClosed`.
    pub async fn destroy(&self) {
        self.close().await;
        if let Err(e) = self.drain().await {
            warn!(pool = %self.name, error = %e, "Destroying pool with jobs still running");
        }
        let workers: Vec<Worker> = {
            let mut state = self.state();
            state.waiting.clear();
            let workers: Vec<Worker> = state.free.drain(..).collect();
            state.total = state.total.saturating_sub(workers.len());
            state.workers.clear();
            workers
        };
        self.stop_workers(workers).await;
        info!(pool = %self.name, "Thread pool destroyed");
    }

    async fn stop_workers(&self, workers: Vec<Worker>) {
        let timeout = self.options.worker_stop_timeout;
        join_all(workers.into_iter().map(|worker| worker.stop(timeout))).await;
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state();
        let free: HashSet<usize> = state.free.iter().map(|w| w.id).collect();
        let workers = state
            .workers
            .iter()
            .map(|(id, stats)| {
                let completed = stats.jobs_completed.load(Ordering::Relaxed);
                let total_ms = stats.total_run_ms.load(Ordering::Relaxed);
                WorkerStatus {
                    id: *id,
                    thread: stats.thread.clone(),
                    created_at: stats.created_at,
                    busy: !free.contains(id),
                    jobs_completed: completed,
                    jobs_failed: stats.jobs_failed.load(Ordering::Relaxed),
                    avg_run_ms: if completed == 0 { 0 } else { total_ms / completed },
                }
            })
            .collect();

        PoolStatus {
            name: self.name.clone(),
            open: !state.closed,
            min: self.options.min_workers,
            max: self.options.max_workers,
            total: state.total,
            waiting: state.waiting.len(),
            available: state.free.len(),
            transactions: state.transactions,
            queue_rate: state.queue_rate(),
            tolerance: self.options.queue_tolerance,
            reloads: state.reloads,
            workers,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

struct RegisteredGroup {
    setup: Arc<dyn WorkerSetup>,
    options: Option<PoolOptions>,
}

/// All pools of one coordinator, keyed by upper-cased model group.
pub struct ThreadPoolRegistry {
    pools: DashMap<String, Arc<ThreadPool>>,
    groups: DashMap<String, RegisteredGroup>,
    broker: Arc<EventBroker>,
    defaults: PoolOptions,
    creating: tokio::sync::Mutex<()>,
}

impl ThreadPoolRegistry {
    pub fn new(broker: Arc<EventBroker>, defaults: PoolOptions) -> Self {
        Self {
            pools: DashMap::new(),
            groups: DashMap::new(),
            broker,
            defaults,
            creating: tokio::sync::Mutex::new(()),
        }
    }

    /// Declare how workers for `group` are built. Pools start on first use.
    pub fn register(&self, group: &str, setup: Arc<dyn WorkerSetup>, options: Option<PoolOptions>) {
        self.groups
            .insert(group.to_uppercase(), RegisteredGroup { setup, options });
    }

    /// The pool for `group`, created on first call. `options` only apply then.
    pub async fn get_thread_pool(
        &self,
        group: &str,
        options: Option<PoolOptions>,
    ) -> Result<Arc<ThreadPool>> {
        let key = group.to_uppercase();
        if let Some(pool) = self.pools.get(&key) {
            return Ok(Arc::clone(pool.value()));
        }

        let _creating = self.creating.lock().await;
        if let Some(pool) = self.pools.get(&key) {
            return Ok(Arc::clone(pool.value()));
        }

        let (setup, registered_options) = match self.groups.get(&key) {
            Some(group) => (Arc::clone(&group.setup), group.options.clone()),
            None => return Err(PortflowError::PoolNotFound(key)),
        };
        let options = options
            .or(registered_options)
            .unwrap_or_else(|| self.defaults.clone());

        let pool = ThreadPool::start(&key, options, setup, Arc::clone(&self.broker)).await?;
        self.pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    fn existing(&self, name: &str) -> Result<Arc<ThreadPool>> {
        let key = name.to_uppercase();
        self.pools
            .get(&key)
            .map(|pool| Arc::clone(pool.value()))
            .ok_or(PortflowError::PoolNotFound(key))
    }

    pub fn list_pools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        let mut status: Vec<PoolStatus> = self.pools.iter().map(|p| p.status()).collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Reload one pool; a new `setup` also replaces the registered one.
    pub async fn reload(&self, name: &str, setup: Option<Arc<dyn WorkerSetup>>) -> Result<()> {
        let pool = self.existing(name)?;
        if let Some(setup) = &setup {
            if let Some(mut group) = self.groups.get_mut(&name.to_uppercase()) {
                group.setup = Arc::clone(setup);
            }
        }
        pool.reload(setup).await
    }

    /// Reload every pool, one after another. Stops at the first failure.
    pub async fn reload_all(&self) -> Result<()> {
        for name in self.list_pools() {
            self.reload(&name, None).await?;
        }
        Ok(())
    }

    pub async fn destroy(&self, name: &str) -> Result<()> {
        let key = name.to_uppercase();
        let (_, pool) = self
            .pools
            .remove(&key)
            .ok_or_else(|| PortflowError::PoolNotFound(key.clone()))?;
        pool.destroy().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        for name in self.list_pools() {
            if let Err(e) = self.destroy(&name).await {
                warn!(pool = %name, error = %e, "Could not destroy pool during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscribeOptions;
    use tokio_test::{assert_err, assert_ok};

    fn options(min: usize, max: usize) -> PoolOptions {
        PoolOptions {
            min_workers: min,
            max_workers: max,
            queue_tolerance: 25,
            preload: false,
            drain_timeout: Duration::from_secs(5),
            worker_start_timeout: Duration::from_secs(5),
            worker_stop_timeout: Duration::from_secs(5),
        }
    }

    fn math_jobs() -> Arc<dyn WorkerSetup> {
        let table = JobTable::new()
            .with_job("double", |data: Value| async move {
                let n = data.as_i64().unwrap_or_default();
                anyhow::Ok(json!(n * 2))
            })
            .with_job("fail", |_data: Value| async move {
                Err::<Value, _>(anyhow::anyhow!("no luck"))
            })
            .with_job("crash", |data: Value| async move {
                if data.is_null() {
                    panic!("worker blew up");
                }
                anyhow::Ok(data)
            })
            .with_job("sleep", |data: Value| async move {
                let ms = data.as_u64().unwrap_or(50);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                anyhow::Ok(json!(ms))
            });
        Arc::new(StaticJobs(table))
    }

    async fn pool(min: usize, max: usize) -> Arc<ThreadPool> {
        ThreadPool::start("math", options(min, max), math_jobs(), Arc::new(EventBroker::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn runs_jobs_on_worker_threads() {
        let pool = pool(1, 2).await;
        let result = assert_ok!(pool.run("double", json!(21)).await);
        assert_eq!(result.value, json!(42));
        assert_eq!(result.pool, "MATH");

        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.available, 1);
        assert_eq!(status.transactions, 1);
        assert_eq!(status.workers[0].jobs_completed, 1);
        assert!(status.workers[0].thread.starts_with("math-worker-"));
        pool.destroy().await;
    }

    #[tokio::test]
    async fn unknown_jobs_are_rejected_before_dispatch() {
        let pool = pool(1, 1).await;
        let err = assert_err!(pool.run("triple", json!(1)).await);
        assert!(matches!(err, PortflowError::UnknownJob { .. }));
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn never_runs_more_jobs_than_workers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let table = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            JobTable::new().with_job("work", move |_data: Value| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    anyhow::Ok(Value::Null)
                }
            })
        };
        let pool = ThreadPool::start(
            "bounded",
            options(1, 2),
            Arc::new(StaticJobs(table)),
            Arc::new(EventBroker::new()),
        )
        .await
        .unwrap();

        let jobs = (0..8).map(|_| pool.run("work", Value::Null));
        for result in join_all(jobs).await {
            assert_ok!(result);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(pool.status().total <= 2);
        assert_eq!(pool.status().transactions, 8);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn single_worker_pools_run_jobs_one_at_a_time() {
        let pool = pool(1, 1).await;
        let (first, second) = tokio::join!(pool.run("sleep", json!(40)), pool.run("sleep", json!(40)));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.worker_id, second.worker_id);
        assert!(pool.status().queue_rate > 0);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn queued_jobs_start_in_submission_order() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let table = {
            let started = Arc::clone(&started);
            JobTable::new()
                .with_job("hold", |_data: Value| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    anyhow::Ok(Value::Null)
                })
                .with_job("record", move |data: Value| {
                    let started = Arc::clone(&started);
                    async move {
                        started.lock().unwrap().push(data.as_u64().unwrap_or_default());
                        anyhow::Ok(data)
                    }
                })
        };
        let pool = ThreadPool::start(
            "fifo",
            options(1, 1),
            Arc::new(StaticJobs(table)),
            Arc::new(EventBroker::new()),
        )
        .await
        .unwrap();

        let busy = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run("hold", Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.status().available, 0);

        let queued = (0..5u64).map(|n| pool.run("record", json!(n)));
        for result in join_all(queued).await {
            assert_ok!(result);
        }
        assert_ok!(busy.await.unwrap());

        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn failed_jobs_keep_the_worker() {
        let pool = pool(1, 1).await;
        let err = assert_err!(pool.run("fail", Value::Null).await);
        assert!(matches!(err, PortflowError::JobFailed { ref message, .. } if message.contains("no luck")));
        assert_ok!(pool.run("double", json!(1)).await);
        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.workers[0].jobs_failed, 1);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn crashed_workers_are_replaced_on_next_use() {
        let pool = pool(1, 1).await;
        let err = assert_err!(pool.run("crash", Value::Null).await);
        assert!(matches!(err, PortflowError::WorkerCrashed { .. }));
        assert_eq!(pool.status().total, 0);

        let result = assert_ok!(pool.run("crash", json!("fine")).await);
        assert_eq!(result.value, json!("fine"));
        assert_eq!(pool.status().total, 1);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn closed_pools_refuse_work_until_reopened() {
        let pool = pool(1, 1).await;
        pool.close().await;
        let err = assert_err!(pool.run("double", json!(1)).await);
        assert!(matches!(err, PortflowError::PoolClosed { .. }));
        pool.open().await;
        assert_ok!(pool.run("double", json!(1)).await);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn drain_requires_a_closed_pool_and_honours_its_deadline() {
        let mut opts = options(1, 1);
        opts.drain_timeout = Duration::from_millis(50);
        let pool = ThreadPool::start("slow", opts, math_jobs(), Arc::new(EventBroker::new()))
            .await
            .unwrap();

        assert!(matches!(pool.drain().await, Err(PortflowError::PoolNotClosed { .. })));

        let running = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run("sleep", json!(400)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.close().await;
        assert!(matches!(pool.drain().await, Err(PortflowError::DrainTimeout { .. })));

        assert_ok!(running.await.unwrap());
        assert_ok!(pool.drain().await);
    }

    #[tokio::test]
    async fn reload_swaps_workers_and_publishes_lifecycle_events() {
        let broker = Arc::new(EventBroker::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            broker.subscribe(
                regex::Regex::new("^pool").unwrap(),
                move |event: Event| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(event.name);
                        anyhow::Ok(())
                    }
                },
                SubscribeOptions::default(),
            );
        }

        let mut opts = options(1, 1);
        opts.preload = true;
        let pool = ThreadPool::start("reloadable", opts, math_jobs(), Arc::clone(&broker))
            .await
            .unwrap();
        let before: Vec<usize> = pool.status().workers.iter().map(|w| w.id).collect();
        assert_eq!(before.len(), 1);

        assert_ok!(pool.reload(None).await);
        let status = pool.status();
        assert_eq!(status.reloads, 1);
        assert_eq!(status.total, 1);
        assert!(status.open);
        assert_ne!(status.workers[0].id, before[0]);
        assert_ok!(pool.run("double", json!(2)).await);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "poolOpen_RELOADABLE",
                "poolClose_RELOADABLE",
                "poolDrain_RELOADABLE",
                "poolOpen_RELOADABLE"
            ]
        );
        pool.destroy().await;
    }

    #[tokio::test]
    async fn reload_can_install_new_jobs() {
        let pool = pool(1, 1).await;
        assert!(!pool.accepts_job("greet"));

        let greet = JobTable::new().with_job("greet", |data: Value| async move {
            anyhow::Ok(json!(format!("hello {}", data.as_str().unwrap_or("?"))))
        });
        assert_ok!(pool.reload(Some(Arc::new(StaticJobs(greet)))).await);

        let result = assert_ok!(pool.run("greet", json!("ops")).await);
        assert_eq!(result.value, json!("hello ops"));
        assert!(!pool.accepts_job("double"));
        pool.destroy().await;
    }

    struct Forwarding;

    impl WorkerSetup for Forwarding {
        fn job_names(&self) -> Vec<String> {
            vec!["announce".into()]
        }

        fn setup(&self, context: &WorkerContext) -> Result<JobTable> {
            let events = context.events.clone();
            Ok(JobTable::new().with_job("announce", move |data: Value| {
                let events = events.clone();
                async move {
                    let sent = events.forward(Event::new("announced", data, &PublishOptions::default()));
                    anyhow::Ok(json!(sent))
                }
            }))
        }
    }

    #[tokio::test]
    async fn worker_events_reach_the_coordinator_broker() {
        let broker = Arc::new(EventBroker::new());
        let origins = Arc::new(Mutex::new(Vec::new()));
        {
            let origins = Arc::clone(&origins);
            broker.subscribe(
                "announced",
                move |event: Event| {
                    let origins = Arc::clone(&origins);
                    async move {
                        origins.lock().unwrap().push(event.origin);
                        anyhow::Ok(())
                    }
                },
                SubscribeOptions::default().from_origin(WORKER_ORIGIN),
            );
        }

        let pool = ThreadPool::start("forward", options(1, 1), Arc::new(Forwarding), Arc::clone(&broker))
            .await
            .unwrap();
        let result = assert_ok!(pool.run("announce", json!({"id": 7})).await);
        assert_eq!(result.value, json!(true));

        for _ in 0..50 {
            if !origins.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(origins.lock().unwrap().clone(), vec![Some(WORKER_ORIGIN.to_string())]);
        pool.destroy().await;
    }

    struct Broken;

    impl WorkerSetup for Broken {
        fn job_names(&self) -> Vec<String> {
            vec!["anything".into()]
        }

        fn setup(&self, _context: &WorkerContext) -> Result<JobTable> {
            Ok(JobTable::new())
        }
    }

    #[tokio::test]
    async fn incomplete_setups_fail_to_start() {
        let pool = ThreadPool::start("broken", options(1, 1), Arc::new(Broken), Arc::new(EventBroker::new()))
            .await
            .unwrap();
        let err = assert_err!(pool.run("anything", Value::Null).await);
        assert!(matches!(err, PortflowError::WorkerStart { ref reason, .. } if reason.contains("anything")));
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn registry_creates_pools_once_per_group() {
        let registry = ThreadPoolRegistry::new(Arc::new(EventBroker::new()), options(1, 1));
        assert!(matches!(
            registry.get_thread_pool("orders", None).await,
            Err(PortflowError::PoolNotFound(_))
        ));

        registry.register("orders", math_jobs(), None);
        let first = assert_ok!(registry.get_thread_pool("orders", None).await);
        let second = assert_ok!(registry.get_thread_pool("ORDERS", Some(options(2, 2))).await);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.options().max_workers, 1);
        assert_eq!(registry.list_pools(), vec!["ORDERS".to_string()]);

        assert_ok!(first.run("double", json!(3)).await);
        assert_ok!(registry.reload_all().await);
        assert_eq!(registry.status()[0].reloads, 1);

        assert_ok!(registry.destroy("orders").await);
        assert!(registry.list_pools().is_empty());
        assert!(matches!(
            registry.destroy("orders").await,
            Err(PortflowError::PoolNotFound(_))
        ));
    }
}
