//! Request dispatcher.
//!
//! # Responsibilities
//! - Accept tasks and assign each to the best-scoring worker
//! - Grow the worker set from the pool when supply is thin
//! - Retry failed tasks, evict surplus idle workers, recycle dead ones
//!
//! # Design Decisions
//! - A single ingestion queue drained by one loop; selection and the
//!   worker's outstanding increment happen back to back in that loop
//! - Waiting for a worker uses the registry notification, enabled before
//!   the registry is scanned, so a new worker cannot be missed
//! - Growth is signalled, never polled

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{DispatcherConfig, FrontConfig, WorkerConfig};
use crate::dispatch::policy::{DefaultPolicy, ResponsePolicy};
use crate::dispatch::queue::TaskQueue;
use crate::dispatch::registry::WorkerRegistry;
use crate::dispatch::task::{HttpResponse, PendingGuard, Task, TaskHandle, TaskRequest};
use crate::error::{DispatchError, WorkerError};
use crate::health::{IpQualityTracker, IpSnapshot};
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionId, PooledConnection, Protocol};
use crate::observability::metrics;
use crate::pool::{ConnectionPool, PoolStatus};
use crate::worker::{
    request, Http1Worker, Http2Worker, Worker, WorkerContext, WorkerEvent, WorkerStatus,
};

/// Serializable dispatcher snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub running: bool,
    pub http1_workers: usize,
    pub http2_workers: usize,
    pub creating: usize,
    pub pending_tasks: usize,
    pub workers: Vec<WorkerStatus>,
    pub pool: PoolStatus,
    pub ips: Vec<IpSnapshot>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    worker_config: WorkerConfig,
    pool: Arc<ConnectionPool>,
    tracker: Arc<IpQualityTracker>,
    registry: WorkerRegistry,
    queue: TaskQueue,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    policy: Arc<dyn ResponsePolicy>,
    grow: Notify,
    creating: AtomicUsize,
    pending: Arc<AtomicUsize>,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(config: &FrontConfig, pool: Arc<ConnectionPool>, shutdown: Shutdown) -> Self {
        let (queue, queue_rx) = TaskQueue::new(config.dispatcher.max_retries, shutdown.subscribe());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config: config.dispatcher.clone(),
            worker_config: config.worker.clone(),
            tracker: Arc::clone(pool.tracker()),
            pool,
            registry: WorkerRegistry::new(),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            policy: Arc::new(DefaultPolicy::new()),
            grow: Notify::new(),
            creating: AtomicUsize::new(0),
            pending: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// Replace the response classification policy. Call before `start`.
    pub fn with_policy(mut self, policy: Arc<dyn ResponsePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Spawn the dispatch, creator, checker and event loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let queue_rx = self.queue_rx.lock().expect("dispatcher mutex poisoned").take();
        let events_rx = self.events_rx.lock().expect("dispatcher mutex poisoned").take();
        let (Some(queue_rx), Some(events_rx)) = (queue_rx, events_rx) else {
            tracing::warn!("Dispatcher already started");
            return Vec::new();
        };

        tracing::info!(
            max_workers = self.config.max_workers,
            min_workers = self.config.min_workers,
            min_idle_workers = self.config.min_idle_workers,
            "Dispatcher starting"
        );
        let handles = vec![
            tokio::spawn(Arc::clone(self).dispatch_loop(queue_rx)),
            tokio::spawn(Arc::clone(self).creator_loop()),
            tokio::spawn(Arc::clone(self).checker_loop()),
            tokio::spawn(Arc::clone(self).event_loop(events_rx)),
        ];
        self.grow.notify_one();
        handles
    }

    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            config: self.worker_config.clone(),
            max_consecutive_failures: self.config.worker_max_consecutive_failures,
            tracker: Arc::clone(&self.tracker),
            queue: self.queue.clone(),
            policy: Arc::clone(&self.policy),
            events: self.events_tx.clone(),
        }
    }

    /// Enqueue a request and return the handle its response arrives on.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskHandle, DispatchError> {
        if self.shutdown.is_triggered() {
            return Err(DispatchError::ShuttingDown);
        }
        request::absolute_uri(&request.host, &request.path)
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        if self.pending.load(Ordering::SeqCst) >= self.config.max_pending_tasks {
            metrics::record_task("overloaded", Duration::ZERO);
            return Err(DispatchError::Overloaded);
        }

        let (mut task, handle) = Task::new(request, self.config.default_task_timeout());
        task.track_pending(PendingGuard::new(Arc::clone(&self.pending)));
        tracing::trace!(task_id = %task.id, host = %task.host, path = %task.path, "Task submitted");
        self.queue.push(task)?;
        Ok(handle)
    }

    /// Submit and collect the whole response.
    pub async fn send(&self, request: TaskRequest) -> Result<HttpResponse, DispatchError> {
        let started = Instant::now();
        let result = match self.submit(request)?.response().await {
            Ok(head) => HttpResponse::from_head(head).await,
            Err(e) => Err(e),
        };
        let outcome = if result.is_ok() { "success" } else { "failed" };
        metrics::record_task(outcome, started.elapsed());
        result
    }

    pub async fn request(
        &self,
        method: Method,
        host: &str,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, DispatchError> {
        self.send(TaskRequest {
            method,
            host: host.to_string(),
            path: path.to_string(),
            headers,
            body,
            timeout,
        })
        .await
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Task>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let task = tokio::select! {
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            self.dispatch(task).await;
        }

        rx.close();
        while let Ok(task) = rx.try_recv() {
            task.fail(DispatchError::ShuttingDown);
        }
        tracing::debug!("Dispatch loop stopped");
    }

    async fn dispatch(&self, task: Task) {
        if task.is_canceled() {
            tracing::debug!(task_id = %task.id, "Task dropped by caller before dispatch");
            return;
        }
        if task.remaining().is_zero() {
            task.fail(DispatchError::Timeout);
            return;
        }

        let wait = self.config.get_worker_timeout().min(task.remaining());
        match self.get_worker(Instant::now() + wait).await {
            Some(worker) => worker.request(task),
            None if self.shutdown.is_triggered() => task.fail(DispatchError::ShuttingDown),
            None => {
                tracing::warn!(
                    task_id = %task.id,
                    host = %task.host,
                    waited_ms = wait.as_millis() as u64,
                    workers = self.registry.len(),
                    "No worker available"
                );
                task.fail(DispatchError::NoWorkerAvailable);
            }
        }
    }

    /// Best worker, waiting until `deadline` for one to appear.
    pub async fn get_worker(&self, deadline: Instant) -> Option<Arc<dyn Worker>> {
        loop {
            let notified = self.registry.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(worker) = self.select_worker() {
                return Some(worker);
            }
            if self.shutdown.is_triggered() || Instant::now() >= deadline {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn select_worker(&self) -> Option<Arc<dyn Worker>> {
        self.registry.prune();
        let workers = self.registry.snapshot();
        let best = self.best_worker(&workers);
        if self.needs_worker(&workers, best.as_ref().map(|(score, _)| *score)) {
            self.grow.notify_one();
        }
        best.map(|(_, worker)| worker)
    }

    fn best_worker(&self, workers: &[Arc<dyn Worker>]) -> Option<(u64, Arc<dyn Worker>)> {
        workers
            .iter()
            .filter(|w| w.accept_task())
            .map(|w| (w.score(), w))
            .filter(|(score, _)| *score < self.config.unusable_score)
            .min_by_key(|(score, _)| *score)
            .map(|(score, w)| (score, Arc::clone(w)))
    }

    fn needs_worker(&self, workers: &[Arc<dyn Worker>], best_score: Option<u64>) -> bool {
        let total = workers.len() + self.creating.load(Ordering::SeqCst);
        if total >= self.config.max_workers {
            return false;
        }
        let Some(best_score) = best_score else {
            return true;
        };
        let idle = workers.iter().filter(|w| w.accept_task() && w.is_idle()).count();
        let streams_full = workers.iter().any(|w| {
            w.protocol() == Protocol::Http2
                && w.outstanding() >= self.worker_config.http2_max_streams
        });
        idle < self.config.min_idle_workers
            || total < self.config.min_workers
            || best_score > self.config.good_score
            || streams_full
    }

    /// Signal growth if the current worker set is short.
    fn maintain(&self) {
        let workers = self.registry.snapshot();
        let best = self.best_worker(&workers).map(|(score, _)| score);
        if self.needs_worker(&workers, best) {
            self.grow.notify_one();
        }
    }

    async fn creator_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let notified = self.grow.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.spawn_creator();

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Worker creator stopped");
    }

    fn spawn_creator(self: &Arc<Self>) {
        if self.shutdown.is_triggered() {
            return;
        }
        let creating = self.creating.load(Ordering::SeqCst);
        let max_creating = self.config.min_idle_workers.max(1);
        if creating >= max_creating {
            return;
        }
        let workers = self.registry.snapshot();
        let best = self.best_worker(&workers).map(|(score, _)| score);
        if !self.needs_worker(&workers, best) {
            return;
        }
        self.creating.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).create_worker());
    }

    async fn create_worker(self: Arc<Self>) {
        let conn = self
            .pool
            .acquire(true, self.config.create_worker_timeout(), None)
            .await;

        let created = match conn {
            Some(conn) => {
                let ip = conn.ip();
                match self.wrap(conn).await {
                    Ok(worker) => {
                        self.add_worker(worker);
                        true
                    }
                    Err(e) => {
                        tracing::debug!(ip = %ip, error = %e, "Worker handshake failed");
                        self.tracker.report_closed(ip, "worker_start");
                        false
                    }
                }
            }
            None => false,
        };

        self.creating.fetch_sub(1, Ordering::SeqCst);
        if created {
            self.maintain();
        }
    }

    async fn wrap(&self, conn: PooledConnection) -> Result<Arc<dyn Worker>, WorkerError> {
        let ctx = self.worker_context();
        Ok(match conn.protocol() {
            Protocol::Http1 => Http1Worker::start(conn, ctx).await? as Arc<dyn Worker>,
            Protocol::Http2 => Http2Worker::start(conn, ctx).await? as Arc<dyn Worker>,
        })
    }

    pub fn add_worker(&self, worker: Arc<dyn Worker>) {
        tracing::debug!(
            worker = %worker.id(),
            ip = %worker.ip(),
            protocol = %worker.protocol(),
            score = worker.score(),
            "Worker added"
        );
        self.registry.add(worker);
        self.record_worker_metrics();
    }

    /// Re-enqueue a task that failed before delivery, or fail it.
    pub fn retry_task_cb(&self, task: Task, reason: &str) {
        self.queue.retry(task, reason);
    }

    async fn checker_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.check_workers(),
                _ = shutdown.recv() => break,
            }
        }
    }

    fn check_workers(&self) {
        let now = Instant::now();
        for worker in self.registry.snapshot() {
            worker.check_active(now);
        }
        self.registry.prune();
        self.check_free_worker();
        self.maintain();
        self.record_worker_metrics();
    }

    /// Close the worst idle worker when good idle workers are plentiful.
    pub fn check_free_worker(&self) -> Option<ConnectionId> {
        let workers = self.registry.snapshot();
        let free: Vec<(u64, &Arc<dyn Worker>)> = workers
            .iter()
            .filter(|w| w.accept_task() && w.is_idle())
            .map(|w| (w.score(), w))
            .collect();

        let good = free
            .iter()
            .filter(|(score, _)| *score < self.config.good_score)
            .count();
        let floor = self.config.idle_fraction * workers.len() as f64;
        if good < self.config.max_idle_workers || (good as f64) < floor {
            return None;
        }

        let (score, worst) = free.iter().max_by_key(|(score, _)| *score)?;
        let id = worst.id();
        tracing::debug!(worker = %id, ip = %worst.ip(), score, good, "Closing surplus idle worker");
        worst.close("free_worker");
        self.registry.remove(id);
        Some(id)
    }

    async fn event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            match event {
                WorkerEvent::Idle(_) => self.registry.notify(),
                WorkerEvent::Closed { id, .. } => {
                    self.registry.remove(id);
                    self.maintain();
                    self.record_worker_metrics();
                }
            }
        }
    }

    pub fn close_all_worker(&self, reason: &str) {
        let workers = self.registry.snapshot();
        for worker in &workers {
            worker.close(reason);
            self.registry.remove(worker.id());
        }
        if !workers.is_empty() {
            tracing::info!(closed = workers.len(), reason, "All workers closed");
        }
        self.record_worker_metrics();
    }

    /// Stop every loop, close workers and drain the pool.
    pub fn stop(&self) {
        self.shutdown.trigger();
        self.close_all_worker("shutdown");
        self.pool.close_all();
        self.registry.notify();
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    fn record_worker_metrics(&self) {
        metrics::record_workers(
            self.registry.count(Protocol::Http1),
            self.registry.count(Protocol::Http2),
        );
    }

    pub fn status(&self) -> DispatcherStatus {
        let workers: Vec<WorkerStatus> = self.registry.snapshot().iter().map(|w| w.status()).collect();
        DispatcherStatus {
            running: !self.shutdown.is_triggered(),
            http1_workers: workers.iter().filter(|w| w.protocol == Protocol::Http1).count(),
            http2_workers: workers.iter().filter(|w| w.protocol == Protocol::Http2).count(),
            creating: self.creating.load(Ordering::SeqCst),
            pending_tasks: self.pending.load(Ordering::SeqCst),
            workers,
            pool: self.pool.status(),
            ips: self.tracker.snapshots(),
        }
    }
}
