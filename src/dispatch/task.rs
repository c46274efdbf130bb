//! Logical request task.
//!
//! # Responsibilities
//! - Carry one caller request through queueing, assignment and retries
//! - Deliver the response head exactly once through a single-slot sink
//! - Keep a small state trace for diagnostics
//!
//! # Design Decisions
//! - The response head travels over a oneshot; the body over a bounded
//!   channel so a slow caller throttles the worker
//! - Once the head is delivered the task is never retried

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::net::Protocol;

const BODY_CHANNEL_CAPACITY: usize = 16;

/// Where a task is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Assigned,
    Retrying,
    Completed,
    Failed,
}

/// One state transition.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub elapsed_ms: u64,
    pub state: TaskState,
    pub note: String,
}

/// What the caller asks for.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl TaskRequest {
    pub fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, host, path)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

type HeadResult = Result<ResponseHead, DispatchError>;

/// Decrements the outstanding-task counter when the task is gone.
#[derive(Debug)]
pub(crate) struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A request on its way to a worker.
#[derive(Debug)]
pub struct Task {
    pub id: Uuid,
    pub method: Method,
    pub host: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
    pub start: Instant,
    pub retry_count: u32,
    pub worker_ip: Option<IpAddr>,
    state: TaskState,
    delivered: bool,
    trace: Vec<TraceEntry>,
    sink: Option<oneshot::Sender<HeadResult>>,
    pending: Option<PendingGuard>,
}

impl Task {
    pub fn new(request: TaskRequest, default_timeout: Duration) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let start = Instant::now();
        let timeout = request.timeout.unwrap_or(default_timeout);
        let mut task = Self {
            id,
            method: request.method,
            host: request.host,
            path: request.path,
            headers: request.headers,
            body: request.body,
            timeout,
            start,
            retry_count: 0,
            worker_ip: None,
            state: TaskState::Queued,
            delivered: false,
            trace: Vec::new(),
            sink: Some(tx),
            pending: None,
        };
        task.set_state(TaskState::Queued, "submitted");
        let handle = TaskHandle {
            id,
            deadline: start + timeout,
            rx,
        };
        (task, handle)
    }

    pub(crate) fn track_pending(&mut self, guard: PendingGuard) {
        self.pending = Some(guard);
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_state(&mut self, state: TaskState, note: impl Into<String>) {
        self.state = state;
        self.trace.push(TraceEntry {
            elapsed_ms: self.elapsed().as_millis() as u64,
            state,
            note: note.into(),
        });
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn deadline(&self) -> Instant {
        self.start + self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    /// The caller stopped waiting for the response.
    pub fn is_canceled(&self) -> bool {
        self.sink.as_ref().map_or(true, |s| s.is_closed())
    }

    /// Send the response head. Returns the body sender, or `None` when the
    /// caller is gone.
    pub fn deliver(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        ip: IpAddr,
        protocol: Protocol,
    ) -> Option<mpsc::Sender<Result<Bytes, DispatchError>>> {
        let sink = self.sink.take()?;
        self.delivered = true;
        self.set_state(TaskState::Completed, format!("{status} from {ip}"));

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let head = ResponseHead {
            task_id: self.id,
            status,
            headers,
            retry_count: self.retry_count,
            ip,
            protocol,
            body: ResponseBody { rx },
        };
        sink.send(Ok(head)).ok().map(|()| tx)
    }

    /// Complete the task with an error. No-op once the head was delivered.
    pub fn fail(mut self, err: DispatchError) {
        self.set_state(TaskState::Failed, err.to_string());
        if let Some(sink) = self.sink.take() {
            tracing::debug!(
                task_id = %self.id,
                host = %self.host,
                retries = self.retry_count,
                elapsed_ms = self.elapsed().as_millis() as u64,
                error = %err,
                "Task failed"
            );
            let _ = sink.send(Err(err));
        }
    }
}

/// Caller side of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: Uuid,
    deadline: Instant,
    rx: oneshot::Receiver<HeadResult>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the response head, bounded by the task timeout.
    pub async fn response(self) -> Result<ResponseHead, DispatchError> {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::Canceled),
            Err(_) => Err(DispatchError::Timeout),
        }
    }
}

/// Status line and headers, with the body still streaming.
#[derive(Debug)]
pub struct ResponseHead {
    pub task_id: Uuid,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub retry_count: u32,
    pub ip: IpAddr,
    pub protocol: Protocol,
    pub body: ResponseBody,
}

/// Incremental response body.
#[derive(Debug)]
pub struct ResponseBody {
    rx: mpsc::Receiver<Result<Bytes, DispatchError>>,
}

impl ResponseBody {
    pub async fn chunk(&mut self) -> Option<Result<Bytes, DispatchError>> {
        self.rx.recv().await
    }

    pub async fn collect(mut self) -> Result<Bytes, DispatchError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.rx.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// A fully received response.
#[derive(Debug, Clone, Serialize)]
pub struct HttpResponse {
    #[serde(with = "status_code")]
    pub status: StatusCode,
    #[serde(skip)]
    pub headers: HeaderMap,
    #[serde(skip)]
    pub body: Bytes,
    pub retry_count: u32,
    pub ip: IpAddr,
    pub protocol: Protocol,
}

impl HttpResponse {
    pub async fn from_head(head: ResponseHead) -> Result<Self, DispatchError> {
        let ResponseHead {
            status,
            headers,
            retry_count,
            ip,
            protocol,
            body,
            ..
        } = head;
        Ok(Self {
            status,
            headers,
            body: body.collect().await?,
            retry_count,
            ip,
            protocol,
        })
    }
}

mod status_code {
    use http::StatusCode;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(status.as_u16())
    }
}
