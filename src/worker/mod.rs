//! Protocol worker subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher picks a worker
//!     → request(task) (outstanding counted synchronously)
//!     → http1.rs / http2.rs send the request
//!     → head delivered to the task, body streamed in chunks
//!     → Idle / Closed events back to the dispatcher
//!
//! Failure before delivery → task queue retry path
//! Failure after delivery  → error chunk, worker closed ("down_fail")
//! ```
//!
//! # Design Decisions
//! - Each worker owns exactly one pooled connection
//! - base.rs holds the protocol-independent bookkeeping
//! - Closing is idempotent and reports to the tracker exactly once

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::WorkerConfig;
use crate::dispatch::policy::ResponsePolicy;
use crate::dispatch::queue::TaskQueue;
use crate::dispatch::task::Task;
use crate::health::IpQualityTracker;
use crate::net::{ConnectionId, Protocol};

pub mod base;
pub mod http1;
pub mod http2;
pub mod request;
pub mod score;

pub use http1::Http1Worker;
pub use http2::Http2Worker;

/// Notifications from workers to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// No task in flight any more.
    Idle(ConnectionId),
    Closed { id: ConnectionId, ip: IpAddr, reason: String },
}

/// Everything a worker needs besides its connection.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub max_consecutive_failures: u32,
    pub tracker: Arc<IpQualityTracker>,
    pub queue: TaskQueue,
    pub policy: Arc<dyn ResponsePolicy>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Serializable worker snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: ConnectionId,
    pub ip: IpAddr,
    pub sni: String,
    pub protocol: Protocol,
    pub score: u64,
    pub outstanding: usize,
    pub processed: u64,
    pub consecutive_failures: u32,
    pub age_secs: u64,
    pub accept_task: bool,
    pub closed: bool,
}

/// A request executor bound to one front connection.
pub trait Worker: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn ip(&self) -> IpAddr;

    fn protocol(&self) -> Protocol;

    /// Can take another task right now.
    fn accept_task(&self) -> bool;

    fn outstanding(&self) -> usize;

    fn score(&self) -> u64;

    fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    fn processed(&self) -> u64;

    /// Past max life, max processed tasks, or too many failed tasks.
    fn life_end(&self) -> bool;

    /// Close on protocol-specific inactivity rules.
    fn check_active(&self, now: Instant);

    /// Start executing `task`. The outstanding count is raised before this
    /// returns.
    fn request(self: Arc<Self>, task: Task);

    fn close(&self, reason: &str);

    fn is_closed(&self) -> bool;

    fn status(&self) -> WorkerStatus;
}
