//! Request dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! submit / request
//!     → TaskQueue (queue.rs)
//!     → dispatch loop: get_worker (lowest score, waits on registry changes)
//!     → worker.request(task)
//!     → ResponseHead + ResponseBody back through TaskHandle (task.rs)
//!
//! Failure before delivery → queue.retry → back into the queue or failed
//! Grow signal → creator → pool.acquire → Http1Worker / Http2Worker → registry
//! Checker (every check interval) → keep-alive checks, surplus eviction
//! ```
//!
//! # Design Decisions
//! - Score is the only selection criterion; protocol is not preferred
//! - Responses are classified by an injectable policy (policy.rs)
//! - The registry keeps registration order for deterministic ties

pub mod dispatcher;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod task;

pub use dispatcher::{Dispatcher, DispatcherStatus};
pub use policy::{DefaultPolicy, ResponseClass, ResponsePolicy};
pub use queue::TaskQueue;
pub use registry::WorkerRegistry;
pub use task::{HttpResponse, ResponseBody, ResponseHead, Task, TaskHandle, TaskRequest, TaskState};
