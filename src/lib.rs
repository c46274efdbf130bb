//! Frontline: a pool of pre-established TLS front connections with
//! per-IP quality tracking and score-based HTTP/1.1 and HTTP/2 dispatch.

pub mod config;
pub mod error;
pub mod net;
pub mod health;
pub mod pool;
pub mod worker;
pub mod dispatch;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::FrontConfig;
pub use dispatch::{Dispatcher, HttpResponse, TaskRequest};
pub use health::IpQualityTracker;
pub use lifecycle::Shutdown;
pub use pool::ConnectionPool;
