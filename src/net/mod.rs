//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Candidate lease (health::tracker)
//!     → socket.rs (TCP connect: zero linger, 32 KiB receive buffer, no-delay)
//!     → tls.rs (TLS handshake with chosen SNI, ALPN)
//!     → cert.rs (chain length, intermediate pin, issuer prefix)
//!     → connection.rs (PooledConnection owning the socket)
//!     → Hand off to the pool
//! ```
//!
//! # Design Decisions
//! - connector.rs owns the outcome reporting so every attempt is accounted
//!   exactly once
//! - TLS is an injected engine; the connector only needs a byte stream back

pub mod cert;
pub mod connection;
pub mod connector;
pub mod socket;
pub mod tls;

pub use connection::{BoxedIo, CloseReport, ConnectionId, ConnectionInfo, PooledConnection, Protocol};
pub use connector::{Connector, TlsConnector};
pub use tls::{RustlsEngine, TlsEngine, TlsSession};
