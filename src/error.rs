//! Error types shared across subsystems.

use std::io;

use serde::Serialize;

/// Why an IP failed a connect attempt. Retry policy differs per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Reset,
    Refused,
    /// Evidence of interception: the IP is excluded for the rest of the run.
    Trust,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Reset => "reset",
            FailureKind::Refused => "refused",
            FailureKind::Trust => "trust",
            FailureKind::Other => "other",
        }
    }

    /// Classify an I/O error from connect or handshake.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => FailureKind::Reset,
            io::ErrorKind::ConnectionRefused => FailureKind::Refused,
            _ => FailureKind::Other,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The peer certificate chain is not the one a genuine frontend presents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateTrustError {
    #[error("certificate chain has {len} certificates, at least {min} required")]
    ChainTooShort { len: usize, min: usize },
    #[error("intermediate key {fingerprint} is not pinned")]
    PinMismatch { fingerprint: String },
    #[error("certificate issued by {issuer:?}, expected prefix {expected:?}")]
    UnexpectedIssuer { issuer: String, expected: String },
    #[error("certificate chain rejected: {0}")]
    InvalidChain(String),
    #[error("malformed certificate: {0}")]
    Malformed(String),
}

/// A connect attempt against one candidate failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect timed out")]
    Timeout,
    #[error("connection reset: {0}")]
    Reset(io::Error),
    #[error("connection refused: {0}")]
    Refused(io::Error),
    #[error(transparent)]
    Trust(#[from] CertificateTrustError),
    #[error("connect failed: {0}")]
    Io(io::Error),
}

impl ConnectError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConnectError::Timeout => FailureKind::Timeout,
            ConnectError::Reset(_) => FailureKind::Reset,
            ConnectError::Refused(_) => FailureKind::Refused,
            ConnectError::Trust(_) => FailureKind::Trust,
            ConnectError::Io(_) => FailureKind::Other,
        }
    }

    /// Trust errors are never retried against the same IP.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ConnectError::Trust(_))
    }
}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        if let Some(rustls::Error::InvalidCertificate(reason)) =
            err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>())
        {
            return ConnectError::Trust(CertificateTrustError::InvalidChain(format!("{reason:?}")));
        }
        match FailureKind::from_io(&err) {
            FailureKind::Timeout => ConnectError::Timeout,
            FailureKind::Reset => ConnectError::Reset(err),
            FailureKind::Refused => ConnectError::Refused(err),
            _ => ConnectError::Io(err),
        }
    }
}

/// A request failed inside a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker closed: {0}")]
    Closed(String),
    #[error("http/1.1 transport: {0}")]
    Http1(#[from] hyper::Error),
    #[error("h2 transport: {0}")]
    Http2(#[from] h2::Error),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("timed out waiting for response")]
    Timeout,
}

/// Terminal failure of a task as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no worker available")]
    NoWorkerAvailable,
    #[error("task timed out")]
    Timeout,
    #[error("task failed: {0}")]
    RetryExhausted(String),
    #[error("too many pending tasks")]
    Overloaded,
    #[error("dispatcher is shutting down")]
    ShuttingDown,
    #[error("response stream failed: {0}")]
    Stream(String),
    #[error("task dropped without a response")]
    Canceled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
