//! Response classification.
//!
//! Classification only drives worker and IP bookkeeping; every response is
//! delivered to the caller regardless of its class.

use http::{HeaderMap, StatusCode};

/// How a response reflects on the connection that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// The exchange worked but the answer is not a clean success (e.g. a
    /// front-end quota page). Counted as processed, not as a failure.
    SoftSuccess,
    Failure,
}

pub trait ResponsePolicy: Send + Sync {
    fn classify(&self, status: StatusCode, headers: &HeaderMap) -> ResponseClass;
}

type SoftPredicate = dyn Fn(StatusCode, &HeaderMap) -> bool + Send + Sync;

/// 5xx is a failure, everything else a success, unless the soft-success
/// predicate claims the response first.
#[derive(Default)]
pub struct DefaultPolicy {
    soft: Option<Box<SoftPredicate>>,
}

impl DefaultPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_soft_success<F>(predicate: F) -> Self
    where
        F: Fn(StatusCode, &HeaderMap) -> bool + Send + Sync + 'static,
    {
        Self {
            soft: Some(Box::new(predicate)),
        }
    }
}

impl ResponsePolicy for DefaultPolicy {
    fn classify(&self, status: StatusCode, headers: &HeaderMap) -> ResponseClass {
        if self.soft.as_ref().is_some_and(|soft| soft(status, headers)) {
            ResponseClass::SoftSuccess
        } else if status.is_server_error() {
            ResponseClass::Failure
        } else {
            ResponseClass::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classification() {
        let policy = DefaultPolicy::new();
        let headers = HeaderMap::new();
        assert_eq!(policy.classify(StatusCode::OK, &headers), ResponseClass::Success);
        assert_eq!(policy.classify(StatusCode::NOT_FOUND, &headers), ResponseClass::Success);
        assert_eq!(policy.classify(StatusCode::BAD_GATEWAY, &headers), ResponseClass::Failure);
    }

    #[test]
    fn soft_predicate_wins() {
        let policy = DefaultPolicy::with_soft_success(|status, headers| {
            status == StatusCode::SERVICE_UNAVAILABLE && headers.contains_key("x-quota")
        });
        let mut headers = HeaderMap::new();
        assert_eq!(
            policy.classify(StatusCode::SERVICE_UNAVAILABLE, &headers),
            ResponseClass::Failure
        );
        headers.insert("x-quota", "exceeded".parse().unwrap());
        assert_eq!(
            policy.classify(StatusCode::SERVICE_UNAVAILABLE, &headers),
            ResponseClass::SoftSuccess
        );
    }
}
