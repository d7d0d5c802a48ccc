//! Module that defines a single application-level [`Error`] type, its classification into
//! [`ErrorKind`]s and a _retry_ helper function which is usable in `async` contexts.
use std::future::Future;
use std::time::Duration;

use hyper::Error as HyperError;
use prometheus::Error as PrometheusError;
use redis::RedisError;
use tokio_graceful_shutdown::errors::GracefulShutdownError;

/// Generic dynamic error with type erased
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Enum encapsulating all the error variants of this crate's components
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Application configuration errors
    #[error("Invalid or missing configuration")]
    Config(#[from] config::ConfigError),

    /// Event Log (Redis Streams) communication errors
    #[error("EventLogError {0:?}")]
    EventLog(#[from] RedisError),

    /// Persistent store errors which originated in the [`LoginStore`](crate::store::LoginStore)
    #[error("StoreError {0:?}")]
    Store(#[from] sqlx::Error),

    /// Read-through cache errors, never propagated to the callers of the service
    #[error("CacheError {0:?}")]
    Cache(RedisError),

    /// Input which parses neither as an IPv4 nor as an IPv6 address
    #[error("Invalid IP address '{0}', please provide a valid IPv4 or IPv6 address")]
    InvalidAddress(String),

    /// Input which is not a complete address, a partial address or a CIDR block
    #[error("Invalid IP address pattern '{0}', please provide an address or a prefix such as 192.168 or 2001:db8")]
    InvalidPattern(String),

    /// User ids must be positive
    #[error("User ID must be a positive number, got {0}")]
    InvalidUserId(i64),

    /// Event Log entry which cannot be decoded into a login event
    #[error("Undecodable message: {0}")]
    Poison(String),

    /// Admission control rejected the request
    ///
    /// The protected resource is under too much load, the operation can be retried later.
    #[error("Service is currently experiencing high load ({0}), please try again")]
    Overload(&'static str),

    /// The caller gave up on the request
    #[error("Request cancelled by the caller")]
    Cancelled,

    /// Errors related to registering, access and manipulation with Prometheus metrics
    #[error("MetricsError {0:?}")]
    Metrics(#[from] PrometheusError),

    /// Metrics server errors
    #[error("Metrics exporter error {0:?}")]
    MetricsExporter(#[from] HyperError),

    /// Application shutdown errors
    #[error("Graceful shutdown failed with {0:?}")]
    ShutdownError(#[from] GracefulShutdownError<BoxedError>),
}

/// Coarse classification of [`Error`]s as seen by the callers of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected synchronously and never retried
    Validation,
    /// Undecodable queue entry, acknowledged and dropped
    Poison,
    /// Admission gate timeout or unavailable backend, safe to retry
    TransientOverload,
    /// Caller-initiated cancellation
    Cancelled,
    /// Everything else
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAddress(_) | Self::InvalidPattern(_) | Self::InvalidUserId(_) => {
                ErrorKind::Validation
            }
            Self::Poison(_) => ErrorKind::Poison,
            Self::Overload(_) | Self::EventLog(_) | Self::Store(_) => ErrorKind::TransientOverload,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the caller should retry the request later
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientOverload
    }
}

/// Asynchronously runs given future-producing closure `f` `tries`-times with a fixed `delay`.
pub async fn async_retry<T, E, F, Fut>(mut tries: u64, delay: Duration, f: F) -> Result<T, E>
where
    F: Fn() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
{
    loop {
        match f().await {
            e @ Err(_) if tries == 0 => return e,
            Err(_) => tokio::time::sleep(delay).await,
            r => return r,
        }
        tries -= 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use anyhow::{bail, Result};
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::address(Error::InvalidAddress("x".to_owned()), ErrorKind::Validation)]
    #[case::pattern(Error::InvalidPattern("x".to_owned()), ErrorKind::Validation)]
    #[case::user(Error::InvalidUserId(0), ErrorKind::Validation)]
    #[case::poison(Error::Poison("missing field".to_owned()), ErrorKind::Poison)]
    #[case::overload(Error::Overload("admission gate"), ErrorKind::TransientOverload)]
    #[case::store(Error::Store(sqlx::Error::PoolTimedOut), ErrorKind::TransientOverload)]
    #[case::cancelled(Error::Cancelled, ErrorKind::Cancelled)]
    fn classifies_errors(#[case] error: Error, #[case] expected: ErrorKind) {
        assert_eq!(error.kind(), expected);
        assert_eq!(error.is_retryable(), expected == ErrorKind::TransientOverload);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU64::new(0);

        let result = async_retry(3, Duration::from_millis(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                bail!("not yet");
            }
            Ok(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retries() {
        let calls = AtomicU64::new(0);

        let result: Result<()> = async_retry(2, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            bail!("always failing")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
