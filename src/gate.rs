use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;

/// Component responsible for bounding the number of concurrent operations on a shared resource
/// (i.e. the persistent store) and rejecting callers which cannot be admitted within a timeout.
///
/// Clones share the same set of permits.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    /// Name of the guarded resource reported with [`Error::Overload`]
    resource: &'static str,
    permits: Arc<Semaphore>,
    capacity: usize,
    /// Maximum time a caller waits for a permit
    timeout: Duration,
}

impl AdmissionGate {
    /// Create new gate admitting at most `capacity` concurrent holders.
    ///
    /// Panics if `capacity == 0`.
    #[inline]
    pub fn new(resource: &'static str, capacity: usize, timeout: Duration) -> Self {
        assert!(capacity > 0, "gate capacity cannot be zero");
        Self {
            resource,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            timeout,
        }
    }

    /// Wait for a permit which is released when dropped.
    ///
    /// Fails with [`Error::Overload`] if no permit becomes available within the timeout.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, Error> {
        match tokio::time::timeout(self.timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(Error::Overload(self.resource)),
        }
    }

    /// Number of permits currently not held by anyone
    #[inline]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let gate = AdmissionGate::new("store", 2, Duration::from_millis(20));

        let first = gate.acquire().await.expect("first permit");
        let _second = gate.acquire().await.expect("second permit");
        assert_eq!(gate.available(), 0);

        let rejected = gate.acquire().await;
        assert!(matches!(rejected, Err(Error::Overload("store"))));

        drop(first);
        assert_eq!(gate.available(), 1);
        assert!(gate.clone().acquire().await.is_ok());
    }

    #[tokio::test]
    async fn waits_for_released_permit() {
        let gate = AdmissionGate::new("store", 1, Duration::from_secs(1));
        let permit = gate.acquire().await.expect("permit");

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(permit);
        });

        assert!(gate.acquire().await.is_ok());
        release.await.expect("release task");
        assert_eq!(gate.capacity(), 1);
    }

    #[test]
    #[should_panic(expected = "gate capacity cannot be zero")]
    fn panics_for_zero_capacity() {
        AdmissionGate::new("store", 0, Duration::from_secs(1));
    }
}
