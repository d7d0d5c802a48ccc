//! Registry of per-user locks which serializes concurrent `RecordLogin` calls for the same user.
//!
//! The registry only holds weak references, a lock lives as long as someone holds or waits for it.
//! Dead entries are pruned whenever the registry grows beyond its capacity, so memory stays bounded
//! by the configured capacity plus the number of users with in-flight requests.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type UserGuard = OwnedMutexGuard<()>;

#[derive(Debug)]
pub struct UserLocks {
    locks: Mutex<HashMap<i64, Weak<AsyncMutex<()>>>>,
    capacity: usize,
}

impl UserLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn handle(&self, user_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(lock) = locks.get(&user_id).and_then(Weak::upgrade) {
            return lock;
        }

        if locks.len() >= self.capacity {
            locks.retain(|_, lock| lock.strong_count() > 0);
        }

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(user_id, Arc::downgrade(&lock));
        lock
    }

    /// Lock given user, waiting at most `timeout`.
    ///
    /// Returns `None` if the lock could not be acquired in time.
    pub async fn lock(&self, user_id: i64, timeout: Duration) -> Option<UserGuard> {
        let lock = self.handle(user_id);
        tokio::time::timeout(timeout, lock.lock_owned()).await.ok()
    }

    /// Number of tracked entries, including dead ones not pruned yet
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn serializes_same_user() {
        let locks = UserLocks::new(16);

        let guard = locks.lock(1, TIMEOUT).await;
        assert!(guard.is_some());
        assert!(locks.lock(1, TIMEOUT).await.is_none());

        drop(guard);
        assert!(locks.lock(1, TIMEOUT).await.is_some());
    }

    #[tokio::test]
    async fn different_users_do_not_contend() {
        let locks = UserLocks::new(16);

        let _first = locks.lock(1, TIMEOUT).await.expect("first user");
        let _second = locks.lock(2, TIMEOUT).await.expect("second user");
    }

    #[tokio::test]
    async fn prunes_released_locks() {
        let locks = UserLocks::new(4);

        for user_id in 0..100 {
            let guard = locks.lock(user_id, TIMEOUT).await;
            assert!(guard.is_some());
        }

        assert!(locks.len() <= 4);
    }

    #[tokio::test]
    async fn keeps_held_locks_while_pruning() {
        let locks = UserLocks::new(2);

        let held = locks.lock(7, TIMEOUT).await;
        for user_id in 100..110 {
            let _ = locks.lock(user_id, TIMEOUT).await;
        }

        assert!(locks.lock(7, TIMEOUT).await.is_none());
        drop(held);
        assert!(!locks.is_empty());
    }
}
