//! The login service: synchronous entry point of the write path and the query operations.
//!
//! `RecordLogin` only validates the input and appends an event to the Event Log, persistence
//! happens asynchronously in the pipeline. Queries read through the [`Cache`] and reach the
//! [`LoginStore`] behind their own [`AdmissionGate`].
//!
//! Every query takes a [`Tripwire`] which aborts the request with [`Error::Cancelled`] when
//! triggered. Callers without a cancellation signal can pass the tripwire of a disabled trigger.
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stream_cancel::Tripwire;
use time::OffsetDateTime;
use tracing::{debug, error, instrument, warn};

use crate::cache::{self, Cache};
use crate::config::ServiceConfig;
use crate::error::Error;
use crate::event_log::{EntryId, EventLog};
use crate::gate::AdmissionGate;
use crate::locks::UserLocks;
use crate::login::{IpLogin, LastLogin, LoginEvent, UserLogin};
use crate::pattern;
use crate::store::LoginStore;

/// Acknowledgement of an accepted `RecordLogin` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Id of the appended Event Log entry
    pub entry_id: EntryId,
    pub record_id: String,
    pub message: String,
}

#[inline]
fn validate_user(user_id: i64) -> Result<(), Error> {
    if user_id <= 0 {
        return Err(Error::InvalidUserId(user_id));
    }
    Ok(())
}

/// Run `request` unless `cancel` is triggered first.
async fn cancellable<T, F>(cancel: Tripwire, request: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        true = cancel => Err(Error::Cancelled),
        result = request => result,
    }
}

pub struct LoginService<L, S, C> {
    log: Arc<L>,
    store: Arc<S>,
    cache: Arc<C>,
    locks: UserLocks,
    read_gate: AdmissionGate,
    cfg: ServiceConfig,
}

impl<L, S, C> LoginService<L, S, C>
where
    L: EventLog + 'static,
    S: LoginStore + 'static,
    C: Cache + 'static,
{
    pub fn new(log: Arc<L>, store: Arc<S>, cache: Arc<C>, cfg: ServiceConfig) -> Self {
        Self {
            log,
            store,
            cache,
            locks: UserLocks::new(cfg.lock_capacity),
            read_gate: AdmissionGate::new("store reads", cfg.read_permits, cfg.read_timeout),
            cfg,
        }
    }

    /// Record a login of a user from given address at given time.
    ///
    /// On success the event is durably appended to the Event Log, though not persisted to the
    /// store yet.
    #[instrument(skip(self, timestamp))]
    pub async fn record_login(
        &self,
        user_id: i64,
        ip_address: &str,
        timestamp: OffsetDateTime,
    ) -> Result<LoginAck, Error> {
        validate_user(user_id)?;

        let event = LoginEvent::new(user_id, ip_address, timestamp).map_err(|e| {
            warn!("rejecting login with invalid IP address");
            e
        })?;

        let guard = self.locks.lock(user_id, self.cfg.lock_timeout).await;
        if guard.is_none() {
            warn!("user lock timed out, recording login without it");
        }

        let entry_id = self.log.append(&event).await.map_err(|e| {
            error!(cause = %e, "failed to append login event");
            e
        })?;

        debug!(entry_id, record_id = event.record_id, "login event appended");

        self.invalidate(vec![
            cache::user_ips_key(user_id),
            cache::user_last_login_key(user_id),
            cache::users_by_ip_key(&event.ip_text),
        ]);

        drop(guard);

        Ok(LoginAck {
            entry_id,
            record_id: event.record_id,
            message: "Login recorded successfully".to_owned(),
        })
    }

    /// All addresses a user logged in from, most recent first.
    #[instrument(skip(self, cancel))]
    pub async fn list_ips_for_user(
        &self,
        user_id: i64,
        cancel: Tripwire,
    ) -> Result<Vec<IpLogin>, Error> {
        validate_user(user_id)?;

        let request = self.read_through(cache::user_ips_key(user_id), || async move {
            let _permit = self.read_gate.acquire().await?;
            let records = self.store.ips_for_user(user_id).await?;
            Ok(records.into_iter().map(IpLogin::from).collect())
        });

        cancellable(cancel, request).await
    }

    /// Users who logged in from addresses matching the pattern, with their most recent matching
    /// login, ordered by user id.
    #[instrument(skip(self, cancel))]
    pub async fn list_users_for_ip(
        &self,
        ip_pattern: &str,
        cancel: Tripwire,
    ) -> Result<Vec<UserLogin>, Error> {
        let query = pattern::resolve(ip_pattern)?;
        debug!(%query, exact = query.exact, "resolved address pattern");

        let request = self.read_through(cache::users_by_ip_key(ip_pattern), || async move {
            let _permit = self.read_gate.acquire().await?;
            let records = self.store.users_for_ip(&query).await?;
            Ok(records.into_iter().map(UserLogin::from).collect())
        });

        cancellable(cancel, request).await
    }

    /// The most recent login of a user.
    #[instrument(skip(self, cancel))]
    pub async fn last_login_for_user(
        &self,
        user_id: i64,
        cancel: Tripwire,
    ) -> Result<LastLogin, Error> {
        validate_user(user_id)?;

        let request = self.read_through(cache::user_last_login_key(user_id), || async move {
            let _permit = self.read_gate.acquire().await?;
            let record = self.store.last_login(user_id).await?;
            Ok(record.map_or_else(|| LastLogin::not_found(user_id), LastLogin::from))
        });

        cancellable(cancel, request).await
    }

    /// Serve `key` from the cache, or `load` it and populate the cache in the background.
    async fn read_through<T, F, Fut>(&self, key: String, load: F) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str(&cached) {
                Ok(value) => {
                    debug!(key, "cache hit");
                    return Ok(value);
                }
                Err(e) => warn!(key, cause = %e, "ignoring undecodable cache entry"),
            },
            Ok(None) => debug!(key, "cache miss"),
            Err(e) => warn!(key, cause = %e, "cache read failed, falling back to the store"),
        }

        let value = load().await?;

        match serde_json::to_string(&value) {
            Ok(json) => self.populate(key, json),
            Err(e) => warn!(key, cause = %e, "failed to serialize cache entry"),
        }

        Ok(value)
    }

    fn populate(&self, key: String, value: String) {
        let cache = self.cache.clone();
        let ttl = self.cfg.cache_ttl;
        tokio::spawn(async move {
            if let Err(e) = cache.set(&key, &value, ttl).await {
                warn!(key, cause = %e, "failed to populate cache");
            }
        });
    }

    fn invalidate(&self, keys: Vec<String>) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            for key in keys {
                if let Err(e) = cache.invalidate(&key).await {
                    warn!(key, cause = %e, "failed to invalidate cache entry");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::*;
    use stream_cancel::Trigger;
    use time::macros::datetime;

    use super::*;
    use crate::mock::{MemoryCache, MemoryEventLog, MemoryStore};

    type Service = LoginService<MemoryEventLog, MemoryStore, MemoryCache>;

    struct Harness {
        log: Arc<MemoryEventLog>,
        cache: Arc<MemoryCache>,
        service: Service,
    }

    #[fixture]
    fn harness() -> Harness {
        harness_with(ServiceConfig::default())
    }

    fn harness_with(cfg: ServiceConfig) -> Harness {
        let log = Arc::new(MemoryEventLog::new());
        let cache = Arc::new(MemoryCache::new());
        let service = LoginService::new(
            log.clone(),
            Arc::new(MemoryStore::new()),
            cache.clone(),
            cfg,
        );
        Harness {
            log,
            cache,
            service,
        }
    }

    fn no_cancel() -> Tripwire {
        let (trigger, tripwire) = Tripwire::new();
        trigger.disable();
        tripwire
    }

    #[rstest]
    #[case::zero(0)]
    #[case::negative(-5)]
    #[tokio::test]
    async fn rejects_invalid_user(harness: Harness, #[case] user_id: i64) {
        let at = datetime!(2024-01-01 00:00 UTC);
        let result = harness.service.record_login(user_id, "10.0.0.1", at).await;

        assert!(matches!(result, Err(Error::InvalidUserId(_))));
        assert!(harness.log.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn rejects_invalid_address(harness: Harness) {
        let at = datetime!(2024-01-01 00:00 UTC);
        let result = harness.service.record_login(7, "not-an-ip", at).await;

        assert!(matches!(result, Err(Error::InvalidAddress(_))));
        assert!(harness.log.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn appends_canonical_event(harness: Harness) {
        let at = datetime!(2024-01-01 00:00 UTC);
        let ack = harness
            .service
            .record_login(7, "2001:DB8:0::1", at)
            .await
            .expect("accepted");

        assert_eq!(ack.message, "Login recorded successfully");
        assert_eq!(harness.log.len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn fails_when_event_log_is_unavailable(harness: Harness) {
        harness.log.set_unavailable(true);
        let at = datetime!(2024-01-01 00:00 UTC);

        let result = harness.service.record_login(7, "10.0.0.1", at).await;

        assert!(matches!(result, Err(Error::EventLog(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn rejects_invalid_pattern(harness: Harness) {
        let result = harness
            .service
            .list_users_for_ip("192.168.*", no_cancel())
            .await;
        assert!(matches!(result, Err(Error::InvalidPattern(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn reports_missing_last_login(harness: Harness) {
        let last = harness
            .service
            .last_login_for_user(99, no_cancel())
            .await
            .expect("query");

        assert_eq!(last, LastLogin::not_found(99));
    }

    #[rstest]
    #[tokio::test]
    async fn serves_queries_when_cache_fails(harness: Harness) {
        harness.cache.set_unavailable(true);

        let ips = harness
            .service
            .list_ips_for_user(1, no_cancel())
            .await
            .expect("query");

        assert!(ips.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn invalidates_cached_queries_of_login(harness: Harness) {
        let ttl = Duration::from_secs(60);
        let keys = [
            cache::user_ips_key(7),
            cache::user_last_login_key(7),
            cache::users_by_ip_key("10.0.0.1"),
        ];
        for key in &keys {
            harness.cache.set(key, "[]", ttl).await.unwrap();
        }
        harness.cache.set("user_ips_8", "[]", ttl).await.unwrap();

        let at = datetime!(2024-01-01 00:00 UTC);
        harness
            .service
            .record_login(7, "10.0.0.1", at)
            .await
            .expect("login recorded");

        tokio::time::sleep(Duration::from_millis(10)).await;
        for key in &keys {
            assert!(!harness.cache.contains(key), "{key} still cached");
        }
        assert!(harness.cache.contains("user_ips_8"));
    }

    #[rstest]
    #[tokio::test]
    async fn serves_cached_result_without_store(harness: Harness) {
        let cached = vec![IpLogin {
            ip_address: "10.0.0.1".to_owned(),
            last_login: datetime!(2024-01-01 00:00 UTC),
            ip_numeric_high: 0,
            ip_numeric_low: 0x0A00_0001,
        }];
        let value = serde_json::to_string(&cached).unwrap();
        harness
            .cache
            .set("user_ips_1", &value, Duration::from_secs(60))
            .await
            .unwrap();

        // the store is empty, so the result can only come from the cache
        let ips = harness
            .service
            .list_ips_for_user(1, no_cancel())
            .await
            .expect("query");

        assert_eq!(ips, cached);
    }

    #[tokio::test]
    async fn records_login_when_user_lock_times_out() {
        let harness = harness_with(ServiceConfig {
            lock_timeout: Duration::from_millis(20),
            ..ServiceConfig::default()
        });

        let held = harness
            .service
            .locks
            .lock(7, Duration::from_secs(1))
            .await
            .expect("lock acquired");

        let at = datetime!(2024-01-01 00:00 UTC);
        let ack = harness
            .service
            .record_login(7, "10.0.0.1", at)
            .await
            .expect("login recorded");

        assert_eq!(ack.message, "Login recorded successfully");
        assert_eq!(harness.log.len(), 1);
        drop(held);
    }

    #[rstest]
    #[tokio::test]
    async fn populates_cache_after_query(harness: Harness) {
        harness
            .service
            .list_ips_for_user(1, no_cancel())
            .await
            .expect("query");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(harness.cache.contains("user_ips_1"));
    }

    #[rstest]
    #[tokio::test]
    async fn cancels_request(harness: Harness) {
        let (trigger, tripwire): (Trigger, Tripwire) = Tripwire::new();
        trigger.cancel();

        let result = harness.service.list_ips_for_user(1, tripwire).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
