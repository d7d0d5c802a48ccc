//! Read-through cache in front of the query operations and its Redis implementation.
//!
//! The cache is strictly an optimization: its failures are logged and swallowed by the service,
//! and stale entries are bounded by the time-to-live and by invalidation on `RecordLogin`.
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;

use crate::error::Error;

/// Cache key of the `ListIPsForUser` result
#[inline]
pub fn user_ips_key(user_id: i64) -> String {
    format!("user_ips_{user_id}")
}

/// Cache key of the `ListUsersForIP` result for a raw (trimmed) pattern
#[inline]
pub fn users_by_ip_key(pattern: &str) -> String {
    format!("users_by_ip_{}", pattern.trim())
}

/// Cache key of the `LastLoginForUser` result
#[inline]
pub fn user_last_login_key(user_id: i64) -> String {
    format!("user_last_login_{user_id}")
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;

    async fn invalidate(&self, key: &str) -> Result<(), Error>;
}

/// [`Cache`] storing serialized values in Redis under an optional key prefix
pub struct RedisCache {
    client: Client,
    prefix: String,
    conn: OnceCell<ConnectionManager>,
}

impl RedisCache {
    pub fn new(url: &str, prefix: String) -> Result<Self, Error> {
        Ok(Self {
            client: Client::open(url).map_err(Error::Cache)?,
            prefix,
            conn: OnceCell::new(),
        })
    }

    #[inline]
    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    async fn conn(&self) -> Result<ConnectionManager, Error> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(Error::Cache)?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.conn()
            .await?
            .get(self.key(key))
            .await
            .map_err(Error::Cache)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let seconds = ttl.as_secs().max(1) as usize;
        self.conn()
            .await?
            .set_ex(self.key(key), value, seconds)
            .await
            .map_err(Error::Cache)
    }

    async fn invalidate(&self, key: &str) -> Result<(), Error> {
        self.conn()
            .await?
            .del(self.key(key))
            .await
            .map_err(Error::Cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_keys() {
        assert_eq!(user_ips_key(42), "user_ips_42");
        assert_eq!(users_by_ip_key(" 192.168 "), "users_by_ip_192.168");
        assert_eq!(user_last_login_key(7), "user_last_login_7");
    }

    #[test]
    fn prefixes_keys() {
        let cache = RedisCache::new("redis://127.0.0.1:6379", "logins:".to_owned())
            .expect("valid url");
        assert_eq!(cache.key("user_ips_1"), "logins:user_ips_1");
    }
}
