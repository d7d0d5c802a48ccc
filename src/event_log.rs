//! Durable, append-only Event Log with consumer groups and its Redis Streams implementation.
//!
//! Each entry has an opaque, totally ordered id. Entries delivered to a consumer of a group stay
//! _pending_ (tracked together with the owning consumer and the idle time since the last delivery)
//! until they are acknowledged. Pending entries can be transferred to another consumer with
//! [`EventLog::claim`], which is the basis of crash recovery.
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client, FromRedisValue};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::error::Error;
use crate::login::{Fields, LoginEvent};

/// Opaque id of an Event Log entry
pub type EntryId = String;

/// Entry as read from the Event Log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    pub fields: Fields,
}

impl From<StreamId> for LogEntry {
    fn from(entry: StreamId) -> Self {
        let fields = entry
            .map
            .iter()
            .filter_map(|(k, v)| String::from_redis_value(v).ok().map(|v| (k.clone(), v)))
            .collect();
        Self {
            id: entry.id,
            fields,
        }
    }
}

/// Entry delivered to a consumer but not acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    /// Time since the last delivery of this entry
    pub idle: Duration,
    pub deliveries: usize,
}

/// Number of pending entries of a group in total and per consumer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub total: usize,
    pub consumers: Vec<(String, usize)>,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append new entry and return its id
    async fn append_fields(&self, fields: &Fields) -> Result<EntryId, Error>;

    /// Append encoded login event and return its id
    async fn append(&self, event: &LoginEvent) -> Result<EntryId, Error> {
        let fields = event.to_fields()?;
        self.append_fields(&fields).await
    }

    /// Create the log and the consumer group if absent.
    ///
    /// Returns `true` if the group has been created by this call.
    async fn ensure_group(&self, group: &str) -> Result<bool, Error>;

    /// Read up to `count` entries never delivered to any consumer of the group.
    ///
    /// Returns immediately (possibly with no entries), read entries become pending for `consumer`.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, Error>;

    /// Acknowledge entries, returns the number of entries which were pending
    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize, Error>;

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, Error>;

    /// List up to `count` pending entries in id order, optionally only these of given `consumer`
    async fn list_pending(
        &self,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Error>;

    /// Transfer ownership of pending entries idle for at least `min_idle` to `consumer`.
    ///
    /// Returns the entries which were actually claimed, with their fields.
    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<LogEntry>, Error>;
}

/// [`EventLog`] backed by a single Redis stream.
///
/// The connection is established lazily on first use and re-established automatically after
/// failures, so that an unavailable server surfaces as an error of the individual operation.
pub struct RedisEventLog {
    client: Client,
    key: String,
    conn: OnceCell<ConnectionManager>,
}

impl RedisEventLog {
    pub fn new(url: &str, key: String) -> Result<Self, Error> {
        Ok(Self {
            client: Client::open(url)?,
            key,
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, Error> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!(key = self.key, "connected to Redis event log");
                Ok::<_, Error>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn append_fields(&self, fields: &Fields) -> Result<EntryId, Error> {
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let id: String = self.conn().await?.xadd(&self.key, "*", items.as_slice()).await?;
        Ok(id)
    }

    #[instrument(skip(self), fields(key = self.key))]
    async fn ensure_group(&self, group: &str) -> Result<bool, Error> {
        let result: redis::RedisResult<()> = self
            .conn()
            .await?
            .xgroup_create_mkstream(&self.key, group, "0")
            .await;

        match result {
            Ok(()) => {
                info!("created consumer group");
                Ok(true)
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("consumer group already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, Error> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let reply: Option<StreamReadReply> = self
            .conn()
            .await?
            .xread_options(&[&self.key], &[">"], &opts)
            .await?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(LogEntry::from)
            .collect())
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize, Error> {
        if ids.is_empty() {
            return Ok(0);
        }
        let acked: usize = self.conn().await?.xack(&self.key, group, ids).await?;
        Ok(acked)
    }

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, Error> {
        let reply: StreamPendingReply = self.conn().await?.xpending(&self.key, group).await?;

        Ok(match reply {
            StreamPendingReply::Empty => PendingSummary::default(),
            StreamPendingReply::Data(data) => PendingSummary {
                total: data.count,
                consumers: data
                    .consumers
                    .into_iter()
                    .map(|c| (c.name, c.pending))
                    .collect(),
            },
        })
    }

    async fn list_pending(
        &self,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Error> {
        let mut conn = self.conn().await?;

        let reply: StreamPendingCountReply = match consumer {
            Some(consumer) => {
                conn.xpending_consumer_count(&self.key, group, "-", "+", count, consumer)
                    .await?
            }
            None => conn.xpending_count(&self.key, group, "-", "+", count).await?,
        };

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                deliveries: p.times_delivered,
            })
            .collect())
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<LogEntry>, Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);

        let reply: StreamClaimReply = self
            .conn()
            .await?
            .xclaim(&self.key, group, consumer, min_idle_ms, ids)
            .await?;

        Ok(reply.ids.into_iter().map(LogEntry::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use redis::Value;

    use super::*;

    #[test]
    fn converts_stream_entries() {
        let entry = StreamId {
            id: "1700000000000-0".to_owned(),
            map: HashMap::from([
                ("userId".to_owned(), Value::Data(b"42".to_vec())),
                ("ipAddress".to_owned(), Value::Data(b"10.0.0.1".to_vec())),
                ("broken".to_owned(), Value::Bulk(vec![])),
            ]),
        };

        let entry = LogEntry::from(entry);

        assert_eq!(entry.id, "1700000000000-0");
        assert_eq!(entry.fields.len(), 2);
        assert_eq!(entry.fields["userId"], "42");
        assert_eq!(entry.fields["ipAddress"], "10.0.0.1");
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(matches!(
            RedisEventLog::new("not a url", "stream".to_owned()),
            Err(Error::EventLog(_))
        ));
    }
}
