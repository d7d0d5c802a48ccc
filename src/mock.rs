//! In-memory implementations of [`EventLog`], [`LoginStore`] and [`Cache`] with the same
//! observable semantics as their Redis and PostgreSQL counterparts, plus failure injection.
//!
//! These are used to exercise the pipeline and the service without external infrastructure.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{ErrorKind as RedisErrorKind, RedisError};

use crate::cache::Cache;
use crate::error::Error;
use crate::event_log::{EntryId, EventLog, LogEntry, PendingEntry, PendingSummary};
use crate::login::{Fields, LoginRecord};
use crate::pattern::IpQuery;
use crate::store::LoginStore;

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unavailable(what: &'static str) -> RedisError {
    RedisError::from((RedisErrorKind::IoError, what))
}

#[derive(Debug)]
struct Delivery {
    consumer: String,
    delivered_at: Instant,
    deliveries: usize,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Delivery>,
}

#[derive(Debug, Default)]
struct LogState {
    last_seq: u64,
    entries: BTreeMap<u64, Fields>,
    groups: HashMap<String, Group>,
}

fn no_group(name: &str) -> Error {
    Error::EventLog(RedisError::from((
        RedisErrorKind::ExtensionError,
        "NOGROUP",
        format!("No such consumer group '{name}'"),
    )))
}

impl LogState {
    fn group(&mut self, name: &str) -> Result<&mut Group, Error> {
        self.groups.get_mut(name).ok_or_else(|| no_group(name))
    }
}

fn format_id(seq: u64) -> EntryId {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Option<u64> {
    id.split_once('-').and_then(|(seq, _)| seq.parse().ok())
}

/// In-memory [`EventLog`] with consumer groups and pending entry tracking
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    state: Mutex<LogState>,
    unavailable: AtomicBool,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (`true`) or succeed again (`false`)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of entries ever appended
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pending entries of a group, zero for unknown groups
    pub fn pending_count(&self, group: &str) -> usize {
        lock(&self.state)
            .groups
            .get(group)
            .map_or(0, |g| g.pending.len())
    }

    fn check(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::EventLog(unavailable("event log unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append_fields(&self, fields: &Fields) -> Result<EntryId, Error> {
        self.check()?;
        let mut state = lock(&self.state);
        state.last_seq += 1;
        let seq = state.last_seq;
        state.entries.insert(seq, fields.clone());
        Ok(format_id(seq))
    }

    async fn ensure_group(&self, group: &str) -> Result<bool, Error> {
        self.check()?;
        let mut state = lock(&self.state);
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        state.groups.insert(group.to_owned(), Group::default());
        Ok(true)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, Error> {
        self.check()?;
        let mut state = lock(&self.state);
        let LogState {
            entries, groups, ..
        } = &mut *state;

        let group = groups.get_mut(group).ok_or_else(|| no_group(group))?;

        let now = Instant::now();
        let read = entries
            .range(group.last_delivered + 1..)
            .take(count)
            .map(|(&seq, fields)| (seq, fields.clone()))
            .collect::<Vec<_>>();

        for (seq, _) in &read {
            group.last_delivered = *seq;
            group.pending.insert(
                *seq,
                Delivery {
                    consumer: consumer.to_owned(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
        }

        Ok(read
            .into_iter()
            .map(|(seq, fields)| LogEntry {
                id: format_id(seq),
                fields,
            })
            .collect())
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize, Error> {
        self.check()?;
        let mut state = lock(&self.state);
        let group = state.group(group)?;
        Ok(ids
            .iter()
            .filter_map(|id| parse_id(id))
            .filter(|seq| group.pending.remove(seq).is_some())
            .count())
    }

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, Error> {
        self.check()?;
        let mut state = lock(&self.state);
        let group = state.group(group)?;

        let mut consumers = BTreeMap::<String, usize>::new();
        for delivery in group.pending.values() {
            *consumers.entry(delivery.consumer.clone()).or_default() += 1;
        }

        Ok(PendingSummary {
            total: group.pending.len(),
            consumers: consumers.into_iter().collect(),
        })
    }

    async fn list_pending(
        &self,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Error> {
        self.check()?;
        let mut state = lock(&self.state);
        let group = state.group(group)?;

        Ok(group
            .pending
            .iter()
            .filter(|(_, d)| consumer.map_or(true, |c| d.consumer == c))
            .take(count)
            .map(|(&seq, d)| PendingEntry {
                id: format_id(seq),
                consumer: d.consumer.clone(),
                idle: d.delivered_at.elapsed(),
                deliveries: d.deliveries,
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
        self.check()?;
        let mut state = lock(&self.state);
        let LogState {
            entries, groups, ..
        } = &mut *state;

        let group = groups.get_mut(group).ok_or_else(|| no_group(group))?;

        let now = Instant::now();
        let mut claimed = Vec::new();

        for seq in ids.iter().filter_map(|id| parse_id(id)) {
            let Some(delivery) = group.pending.get_mut(&seq) else {
                continue;
            };
            if delivery.delivered_at.elapsed() < min_idle {
                continue;
            }
            delivery.consumer = consumer.to_owned();
            delivery.delivered_at = now;
            delivery.deliveries += 1;

            if let Some(fields) = entries.get(&seq) {
                claimed.push(LogEntry {
                    id: format_id(seq),
                    fields: fields.clone(),
                });
            }
        }

        Ok(claimed)
    }
}

/// In-memory [`LoginStore`] which can be instructed to fail upcoming upserts
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(i64, String), LoginRecord>>,
    failures: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` upserts fail with a transient store error
    pub fn fail_next_upserts(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful upsert calls
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn get(&self, user_id: i64, ip_address: &str) -> Option<LoginRecord> {
        lock(&self.records)
            .get(&(user_id, ip_address.to_owned()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LoginStore for MemoryStore {
    async fn upsert(&self, records: &[LoginRecord]) -> Result<u64, Error> {
        if self.take_failure() {
            return Err(Error::Store(sqlx::Error::PoolTimedOut));
        }

        let mut stored = lock(&self.records);
        for record in records {
            stored
                .entry((record.user_id, record.ip_address.clone()))
                .and_modify(|existing| {
                    existing.login_timestamp = record.login_timestamp;
                    existing.ip_numeric_high = record.ip_numeric_high;
                    existing.ip_numeric_low = record.ip_numeric_low;
                })
                .or_insert_with(|| record.clone());
        }

        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(records.len() as u64)
    }

    async fn ips_for_user(&self, user_id: i64) -> Result<Vec<LoginRecord>, Error> {
        let mut records = lock(&self.records)
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| b.login_timestamp.cmp(&a.login_timestamp));
        Ok(records)
    }

    async fn users_for_ip(&self, query: &IpQuery) -> Result<Vec<LoginRecord>, Error> {
        let mut latest = BTreeMap::<i64, LoginRecord>::new();
        for record in lock(&self.records).values() {
            if !query.matches(record.ip()) {
                continue;
            }
            match latest.get(&record.user_id) {
                Some(current) if current.login_timestamp >= record.login_timestamp => {}
                _ => {
                    latest.insert(record.user_id, record.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn last_login(&self, user_id: i64) -> Result<Option<LoginRecord>, Error> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| r.user_id == user_id)
            .max_by_key(|r| r.login_timestamp)
            .cloned())
    }
}

/// In-memory [`Cache`] honoring time-to-live, which can be switched into a failing mode
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries)
            .get(key)
            .map_or(false, |(_, expires)| *expires > Instant::now())
    }

    fn check(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Cache(unavailable("cache unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.check()?;
        let mut entries = lock(&self.entries);
        let value = entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone());
        if value.is_none() {
            entries.remove(key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        self.check()?;
        lock(&self.entries).insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), Error> {
        self.check()?;
        lock(&self.entries).remove(key);
        Ok(())
    }
}
