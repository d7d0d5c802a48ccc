//! Persistent store of [`LoginRecord`]s and its PostgreSQL implementation.
//!
//! # Schema
//! Records are keyed by `(user_id, ip_address)` and carry the numeric form of the address, so
//! that prefix queries ([`IpQuery`]) translate into a masked comparison over an index on
//! `(ip_numeric_high, ip_numeric_low)`.
use std::time::Duration;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use config::ConfigError;
use itertools::Itertools;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

use crate::config::StoreConfig;
use crate::error::{async_retry, Error};
use crate::login::LoginRecord;
use crate::pattern::IpQuery;

#[async_trait]
pub trait LoginStore: Send + Sync {
    /// Insert or update all `records` keyed by `(user_id, ip_address)` in a single atomic write.
    ///
    /// Later records in the slice win over earlier ones with the same key. Returns the number of
    /// rows written.
    async fn upsert(&self, records: &[LoginRecord]) -> Result<u64, Error>;

    /// All records of a user, most recent login first
    async fn ips_for_user(&self, user_id: i64) -> Result<Vec<LoginRecord>, Error>;

    /// The most recent record of each user whose address is selected by the `query`, ordered by
    /// user id
    async fn users_for_ip(&self, query: &IpQuery) -> Result<Vec<LoginRecord>, Error>;

    /// The most recent record of a user
    async fn last_login(&self, user_id: i64) -> Result<Option<LoginRecord>, Error>;
}

/// Keep only the last occurrence of each `(user_id, ip_address)` key, preserving order.
pub fn dedup_last(records: &[LoginRecord]) -> Vec<&LoginRecord> {
    let mut latest = records
        .iter()
        .rev()
        .unique_by(|r| (r.user_id, r.ip_address.as_str()))
        .collect_vec();
    latest.reverse();
    latest
}

const COLUMNS: &str =
    "user_id, ip_address, ip_numeric_high, ip_numeric_low, login_timestamp, created_at";

/// Whether `name` is a plain SQL identifier which can be interpolated into queries unquoted
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let head = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    head && name.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// PostgreSQL truncates longer identifiers (`NAMEDATALEN - 1`)
const MAX_IDENTIFIER_LEN: usize = 63;

fn table_ddl(table: &str) -> [String; 3] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                user_id BIGINT NOT NULL,
                ip_address VARCHAR(45) NOT NULL,
                ip_numeric_high BIGINT NOT NULL DEFAULT 0,
                ip_numeric_low BIGINT NOT NULL DEFAULT 0,
                login_timestamp TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (user_id, ip_address)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS {table}_ip_address_idx ON {table} (ip_address)"),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_ip_numeric_idx \
             ON {table} (ip_numeric_high, ip_numeric_low)"
        ),
    ]
}

/// `WHERE` clause selecting addresses of given `query` with its `BIGINT` parameters
fn ip_predicate(query: &IpQuery) -> (&'static str, Vec<i64>) {
    let (high, low) = (query.pattern.high, query.pattern.low);
    if query.exact {
        ("ip_numeric_high = $1 AND ip_numeric_low = $2", vec![high, low])
    } else {
        let (high_mask, low_mask) = query.mask().signed();
        (
            "(ip_numeric_high & $1) = $2 AND (ip_numeric_low & $3) = $4",
            vec![high_mask, high, low_mask, low],
        )
    }
}

/// [`LoginStore`] backed by a PostgreSQL table
pub struct PgLoginStore {
    pool: PgPool,
    table: String,
}

impl PgLoginStore {
    /// Create new store with a lazily connected pool and (re)create the table if configured to.
    #[instrument(name = "store", skip_all, fields(table = cfg.table))]
    pub async fn new(cfg: &StoreConfig) -> AnyResult<Self> {
        // the table name is interpolated into every statement
        if !is_identifier(&cfg.table) {
            let msg = format!("invalid table name '{}'", cfg.table);
            return Err(anyhow!(Error::Config(ConfigError::Message(msg))));
        }

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect_lazy(&cfg.url)
            .map_err(|e| anyhow!(Error::Store(e)))?;

        let store = Self {
            pool,
            table: cfg.table.clone(),
        };

        if cfg.create_table {
            async_retry(cfg.retries, Duration::from_secs(1), || store.make_table()).await?;
        }

        info!("login store ready");
        Ok(store)
    }

    #[instrument(skip(self))]
    async fn make_table(&self) -> Result<(), Error> {
        for query in table_ddl(&self.table) {
            sqlx::query(&query).execute(&self.pool).await?;
        }
        info!("table and indexes created");
        Ok(())
    }
}

#[async_trait]
impl LoginStore for PgLoginStore {
    #[instrument(skip_all, fields(records = records.len()))]
    async fn upsert(&self, records: &[LoginRecord]) -> Result<u64, Error> {
        let records = dedup_last(records);
        if records.is_empty() {
            return Ok(0);
        }

        let mut query =
            QueryBuilder::<Postgres>::new(format!("INSERT INTO {} ({COLUMNS}) ", self.table));

        query.push_values(records, |mut row, record| {
            row.push_bind(record.user_id)
                .push_bind(record.ip_address.clone())
                .push_bind(record.ip_numeric_high)
                .push_bind(record.ip_numeric_low)
                .push_bind(record.login_timestamp)
                .push_bind(record.created_at);
        });

        query.push(
            " ON CONFLICT (user_id, ip_address) DO UPDATE SET \
             login_timestamp = EXCLUDED.login_timestamp, \
             ip_numeric_high = EXCLUDED.ip_numeric_high, \
             ip_numeric_low = EXCLUDED.ip_numeric_low",
        );

        let result = query.build().execute(&self.pool).await?;
        debug!(rows = result.rows_affected(), "upserted login records");

        Ok(result.rows_affected())
    }

    async fn ips_for_user(&self, user_id: i64) -> Result<Vec<LoginRecord>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE user_id = $1 ORDER BY login_timestamp DESC",
            self.table
        );

        let records = sqlx::query_as::<_, LoginRecord>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    #[instrument(skip_all, fields(query = %query))]
    async fn users_for_ip(&self, query: &IpQuery) -> Result<Vec<LoginRecord>, Error> {
        let (predicate, params) = ip_predicate(query);

        let sql = format!(
            "SELECT DISTINCT ON (user_id) {COLUMNS} FROM {} WHERE {predicate} \
             ORDER BY user_id, login_timestamp DESC",
            self.table
        );

        let records = params
            .into_iter()
            .fold(sqlx::query_as::<_, LoginRecord>(&sql), |q, param| q.bind(param))
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn last_login(&self, user_id: i64) -> Result<Option<LoginRecord>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE user_id = $1 ORDER BY login_timestamp DESC LIMIT 1",
            self.table
        );

        let record = sqlx::query_as::<_, LoginRecord>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }
}
