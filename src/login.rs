//! Module with the definition of a [`LoginEvent`], its field representation on the Event Log, the
//! persisted [`LoginRecord`] and the row types returned by the query operations.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Error;
use crate::ip::{self, IpNumeric};

/// Flat string-to-string fields of a single Event Log entry
pub type Fields = BTreeMap<String, String>;

/// A single login fact as it travels through the Event Log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginEvent {
    /// Random id attached by the producer for tracing purposes
    pub record_id: String,
    pub user_id: i64,
    /// Canonical textual form of the address
    pub ip_text: String,
    pub ip: IpNumeric,
    pub login_time: OffsetDateTime,
}

impl LoginEvent {
    /// Create new event with canonicalized address and fresh record id.
    pub fn new(user_id: i64, ip_address: &str, login_time: OffsetDateTime) -> Result<Self, Error> {
        let ip = ip::parse(ip_address)?;
        Ok(Self {
            record_id: Uuid::new_v4().to_string(),
            user_id,
            ip_text: ip.to_string(),
            ip: ip.into(),
            login_time,
        })
    }

    /// Encode this event as Event Log entry fields.
    pub fn to_fields(&self) -> Result<Fields, Error> {
        let timestamp = self
            .login_time
            .format(&Rfc3339)
            .map_err(|e| Error::Poison(format!("unformattable login timestamp: {e}")))?;

        Ok(Fields::from([
            ("userId".to_owned(), self.user_id.to_string()),
            ("ipAddress".to_owned(), self.ip_text.clone()),
            ("loginTimestamp".to_owned(), timestamp),
            ("recordId".to_owned(), self.record_id.clone()),
            ("ipNumericHigh".to_owned(), self.ip.high.to_string()),
            ("ipNumericLow".to_owned(), self.ip.low.to_string()),
        ]))
    }
}

/// Wire form of [`LoginEvent`] fields.
///
/// Entries written by older producers lack the numeric fields and the record id.
#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde_as(as = "DisplayFromStr")]
    user_id: i64,
    ip_address: String,
    #[serde(with = "time::serde::rfc3339")]
    login_timestamp: OffsetDateTime,
    #[serde(default)]
    record_id: Option<String>,
    #[serde(default)]
    ip_numeric_high: Option<String>,
    #[serde(default)]
    ip_numeric_low: Option<String>,
}

fn parse_half(field: &'static str, value: &str) -> Result<i64, Error> {
    value
        .parse()
        .map_err(|e| Error::Poison(format!("invalid '{field}' value '{value}': {e}")))
}

impl TryFrom<&Fields> for LoginEvent {
    type Error = Error;

    fn try_from(fields: &Fields) -> Result<Self, Self::Error> {
        let value = serde_json::to_value(fields).map_err(|e| Error::Poison(e.to_string()))?;
        let wire: WireEvent =
            serde_json::from_value(value).map_err(|e| Error::Poison(e.to_string()))?;

        let (ip_text, ip) = match (&wire.ip_numeric_high, &wire.ip_numeric_low) {
            (Some(high), Some(low)) => {
                let high = parse_half("ipNumericHigh", high)?;
                let low = parse_half("ipNumericLow", low)?;
                (wire.ip_address, IpNumeric::new(high, low))
            }
            // backfill entries from producers which did not encode the address
            _ => {
                let ip = ip::parse(&wire.ip_address).map_err(|e| Error::Poison(e.to_string()))?;
                (ip.to_string(), IpNumeric::from(ip))
            }
        };

        Ok(Self {
            record_id: wire.record_id.unwrap_or_default(),
            user_id: wire.user_id,
            ip_text,
            ip,
            login_time: wire.login_timestamp,
        })
    }
}

/// Persisted row keyed by `(user_id, ip_address)`, holding the latest login from that address
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LoginRecord {
    pub user_id: i64,
    pub ip_address: String,
    pub ip_numeric_high: i64,
    pub ip_numeric_low: i64,
    pub login_timestamp: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl LoginRecord {
    #[inline]
    pub fn ip(&self) -> IpNumeric {
        IpNumeric::new(self.ip_numeric_high, self.ip_numeric_low)
    }
}

impl From<LoginEvent> for LoginRecord {
    fn from(event: LoginEvent) -> Self {
        Self {
            user_id: event.user_id,
            ip_address: event.ip_text,
            ip_numeric_high: event.ip.high,
            ip_numeric_low: event.ip.low,
            login_timestamp: event.login_time,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Single entry of the `ListIPsForUser` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLogin {
    pub ip_address: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_login: OffsetDateTime,
    pub ip_numeric_high: u64,
    pub ip_numeric_low: u64,
}

impl From<LoginRecord> for IpLogin {
    fn from(record: LoginRecord) -> Self {
        let (ip_numeric_high, ip_numeric_low) = record.ip().unsigned();
        Self {
            ip_address: record.ip_address,
            last_login: record.login_timestamp,
            ip_numeric_high,
            ip_numeric_low,
        }
    }
}

/// Single entry of the `ListUsersForIP` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogin {
    pub user_id: i64,
    pub ip_address: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_login: OffsetDateTime,
    pub ip_numeric_high: u64,
    pub ip_numeric_low: u64,
}

impl From<LoginRecord> for UserLogin {
    fn from(record: LoginRecord) -> Self {
        let (ip_numeric_high, ip_numeric_low) = record.ip().unsigned();
        Self {
            user_id: record.user_id,
            ip_address: record.ip_address,
            last_login: record.login_timestamp,
            ip_numeric_high,
            ip_numeric_low,
        }
    }
}

/// Result of the `LastLoginForUser` query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastLogin {
    pub user_id: i64,
    pub found: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_login: Option<OffsetDateTime>,
    pub ip_address: Option<String>,
    pub ip_numeric_high: Option<u64>,
    pub ip_numeric_low: Option<u64>,
}

impl LastLogin {
    pub fn not_found(user_id: i64) -> Self {
        Self {
            user_id,
            found: false,
            last_login: None,
            ip_address: None,
            ip_numeric_high: None,
            ip_numeric_low: None,
        }
    }
}

impl From<LoginRecord> for LastLogin {
    fn from(record: LoginRecord) -> Self {
        let (high, low) = record.ip().unsigned();
        Self {
            user_id: record.user_id,
            found: true,
            last_login: Some(record.login_timestamp),
            ip_address: Some(record.ip_address),
            ip_numeric_high: Some(high),
            ip_numeric_low: Some(low),
        }
    }
}
