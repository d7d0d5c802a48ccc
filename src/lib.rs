//! # Login Tracker
//! This crate forms the building blocks of a user login tracking system running on [Tokio
//! runtime](https://tokio.rs/). Logins are durably appended to a [Redis
//! Stream](https://redis.io/docs/data-types/streams/) (the _Event Log_), consumed by a pool of
//! workers sharing one consumer group and upserted into a [PostgreSQL](https://www.postgresql.org/)
//! table keyed by `(user_id, ip_address)`.
//!
//! Each address is additionally stored as a 128-bit number split into two signed 64-bit halves
//! (see [`ip`]) so that queries by a partial address (e.g. `192.168` or `2001:db8`) are answered
//! by a bitmask comparison instead of string matching (see [`pattern`]).
//!
//! ## Architecture
//! The system is split into a write path and a read path:
//!  - The [`LoginService`](service::LoginService) validates a login, appends it to the
//!    [`EventLog`](event_log::EventLog) and acknowledges the caller. Persistence happens
//!    asynchronously.
//!  - The [`StreamSource`](source::StreamSource) runs `NUM_CONSUMERS` workers which read new
//!    entries, decode them into [`LoginRecord`](login::LoginRecord)s and hand them to the
//!    [`BatchSink`](sink::BatchSink), which upserts them behind an
//!    [`AdmissionGate`](gate::AdmissionGate).
//!  - The [`Reclaimer`](reclaim::Reclaimer) recovers entries which were delivered but never
//!    acknowledged, once at startup and then periodically for stale ones.
//!  - Queries of the [`LoginService`](service::LoginService) read through a
//!    [`Cache`](cache::Cache) and reach the [`LoginStore`](store::LoginStore) behind their own
//!    admission gate.
//!
//! ## Delivery Semantics
//! The pipeline achieves _at-least-once_ delivery:
//!  1. A `RecordLogin` request is acknowledged only after the entry has been appended to the
//!     stream.
//!  1. A worker acknowledges entries of a batch only after the whole batch has been upserted.
//!     Entries of a failed (or rejected) batch stay pending in the consumer group.
//!  1. Pending entries are eventually claimed and reprocessed by the reclaimer.
//!
//! Since the upsert is keyed by `(user_id, ip_address)` and only updates the login timestamp and
//! the numeric address, reprocessing an entry any number of times yields the same final row. The
//! observable result is therefore _effectively-once_ per key.
//!
//! ### Undecodable entries
//! Entries which cannot be decoded into a login event (missing or malformed fields, invalid
//! address) are logged and acknowledged immediately. Leaving them pending would only make them
//! cycle through the reclaimer forever.
//!
//! ## Scalability
//!  - __vertical__: `NUM_CONSUMERS` workers run as Tokio tasks inside a single process, all
//!    sharing the store admission gate
//!  - __horizontal__: any number of replicas can join the same `STREAM__GROUP`. Each process
//!    generates a unique consumer identity at startup.
//!
//! ## Dependencies
//! Notable dependencies of the pipeline:
//!  - [Tokio async runtime](https://tokio.rs/)
//!  - [`redis`](https://crates.io/crates/redis) for the Event Log and the read-through cache
//!  - [`sqlx`](https://crates.io/crates/sqlx) for the PostgreSQL store
//!  - [`Hyper`-based exporter of Prometheus metrics](https://crates.io/crates/prometheus-hyper)
//!
//! And to make the implementation more sane this crate also depends on:
//!  - [`config`](https://crates.io/crates/config) for env-based configuration
//!  - [`thiserror`](https://crates.io/crates/thiserror) and
//!    [`anyhow`](https://crates.io/crates/anyhow) for error handling and propagation
//!  - [Tokio `tracing`](https://github.com/tokio-rs/tracing) for tracing (and logging) in async
//!    contexts
//!  - [`tracing-loki`](https://crates.io/crates/tracing-loki) for publishing `tracing` logs to
//!    Grafana Loki
//!  - [Tokio graceful shutdown](https://crates.io/crates/tokio-graceful-shutdown) for
//!    orchestrating the application
//!  - [`stream-cancel`](https://crates.io/crates/stream-cancel) for stream interruption and
//!    request cancellation
//!
//! ## Known issues & limitations
//!  - The startup sweep claims every entry pending at the time the pool starts, including
//!    entries currently in-flight at live replicas. These are then processed twice, which is
//!    harmless thanks to the idempotent upsert but wastes work.
//!  - The IPv4 address `0.0.0.1` and the IPv6 address `::1` share the same numeric value. Exact
//!    lookups compare the numeric columns, so they may return both.
//!  - Cache invalidation after `RecordLogin` runs before the event is persisted, so a query issued
//!    in between may cache a stale result until the TTL expires. Cached pattern queries other
//!    than the exact address are not invalidated at all.
//!  - The per-user lock of `RecordLogin` only serializes requests within a single process.
//!
pub mod cache;
pub mod config;
pub mod error;
pub mod event_log;
pub mod gate;
pub mod ip;
pub mod locks;
pub mod login;
pub mod mock;
pub mod pattern;
pub mod reclaim;
pub mod service;
pub mod sink;
pub mod source;
pub mod store;
pub mod telemetry;
