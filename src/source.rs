//! This module implements the Event Log source which drives the ingestion pipeline logic.
//!
//! # Claim and apply
//! Both the worker pool and the [`Reclaimer`] hand the entries they obtained to the same
//! [`Pipeline::process`] procedure, which
//!  1. decodes each entry into a [`LoginRecord`], immediately acknowledging undecodable entries so
//!     that they are never redelivered
//!  1. applies the decoded records as one batch via the [`BatchSink`]
//!  1. acknowledges the entries of the batch only if the whole batch has been applied
//!
//! Entries of a failed batch stay pending and are eventually recovered by the [`Reclaimer`].
//!
//! # Worker pool
//! The [`StreamSource`] supervises `num_consumers` workers sharing one consumer group. Each worker
//! polls the Event Log without blocking, backs off when there is nothing to read or when the read
//! or the batch failed, and stops as soon as the shutdown [`Tripwire`] is triggered. If the pool
//! cannot be started (e.g. the consumer group cannot be created) it is restarted after a delay.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use derive_new::new;
use futures::{stream, StreamExt};
use itertools::{Either, Itertools};
use prometheus_metric_storage::StorageRegistry;
use stream_cancel::{StreamExt as _, Tripwire};
use tokio::task::JoinSet;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ReclaimConfig, StreamConfig};
use crate::error::{async_retry, Error};
use crate::event_log::{EntryId, EventLog, LogEntry};
use crate::login::{LoginEvent, LoginRecord};
use crate::reclaim::Reclaimer;
use crate::sink::BatchSink;
use crate::store::LoginStore;
use crate::telemetry::Metrics;

/// Base name of all the consumers of this process, unique per process start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerIdentity(String);

impl ConsumerIdentity {
    /// Generate new identity `consumer-{instance}-{random suffix}`
    pub fn generate(instance: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("consumer-{instance}-{}", &suffix[..8]))
    }

    #[inline]
    pub fn worker(&self, id: usize) -> String {
        format!("{}-{id}", self.0)
    }

    #[inline]
    pub fn reclaimer(&self) -> String {
        format!("{}-reclaimer", self.0)
    }
}

impl fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Claim-and-apply procedure shared by the workers and the reclaimer
pub struct Pipeline<L, S> {
    log: Arc<L>,
    sink: Arc<BatchSink<S>>,
    group: String,
    retries: u64,
    retry_delay: Duration,
    metrics: Metrics,
}

impl<L, S> Pipeline<L, S> {
    pub fn new(log: Arc<L>, sink: Arc<BatchSink<S>>, cfg: &StreamConfig, metrics: Metrics) -> Self {
        Self {
            log,
            sink,
            group: cfg.group.clone(),
            retries: cfg.retries,
            retry_delay: cfg.retry_delay,
            metrics,
        }
    }

    #[inline]
    pub fn log(&self) -> &L {
        &self.log
    }

    #[inline]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[inline]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl<L: EventLog, S: LoginStore> Pipeline<L, S> {
    #[instrument(name = "ack", skip_all, fields(entries = ids.len()))]
    async fn ack(&self, ids: &[EntryId]) -> Result<(), Error> {
        let acked = async_retry(self.retries, self.retry_delay, || {
            self.log.ack(&self.group, ids)
        })
        .await
        .map_err(|e| {
            error!(cause = ?e, tries = self.retries + 1, "failed to acknowledge entries");
            e
        })?;

        if acked < ids.len() {
            debug!(acked, "some entries were no longer pending");
        }

        self.metrics
            .messages_total
            .with_label_values(&["acked"])
            .inc_by(ids.len() as u64);

        Ok(())
    }

    /// Decode, apply and acknowledge given entries, returning the number of applied entries.
    ///
    /// Undecodable entries are acknowledged and dropped. Decoded entries are acknowledged only if
    /// the whole batch has been applied, otherwise they are left pending and the error is
    /// returned.
    #[instrument(name = "process", skip_all, fields(entries = entries.len()))]
    pub async fn process(&self, entries: Vec<LogEntry>) -> Result<usize, Error> {
        if entries.is_empty() {
            return Ok(0);
        }

        let _timer = self.metrics.batch_latency_seconds.start_timer();

        self.metrics
            .messages_total
            .with_label_values(&["received"])
            .inc_by(entries.len() as u64);

        let (valid, poison): (Vec<_>, Vec<_>) =
            entries
                .into_iter()
                .partition_map(|entry| match LoginEvent::try_from(&entry.fields) {
                    Ok(event) => Either::Left((entry.id, LoginRecord::from(event))),
                    Err(e) => {
                        warn!(id = entry.id, cause = %e, "discarding undecodable entry");
                        Either::Right(entry.id)
                    }
                });

        if !poison.is_empty() {
            self.metrics
                .messages_total
                .with_label_values(&["rejected"])
                .inc_by(poison.len() as u64);
            self.ack(&poison).await?;
        }

        if valid.is_empty() {
            return Ok(0);
        }

        let (ids, records): (Vec<_>, Vec<_>) = valid.into_iter().unzip();

        match self.sink.apply(&records).await {
            Ok(rows) => {
                self.metrics.upserted_total.inc_by(rows);
                self.ack(&ids).await?;
                debug!(entries = ids.len(), rows, "batch processed");
                Ok(ids.len())
            }
            Err(e) => {
                if matches!(e, Error::Overload(_)) {
                    self.metrics.overload_total.inc();
                }
                warn!(cause = %e, pending = ids.len(), "batch not applied, leaving entries pending");
                Err(e)
            }
        }
    }
}

/// Single worker of the pool reading new entries under its own consumer name
#[derive(new)]
struct LogConsumer<L, S> {
    consumer: String,
    cfg: StreamConfig,
    pipeline: Arc<Pipeline<L, S>>,
    tripwire: Tripwire,
}

impl<L: EventLog, S: LoginStore> LogConsumer<L, S> {
    async fn handle(&self, read: Result<Vec<LogEntry>, Error>) {
        match read {
            Ok(entries) if entries.is_empty() => tokio::time::sleep(self.cfg.idle_backoff).await,
            Ok(entries) => {
                if let Err(e) = self.pipeline.process(entries).await {
                    error!(cause = %e, "batch processing failed");
                    tokio::time::sleep(self.cfg.error_backoff).await;
                }
            }
            Err(e) => {
                warn!(cause = %e, "failed to read from the event log");
                tokio::time::sleep(self.cfg.error_backoff).await;
            }
        }
    }

    /// Run the read-process loop until the tripwire is triggered.
    #[instrument(name = "consumer", fields(consumer = self.consumer), skip_all)]
    async fn run(self) {
        info!("starting event log processing");

        let reads = stream::unfold(&self, |this| async move {
            let read = this
                .pipeline
                .log()
                .read_group(this.pipeline.group(), &this.consumer, this.cfg.read_count)
                .await;
            Some((read, this))
        })
        .take_until_if(self.tripwire.clone());

        let this = &self;
        reads.for_each(|read| this.handle(read)).await;

        warn!("event log processing terminated");
    }
}

/// Top-level pipeline subsystem compositor and driver
#[derive(new)]
pub struct StreamSource<L, S> {
    num_consumers: usize,
    stream: StreamConfig,
    reclaim: ReclaimConfig,
    identity: ConsumerIdentity,
    log: Arc<L>,
    sink: Arc<BatchSink<S>>,
    registry: StorageRegistry,
}

impl<L, S> StreamSource<L, S>
where
    L: EventLog + 'static,
    S: LoginStore + 'static,
{
    #[instrument(name = "source", fields(group = self.stream.group), skip_all)]
    pub async fn run(self, subsys: SubsystemHandle) -> Result<()> {
        // NOTE: when `exit` is dropped, all workers and the reclaimer are interrupted
        let (exit, tripwire) = Tripwire::new();

        let run = self.run_until(tripwire);
        tokio::pin!(run);

        // a failed pool must not wait for a shutdown request
        tokio::select! {
            result = &mut run => return result,
            _ = subsys.on_shutdown_requested() => {
                warn!("shutting down stream processing");
            }
        }

        drop(exit);
        run.await
    }

    /// Run the worker pool and the reclaimer until the `tripwire` is triggered, restarting them
    /// after failures.
    pub async fn run_until(self, tripwire: Tripwire) -> Result<()> {
        let metrics = Metrics::get_or_create(&self.registry)?.clone();

        let pipeline = Arc::new(Pipeline::new(
            self.log.clone(),
            self.sink.clone(),
            &self.stream,
            metrics,
        ));

        info!(
            identity = %self.identity,
            workers = self.num_consumers,
            "starting stream processing"
        );

        loop {
            match self.run_pool(&pipeline, &tripwire).await {
                Ok(()) => return Ok(()),
                Err(e) => error!(
                    cause = ?e,
                    delay = ?self.stream.restart_delay,
                    "stream processing failed, restarting"
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.stream.restart_delay) => {}
                true = tripwire.clone() => return Ok(()),
            }
        }
    }

    async fn run_pool(&self, pipeline: &Arc<Pipeline<L, S>>, tripwire: &Tripwire) -> Result<()> {
        let group = &self.stream.group;

        async_retry(self.stream.retries, self.stream.retry_delay, || {
            self.log.ensure_group(group)
        })
        .await?;

        // taken before the workers start so that only entries of previous runs are swept
        let pending = self.log.pending_summary(group).await?;

        let reclaimer = Reclaimer::new(
            pipeline.clone(),
            self.reclaim.clone(),
            self.identity.reclaimer(),
            tripwire.clone(),
        );

        let mut tasks = JoinSet::new();

        if pending.total > 0 {
            tasks.spawn(reclaimer.clone().sweep_pending(pending));
        }

        for id in 0..self.num_consumers {
            let consumer = LogConsumer::new(
                self.identity.worker(id),
                self.stream.clone(),
                pipeline.clone(),
                tripwire.clone(),
            );
            tasks.spawn(consumer.run());
        }

        tasks.spawn(reclaimer.sweep_stale());

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(cause = ?e, "stream task failed, stopping the pool");
                tasks.shutdown().await;
                return Err(anyhow!(e));
            }
        }

        Ok(())
    }
}
