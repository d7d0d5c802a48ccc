//! Module containing components and utilities for telemetry (metrics, tracing, logging).
//!
//! Metrics are exposed in the Prometheus text format by the [`MetricsExporter`], logs are
//! optionally published to Grafana Loki by the [`TracingExporter`].
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use derive_new::new;
use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};
use prometheus_hyper::Server;
use prometheus_metric_storage::{MetricStorage, StorageRegistry};
use tokio::task::JoinHandle;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{info, instrument, warn};
use tracing_loki::BackgroundTask;

use crate::error::Error;

/// Prometheus metrics for pipeline monitoring
#[derive(Debug, Clone, MetricStorage)]
#[metric(subsystem = "pipeline")]
pub struct Metrics {
    /// Total count of Event Log entries by status
    ///
    /// Labels:
    ///  - `status="received"` counts entries handed to the claim-and-apply procedure
    ///  - `status="rejected"` counts undecodable entries which were dropped
    ///  - `status="acked"` counts acknowledged entries (including rejected ones)
    #[metric(labels("status"))]
    pub messages_total: IntCounterVec,

    /// Latency of a single claim-and-apply round in seconds
    pub batch_latency_seconds: Histogram,

    /// Total count of rows written to the store
    pub upserted_total: IntCounter,

    /// Number of batches rejected by the admission gate
    pub overload_total: IntCounter,

    /// Total count of entries claimed from other consumers
    ///
    /// Labels:
    ///  - `trigger="startup"` for the sweep of entries pending at startup
    ///  - `trigger="stale"` for the periodic sweep of abandoned entries
    #[metric(labels("trigger"))]
    pub reclaimed_total: IntCounterVec,
}

impl Metrics {
    /// Publicly exposes `Metrics::instance(registry)` with custom [`Error::Metrics`]
    #[inline]
    pub fn get_or_create(registry: &StorageRegistry) -> Result<&Self> {
        Self::instance(registry).map_err(|e| anyhow!(Error::Metrics(e)))
    }
}

/// Server exporting Prometheus metrics
#[derive(new)]
pub struct MetricsExporter {
    server_port: u16,
    registry: Arc<Registry>,
}

impl MetricsExporter {
    #[instrument(name = "exporter", fields(port = self.server_port), skip_all)]
    pub async fn run(self, subsys: SubsystemHandle) -> Result<()> {
        info!("starting metrics server");
        Server::run(
            self.registry,
            SocketAddr::from(([0; 4], self.server_port)),
            async {
                subsys.on_shutdown_requested().await;
                warn!("shutting down metrics server");
            },
        )
        .await
        .map_err(|e| anyhow!(Error::MetricsExporter(e)))
    }
}

/// Publisher of tracing logs to Grafana Loki.
///
/// Wraps a `tokio` task [handle](tokio::task::JoinHandle) of a spawned
/// [`BackgroundTask`](tracing_loki::BackgroundTask).
pub struct TracingExporter {
    handle: JoinHandle<()>,
}

impl TracingExporter {
    /// Spawns given `task` and stores its handle to abort it during graceful shutdown
    pub fn spawn(task: BackgroundTask) -> Self {
        Self {
            handle: tokio::spawn(task),
        }
    }

    #[instrument(name = "loki", skip_all)]
    pub async fn run(self, subsys: SubsystemHandle) -> Result<()> {
        subsys.on_shutdown_requested().await;

        warn!("shutting down log publisher");
        self.handle.abort();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_pipeline_metrics() {
        let registry = StorageRegistry::new(Registry::new());
        let metrics = Metrics::get_or_create(&registry).expect("metrics");

        metrics
            .messages_total
            .with_label_values(&["received"])
            .inc_by(3);
        metrics.reclaimed_total.with_label_values(&["stale"]).inc();

        let names = registry
            .registry()
            .gather()
            .into_iter()
            .map(|family| family.get_name().to_owned())
            .collect::<Vec<_>>();

        assert!(names.contains(&"pipeline_messages_total".to_owned()));
        assert!(names.contains(&"pipeline_reclaimed_total".to_owned()));

        let again = Metrics::get_or_create(&registry).expect("metrics");
        assert_eq!(
            again.messages_total.with_label_values(&["received"]).get(),
            3
        );
    }
}
