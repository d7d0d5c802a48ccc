use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::process_collector::ProcessCollector;
use prometheus::Registry;
use prometheus_metric_storage::StorageRegistry;
use tokio_graceful_shutdown::Toplevel;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use login_tracker::config::Config;
use login_tracker::error::{BoxedError, Error};
use login_tracker::event_log::RedisEventLog;
use login_tracker::gate::AdmissionGate;
use login_tracker::sink::BatchSink;
use login_tracker::source::{ConsumerIdentity, StreamSource};
use login_tracker::store::PgLoginStore;
use login_tracker::telemetry::{MetricsExporter, TracingExporter};

#[tokio::main]
async fn main() -> Result<()> {
    // read configuration from env
    let cfg = Config::from_env()?;

    // setup tracing, optionally publishing logs to Loki
    let (loki, exporter) = match &cfg.loki_url {
        Some(url) => {
            let (layer, task) = tracing_loki::builder()
                .label("app", "login-tracker")?
                .label("instance", &cfg.instance)?
                .build_url(url.clone())?;
            (Some(layer), Some(TracingExporter::spawn(task)))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&cfg.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .with(loki)
        .init();

    info!(
        consumers = cfg.num_consumers,
        stream = cfg.stream.key,
        group = cfg.stream.group,
        "starting login tracker"
    );

    // setup metrics
    let registry = Registry::new();
    registry.register(Box::new(ProcessCollector::for_self()))?;
    let registry = Arc::new(registry);
    let storage = StorageRegistry::new(registry.as_ref().clone());

    let identity = ConsumerIdentity::generate(&cfg.instance);
    info!(%identity, "generated consumer identity");

    let log = Arc::new(RedisEventLog::new(&cfg.stream.url, cfg.stream.key.clone())?);
    let store = Arc::new(PgLoginStore::new(&cfg.pg).await?);

    let gate = AdmissionGate::new("store", cfg.pg.gate_permits, cfg.pg.gate_timeout);
    let sink = Arc::new(BatchSink::new(store, gate, cfg.stream.sub_batch_size));

    let source = StreamSource::new(
        cfg.num_consumers,
        cfg.stream,
        cfg.reclaim,
        identity,
        log,
        sink,
        storage,
    );

    let metrics = MetricsExporter::new(cfg.metrics_port, registry);

    let toplevel = Toplevel::<BoxedError>::new()
        .start("StreamSource", |s| source.run(s))
        .start("MetricsExporter", |s| metrics.run(s));

    let toplevel = match exporter {
        Some(exporter) => toplevel.start("TracingExporter", |s| exporter.run(s)),
        None => toplevel,
    };

    toplevel
        .catch_signals()
        .handle_shutdown_requests(Duration::from_secs(cfg.shutdown_timeout))
        .await
        .map_err(Error::from)?;

    Ok(())
}
