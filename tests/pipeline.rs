use std::sync::Arc;
use std::time::Duration;

use maplit::btreemap;
use prometheus::Registry;
use prometheus_metric_storage::StorageRegistry;
use stream_cancel::{Trigger, Tripwire};
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use login_tracker::config::{ReclaimConfig, ServiceConfig, StreamConfig};
use login_tracker::error::Error;
use login_tracker::event_log::EventLog;
use login_tracker::gate::AdmissionGate;
use login_tracker::login::LoginEvent;
use login_tracker::mock::{MemoryCache, MemoryEventLog, MemoryStore};
use login_tracker::service::LoginService;
use login_tracker::sink::BatchSink;
use login_tracker::source::{ConsumerIdentity, StreamSource};

const GROUP: &str = "login-processors";

struct Pipeline {
    log: Arc<MemoryEventLog>,
    store: Arc<MemoryStore>,
    gate: AdmissionGate,
    service: LoginService<MemoryEventLog, MemoryStore, MemoryCache>,
    exit: Option<Trigger>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Pipeline {
    fn new() -> Self {
        let log = Arc::new(MemoryEventLog::new());
        let store = Arc::new(MemoryStore::new());
        let gate = AdmissionGate::new("store", 1, Duration::from_millis(20));
        let service = LoginService::new(
            log.clone(),
            store.clone(),
            Arc::new(MemoryCache::new()),
            ServiceConfig::default(),
        );
        Self {
            log,
            store,
            gate,
            service,
            exit: None,
            handle: None,
        }
    }

    fn start(&mut self, num_consumers: usize) {
        let stream = StreamConfig {
            read_count: 10,
            sub_batch_size: 4,
            idle_backoff: Duration::from_millis(5),
            error_backoff: Duration::from_millis(10),
            retry_delay: Duration::from_millis(1),
            restart_delay: Duration::from_millis(10),
            ..StreamConfig::default()
        };

        let reclaim = ReclaimConfig {
            interval: Duration::from_millis(20),
            stale_after: Duration::from_millis(50),
            page_size: 2,
            page_delay: Duration::from_millis(1),
        };

        let sink = Arc::new(BatchSink::new(
            self.store.clone(),
            self.gate.clone(),
            stream.sub_batch_size,
        ));

        let source = StreamSource::new(
            num_consumers,
            stream,
            reclaim,
            ConsumerIdentity::generate("test"),
            self.log.clone(),
            sink,
            StorageRegistry::new(Registry::new()),
        );

        let (exit, tripwire) = Tripwire::new();
        self.exit = Some(exit);
        self.handle = Some(tokio::spawn(source.run_until(tripwire)));
    }

    async fn stop(mut self) {
        drop(self.exit.take());
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("pipeline stopped in time")
                .expect("pipeline task")
                .expect("pipeline result");
        }
    }

    async fn record(&self, user_id: i64, ip: &str, at: OffsetDateTime) {
        self.service
            .record_login(user_id, ip, at)
            .await
            .expect("login recorded");
    }
}

fn no_cancel() -> Tripwire {
    let (trigger, tripwire) = Tripwire::new();
    trigger.disable();
    tripwire
}

/// Poll `check` until it holds, failing the test after a while.
async fn eventually<F>(check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn repeated_login_keeps_latest_timestamp() {
    let mut p = Pipeline::new();
    p.start(1);

    let t1 = datetime!(2024-01-01 10:00 UTC);
    let t2 = datetime!(2024-01-01 11:00 UTC);
    p.record(1, "192.168.1.10", t1).await;
    p.record(1, "192.168.1.10", t2).await;

    eventually(|| p.log.pending_count(GROUP) == 0 && p.store.upserts() > 0).await;
    eventually(|| {
        p.store
            .get(1, "192.168.1.10")
            .map_or(false, |r| r.login_timestamp == t2)
    })
    .await;

    let ips = p
        .service
        .list_ips_for_user(1, no_cancel())
        .await
        .expect("query");

    assert_eq!(ips.len(), 1);
    assert_eq!(ips[0].ip_address, "192.168.1.10");
    assert_eq!(ips[0].last_login, t2);

    p.stop().await;
}

#[tokio::test]
async fn prefix_query_spans_users() {
    let mut p = Pipeline::new();
    p.start(2);

    let at = datetime!(2024-03-01 08:00 UTC);
    p.record(1, "192.168.1.10", at).await;
    p.record(2, "192.168.2.20", at).await;
    p.record(3, "10.0.0.1", at).await;
    p.record(4, "2001:db8::1", at).await;

    eventually(|| p.store.len() == 4).await;

    let users = p
        .service
        .list_users_for_ip("192.168", no_cancel())
        .await
        .expect("query");

    let ids = users.iter().map(|u| u.user_id).collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2]);

    let users = p
        .service
        .list_users_for_ip("2001:db8", no_cancel())
        .await
        .expect("query");

    assert_eq!(users.len(), 1);
    assert_eq!(users[0].ip_address, "2001:db8::1");

    let last = p
        .service
        .last_login_for_user(3, no_cancel())
        .await
        .expect("query");

    assert!(last.found);
    assert_eq!(last.ip_address.as_deref(), Some("10.0.0.1"));

    p.stop().await;
}

#[tokio::test]
async fn invalid_address_is_never_appended() {
    let p = Pipeline::new();

    let result = p
        .service
        .record_login(1, "999.1.1.1", datetime!(2024-01-01 00:00 UTC))
        .await;

    assert!(matches!(result, Err(Error::InvalidAddress(_))));
    assert!(p.log.is_empty());
}

#[tokio::test]
async fn poison_entries_are_acknowledged() {
    let mut p = Pipeline::new();
    p.start(1);

    p.log
        .append_fields(&btreemap! {
            "userId".to_owned() => "not-a-number".to_owned(),
            "ipAddress".to_owned() => "10.0.0.1".to_owned(),
        })
        .await
        .expect("appended");
    p.record(5, "10.0.0.5", datetime!(2024-01-01 00:00 UTC)).await;

    eventually(|| p.store.len() == 1 && p.log.pending_count(GROUP) == 0).await;

    p.stop().await;
}

#[tokio::test]
async fn startup_sweep_recovers_entries_of_dead_consumers() {
    let mut p = Pipeline::new();
    p.log.ensure_group(GROUP).await.expect("group");

    for user_id in 1..=5 {
        let event = LoginEvent::new(user_id, "10.1.1.1", datetime!(2024-01-01 00:00 UTC))
            .expect("valid event");
        p.log.append(&event).await.expect("appended");
    }

    p.log
        .read_group(GROUP, "consumer-gone-0", 10)
        .await
        .expect("read");
    assert_eq!(p.log.pending_count(GROUP), 5);

    p.start(1);

    eventually(|| p.store.len() == 5 && p.log.pending_count(GROUP) == 0).await;

    p.stop().await;
}

#[tokio::test]
async fn stale_entries_are_reclaimed_after_store_failure() {
    let mut p = Pipeline::new();
    p.store.fail_next_upserts(1);
    p.start(1);

    p.record(7, "172.16.0.7", datetime!(2024-05-01 12:00 UTC)).await;

    eventually(|| p.store.len() == 1 && p.log.pending_count(GROUP) == 0).await;

    p.stop().await;
}

#[tokio::test]
async fn overloaded_batches_stay_pending_until_recovered() {
    let mut p = Pipeline::new();
    let held = p.gate.acquire().await.expect("permit");
    p.start(2);

    p.record(8, "172.16.0.8", datetime!(2024-05-01 12:00 UTC)).await;

    eventually(|| p.log.pending_count(GROUP) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(p.store.is_empty());
    assert_eq!(p.log.pending_count(GROUP), 1);

    drop(held);

    eventually(|| p.store.len() == 1 && p.log.pending_count(GROUP) == 0).await;

    p.stop().await;
}

#[tokio::test]
async fn reprocessing_is_idempotent() {
    let p = Pipeline::new();
    let at = datetime!(2024-02-02 02:02 UTC);
    let event = LoginEvent::new(9, "10.9.9.9", at).expect("valid event");

    let sink = BatchSink::new(p.store.clone(), p.gate.clone(), 10);
    let record = login_tracker::login::LoginRecord::from(event);

    for _ in 0..3 {
        sink.apply(std::slice::from_ref(&record))
            .await
            .expect("applied");
    }

    assert_eq!(p.store.len(), 1);
    let stored = p.store.get(9, "10.9.9.9").expect("stored");
    assert_eq!(stored.login_timestamp, at);
    assert_eq!(stored.created_at, record.created_at);
}
