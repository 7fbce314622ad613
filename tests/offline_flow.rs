use devicehub_sync::remote::BoxFuture;
use devicehub_sync::{
    ChangeStatus, Collection, ConnectivityState, DataLayer, DataSource, DegradedReason, Device, Entity, HealthProbe,
    MemoryBackend, Notification, Operation, ProbeOutcome, RemoteBackend, RemoteError, RemoteResult, RetryPolicy,
    StorageBackend, SyncSettings, WriteOutcome,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeRemote {
    devices: Mutex<Vec<serde_json::Value>>,
    write_failures: Mutex<VecDeque<RemoteError>>,
    applied: Mutex<Vec<(Operation, serde_json::Value)>>,
    write_calls: AtomicU32,
}

impl FakeRemote {
    fn fail_next_writes(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.write_failures.lock().expect("lock").extend(errors);
    }

    fn applied_names(&self) -> Vec<String> {
        self.applied
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|(_, payload)| payload.get("name").and_then(|name| name.as_str()).map(str::to_string))
            .collect()
    }
}

impl RemoteBackend for FakeRemote {
    fn read_collection(&self, collection: Collection) -> BoxFuture<'_, RemoteResult<Vec<serde_json::Value>>> {
        Box::pin(async move {
            match collection {
                Collection::Devices => Ok(self.devices.lock().expect("lock").clone()),
                _ => Ok(Vec::new()),
            }
        })
    }

    fn write_record(
        &self,
        operation: Operation,
        _entity: Entity,
        payload: serde_json::Value,
    ) -> BoxFuture<'_, RemoteResult<serde_json::Value>> {
        Box::pin(async move {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.write_failures.lock().expect("lock").pop_front() {
                return Err(error);
            }
            self.applied.lock().expect("lock").push((operation, payload.clone()));
            Ok(payload)
        })
    }
}

struct CountingProbe {
    calls: AtomicU32,
}

impl HealthProbe for CountingProbe {
    fn check(&self) -> BoxFuture<'_, ProbeOutcome> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            ProbeOutcome::Healthy {
                latency: Duration::from_millis(20),
            }
        })
    }
}

fn settings() -> SyncSettings {
    SyncSettings {
        retry: RetryPolicy::new(2, 5),
        ..SyncSettings::default()
    }
}

fn device(id: &str, name: &str) -> serde_json::Value {
    json!({ "id": id, "projectId": "proj-1", "name": name })
}

fn build(remote: Arc<FakeRemote>) -> (DataLayer, Arc<CountingProbe>) {
    let probe = Arc::new(CountingProbe {
        calls: AtomicU32::new(0),
    });
    let layer = DataLayer::in_memory(settings(), remote, probe.clone());
    (layer, probe)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn cached_reads_are_stable_while_offline() {
    let remote = Arc::new(FakeRemote::default());
    remote.devices.lock().expect("lock").push(device("d1", "pump"));
    let (layer, _) = build(remote.clone());

    let live = layer.read::<Device>(Collection::Devices).await.expect("live");
    assert_eq!(live.source, DataSource::Live);

    layer.monitor().os_offline();
    remote.devices.lock().expect("lock").push(device("d2", "fan"));
    let first = layer.read::<Device>(Collection::Devices).await.expect("cached");
    let second = layer.read::<Device>(Collection::Devices).await.expect("cached");
    assert_eq!(first, second);
    assert_eq!(first.items.len(), 1);
    assert_eq!(first.source, DataSource::Cache);
}

#[tokio::test]
async fn queued_writes_replay_in_order_after_recovery() {
    let remote = Arc::new(FakeRemote::default());
    let (layer, _) = build(remote.clone());
    layer.start();
    layer.monitor().os_offline();

    for name in ["a", "b", "c"] {
        let outcome = layer
            .write(Operation::Update, Entity::Device, device("d1", name))
            .await
            .expect("queued");
        assert!(matches!(outcome, WriteOutcome::Queued { .. }));
    }
    let pending: Vec<String> = layer
        .queue()
        .list_by_status(Some(ChangeStatus::Pending))
        .iter()
        .filter_map(|change| change.payload["name"].as_str().map(str::to_string))
        .collect();
    assert_eq!(pending, vec!["a", "b", "c"]);

    layer.monitor().os_online().await;
    wait_until(|| layer.queue().is_empty()).await;
    assert_eq!(remote.applied_names(), vec!["a", "b", "c"]);
    layer.stop();
}

#[tokio::test]
async fn drain_keeps_going_past_rejections_and_stops_on_outage() {
    let remote = Arc::new(FakeRemote::default());
    let (layer, _) = build(remote.clone());
    layer.monitor().os_offline();
    for name in ["first", "second", "third", "fourth"] {
        layer
            .write(Operation::Create, Entity::Device, device(name, name))
            .await
            .expect("queued");
    }
    layer.monitor().apply(devicehub_sync::MonitorEvent::OsOnline);

    remote.fail_next_writes([
        RemoteError::from_signals(Some(422), None, "name already taken"),
        RemoteError::from_signals(Some(503), None, "unavailable"),
        RemoteError::from_signals(Some(503), None, "unavailable"),
    ]);
    let report = layer.drain().await;
    assert_eq!(report.failed, 1);
    assert!(report.stopped);
    assert_eq!(report.remaining, 3);

    let errored = layer.queue().list_by_status(Some(ChangeStatus::Error));
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].error_message.as_deref(), Some("name already taken"));

    let report = layer.drain().await;
    assert_eq!(report.completed, 3);
    assert!(!report.stopped);
    assert_eq!(remote.applied_names(), vec!["second", "third", "fourth"]);
    assert_eq!(layer.queue().len(), 1);
}

#[tokio::test]
async fn queue_cap_prefers_completed_entries() {
    let remote = Arc::new(FakeRemote::default());
    let (layer, _) = build(remote);
    layer.monitor().os_offline();

    let mut ids = Vec::new();
    for index in 0..100 {
        match layer
            .write(Operation::Update, Entity::Pin, json!({ "id": format!("pin-{}", index), "value": index }))
            .await
            .expect("queued")
        {
            WriteOutcome::Queued { change_id } => ids.push(change_id),
            WriteOutcome::Applied(_) => panic!("offline writes must queue"),
        }
    }
    for id in ids.iter().take(60) {
        layer.queue().mark_completed(id);
    }
    layer
        .write(Operation::Update, Entity::Pin, json!({ "id": "pin-100", "value": 100 }))
        .await
        .expect("queued");

    assert_eq!(layer.queue().len(), 100);
    assert!(layer.queue().get(&ids[0]).is_none());
    assert!(layer.queue().get(&ids[60]).is_some());
}

#[tokio::test]
async fn rate_limit_degrades_and_recovery_refreshes_once() {
    let remote = Arc::new(FakeRemote::default());
    let (layer, probe) = build(remote.clone());
    let mut receiver = layer.bus().subscribe();

    layer.start();
    wait_until(|| probe.calls.load(Ordering::SeqCst) == 1 && !layer.monitor().probe_in_flight()).await;
    remote.fail_next_writes([
        RemoteError::from_signals(Some(429), None, "too many requests"),
        RemoteError::from_signals(Some(429), None, "too many requests"),
    ]);
    let outcome = layer
        .write(Operation::Update, Entity::Project, json!({ "id": "p1", "name": "renamed" }))
        .await
        .expect("write");
    assert!(matches!(outcome, WriteOutcome::Queued { .. }));

    wait_until(|| layer.state() == ConnectivityState::Degraded(DegradedReason::ResourceExhausted)).await;
    let banner = layer.monitor().banner().expect("banner while degraded");
    assert!(banner.showing_cached);

    wait_until(|| layer.monitor().can_retry()).await;
    layer.monitor().retry_now().await;
    wait_until(|| layer.queue().is_empty()).await;
    assert_eq!(layer.state(), ConnectivityState::Online);
    layer.stop();

    let mut refreshes = 0;
    let mut overloaded = false;
    while let Ok(envelope) = receiver.try_recv() {
        match envelope.notification {
            Notification::RefreshData => refreshes += 1,
            Notification::OperationFailed { title, .. } => overloaded |= title == "Server Overloaded",
            _ => {}
        }
    }
    assert_eq!(refreshes, 1);
    assert!(overloaded);
}

#[tokio::test]
async fn simultaneous_retries_probe_once() {
    let remote = Arc::new(FakeRemote::default());
    let (layer, probe) = build(remote);
    layer.monitor().report_resource_error();

    let monitor = layer.monitor().clone();
    let (left, right) = tokio::join!(monitor.retry_now(), layer.monitor().retry_now());
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert!(left.is_some() != right.is_some());
    assert_eq!(layer.state(), ConnectivityState::Online);
}

#[tokio::test]
async fn rejected_writes_are_attempted_once_and_not_queued() {
    let remote = Arc::new(FakeRemote::default());
    let (layer, _) = build(remote.clone());
    remote.fail_next_writes([RemoteError::from_signals(
        Some(400),
        Some("invalid-argument".to_string()),
        "pin mode must be one of input/output",
    )]);

    let error = layer
        .write(Operation::Update, Entity::Pin, json!({ "id": "pin-1", "mode": "sideways" }))
        .await
        .expect_err("rejected");
    assert!(error.is_fatal());
    assert_eq!(remote.write_calls.load(Ordering::SeqCst), 1);
    assert!(layer.queue().is_empty());
}

#[tokio::test]
async fn quota_pressure_is_relieved_by_evicting_completed_changes() {
    let storage = Arc::new(MemoryBackend::new(1024 * 1024));
    let probe = Arc::new(CountingProbe {
        calls: AtomicU32::new(0),
    });
    let layer = DataLayer::new(settings(), storage.clone(), Arc::new(FakeRemote::default()), probe);
    layer.monitor().os_offline();

    for index in 0..15 {
        layer
            .write(Operation::Create, Entity::Device, device(&format!("d{}", index), "soil moisture sensor by the north greenhouse wall"))
            .await
            .expect("queued");
    }
    let first = layer.queue().list_by_status(None)[0].id.clone();
    layer.queue().mark_completed(&first);

    storage.set_quota(storage.used_bytes().expect("used"));
    assert!(layer.snapshots().store(Collection::Pins, &[json!({ "id": "pin-1" })]));
    assert_eq!(layer.queue().len(), 14);
    assert_eq!(layer.snapshots().get_cached::<serde_json::Value>(Collection::Pins).len(), 1);
}

#[tokio::test]
async fn local_state_survives_reopening_a_sqlite_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("devicehub.sqlite");
    let offline = SyncSettings {
        initially_online: false,
        ..settings()
    };

    {
        let probe = Arc::new(CountingProbe {
            calls: AtomicU32::new(0),
        });
        let layer = DataLayer::open(offline.clone(), &db_path, Arc::new(FakeRemote::default()), probe).expect("open");
        layer
            .write(Operation::Delete, Entity::Device, json!({ "id": "d1" }))
            .await
            .expect("queued");
    }

    let probe = Arc::new(CountingProbe {
        calls: AtomicU32::new(0),
    });
    let layer = DataLayer::open(offline, &db_path, Arc::new(FakeRemote::default()), probe).expect("reopen");
    let pending = layer.queue().list_by_status(Some(ChangeStatus::Pending));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Delete);
}
