use super::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize};

use serde_json::json;
use tempfile::TempDir;

use crate::models::{EntityKind, Routine, RoutineExercise, WorkoutSet};
use crate::network::ManualNetworkMonitor;
use crate::queue::Operation;
use crate::remote::Method;
use crate::store::test_support::temp_store;

#[derive(Debug, Clone, PartialEq)]
struct Call {
    endpoint: String,
    method: Method,
    body: Option<Value>,
}

/// In-process stand-in for the server: assigns numeric ids to creates and
/// replays scripted failures first.
#[derive(Clone, Default)]
struct FakeRemote {
    calls: Arc<Mutex<Vec<Call>>>,
    failures: Arc<Mutex<VecDeque<RemoteError>>>,
    rejected_prefix: Arc<Mutex<Option<String>>>,
    next_id: Arc<AtomicU64>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeRemote {
    fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(100)),
            ..Self::default()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn fail_next(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    fn reject(&self, endpoint_prefix: &str) {
        *self.rejected_prefix.lock().unwrap() = Some(endpoint_prefix.to_string());
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl RemoteClient for FakeRemote {
    async fn send(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.calls.lock().unwrap().push(Call {
            endpoint: endpoint.to_string(),
            method,
            body: body.cloned(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let rejected = self.rejected_prefix.lock().unwrap().clone();
        if let Some(prefix) = rejected {
            if endpoint.starts_with(&prefix) {
                return Err(RemoteError::from_status(422, "invalid entity"));
            }
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        match method {
            Method::Post => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut created = body.cloned().unwrap_or_else(|| json!({}));
                created["id"] = json!(id.to_string());
                Ok(created)
            }
            Method::Put => Ok(body.cloned().unwrap_or(Value::Null)),
            Method::Delete => Ok(Value::Null),
        }
    }
}

fn transient() -> RemoteError {
    RemoteError::Transient("connection refused".to_string())
}

struct Harness {
    engine: SyncEngine<FakeRemote, ManualNetworkMonitor>,
    remote: FakeRemote,
    network: ManualNetworkMonitor,
    store: LocalStore,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self::with_remote(FakeRemote::new()).await
    }

    async fn with_remote(remote: FakeRemote) -> Self {
        let (store, dir) = temp_store().await;
        let network = ManualNetworkMonitor::default();
        let engine = SyncEngine::new(
            store.clone(),
            remote.clone(),
            network.clone(),
            SyncSettings::default(),
        );
        Self {
            engine,
            remote,
            network,
            store,
            _dir: dir,
        }
    }

    async fn record(&self, operation: Operation) -> QueuedOperation {
        self.engine.queue().record(operation).await.unwrap()
    }

    async fn pending(&self) -> u64 {
        self.engine.queue().len().await.unwrap()
    }
}

#[tokio::test]
async fn test_empty_queue_makes_no_calls() {
    let h = Harness::new().await;

    let report = h.engine.drain().await;

    assert_eq!(report, DrainReport::default());
    assert!(h.remote.calls().is_empty());
    assert!(h.engine.status().last_sync_at.is_some());
}

#[tokio::test]
async fn test_offline_drain_is_noop() {
    let h = Harness::new().await;
    h.network.set_online(false);
    h.record(Operation::create(Routine::new("Leg Day"))).await;

    let report = h.engine.drain().await;

    assert_eq!(report, DrainReport::default());
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.pending().await, 1);
    assert!(h.engine.status().last_sync_at.is_none());
}

#[tokio::test]
async fn test_leg_day_round_trip() {
    let h = Harness::new().await;
    h.network.set_online(false);

    let routine = Routine::new("Leg Day");
    let local_id = routine.id.clone();
    h.record(Operation::create(routine)).await;
    assert_eq!(h.pending().await, 1);

    h.network.set_online(true);
    let report = h.engine.drain().await;

    assert_eq!(report.success, 1);
    assert_eq!(h.pending().await, 0);

    let calls = h.remote.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].endpoint, "/routines");
    assert_eq!(calls[0].method, Method::Post);
    assert_eq!(calls[0].body.as_ref().unwrap()["title"], "Leg Day");

    let server_id = h.engine.mapper().lookup(&local_id).await.unwrap().unwrap();
    assert_eq!(server_id, "100");
    let stored = h.store.get(EntityKind::Routine, &server_id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert!(h.store.get(EntityKind::Routine, &local_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_no_local_id_survives_drain() {
    let h = Harness::new().await;
    let routine = Routine::new("Push");
    let exercise = RoutineExercise::new(&routine.id, "Bench");
    let set = WorkoutSet::new(&exercise.id, 8).with_weight_kg(60.0);
    h.record(Operation::create(routine)).await;
    h.record(Operation::create(exercise)).await;
    h.record(Operation::create(set)).await;

    let report = h.engine.drain().await;
    assert_eq!(report.success, 3);

    for table in ["routines", "routine_exercises", "workout_sets", "sync_queue"] {
        let rows = h
            .store
            .read(
                &format!("SELECT * FROM {} WHERE instr(id, 'local_') > 0", table),
                &[],
            )
            .await
            .unwrap();
        assert!(rows.is_empty(), "{} still has local ids", table);
    }

    let calls = h.remote.calls();
    assert_eq!(calls[1].body.as_ref().unwrap()["routine_id"], "100");
    assert_eq!(calls[2].body.as_ref().unwrap()["routine_exercise_id"], "101");

    let sets = h
        .store
        .query(&crate::store::EntityFilter::kind(EntityKind::WorkoutSet))
        .await
        .unwrap();
    assert_eq!(sets[0].entity.references(), vec!["101"]);
    assert_eq!(sets[0].entity.id(), "102");
}

#[tokio::test]
async fn test_update_waits_for_failed_create() {
    let h = Harness::new().await;
    let mut routine = Routine::new("Leg Day");
    h.record(Operation::create(routine.clone())).await;
    routine.title = "Legs".to_string();
    h.record(Operation::update(routine)).await;

    h.remote.fail_next([transient()]);
    let first = h.engine.drain().await;
    assert_eq!(
        first,
        DrainReport {
            success: 0,
            failed: 1,
            deferred: 1
        }
    );
    assert_eq!(h.remote.calls().len(), 1);

    let second = h.engine.drain().await;
    assert_eq!(second.success, 2);

    let calls = h.remote.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].endpoint, "/routines/100");
    assert_eq!(calls[2].method, Method::Put);
    assert_eq!(calls[2].body.as_ref().unwrap()["title"], "Legs");
    assert_eq!(calls[2].body.as_ref().unwrap()["id"], "100");
}

#[tokio::test]
async fn test_child_deferred_until_parent_created() {
    let h = Harness::new().await;
    let routine = Routine::new("Pull");
    let exercise = RoutineExercise::new(&routine.id, "Row");
    h.record(Operation::create(routine)).await;
    h.record(Operation::create(exercise)).await;

    h.remote.fail_next([transient()]);
    let first = h.engine.drain().await;
    assert_eq!(first.failed, 1);
    assert_eq!(first.deferred, 1);

    let second = h.engine.drain().await;
    assert_eq!(second.success, 2);
    assert_eq!(h.pending().await, 0);
}

#[tokio::test]
async fn test_max_retries_evicts_once() {
    let h = Harness::new().await;
    let queued = h
        .record(Operation::delete(EntityKind::Session, "srv-1"))
        .await;
    h.remote.fail_next((0..10).map(|_| transient()));

    for _ in 0..4 {
        let report = h.engine.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(h.pending().await, 1);
        assert!(h.engine.status().recent_errors.is_empty());
    }

    h.engine.drain().await;
    assert_eq!(h.pending().await, 0);

    // Further drains have nothing left to report
    h.engine.drain().await;
    let errors = h.engine.status().recent_errors;
    let mentions = errors.iter().filter(|e| e.op_id == Some(queued.id)).count();
    assert_eq!(mentions, 1);

    let letters = h.engine.queue().dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 5);
    assert!(letters[0].reason.contains("gave up after 5 attempts"));
}

#[tokio::test]
async fn test_rejected_operation_evicted_immediately() {
    let h = Harness::new().await;
    h.remote.reject("/custom-meals");
    h.record(Operation::create(crate::models::CustomMeal::new(""))).await;
    h.record(Operation::create(Routine::new("Fine"))).await;

    let report = h.engine.drain().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.success, 1);
    assert_eq!(h.pending().await, 0);

    let letters = h.engine.queue().dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].entity_type, "custom_meal");
    assert_eq!(letters[0].attempts, 1);
    assert!(letters[0].reason.contains("422"));
    assert_eq!(h.engine.status().recent_errors.len(), 1);
}

#[tokio::test]
async fn test_evicting_create_cascades_to_dependents() {
    let h = Harness::new().await;
    h.remote.reject("/routines");
    let routine = Routine::new("Doomed");
    let exercise = RoutineExercise::new(&routine.id, "Squat");
    let set = WorkoutSet::new(&exercise.id, 5);
    h.record(Operation::create(routine)).await;
    h.record(Operation::create(exercise)).await;
    h.record(Operation::create(set)).await;
    h.record(Operation::create(crate::models::CustomProduct::new("Oats", 389.0)))
        .await;

    let report = h.engine.drain().await;

    assert_eq!(report.failed, 3);
    assert_eq!(report.success, 1);
    assert_eq!(h.pending().await, 0);
    assert_eq!(h.engine.queue().dead_letters().await.unwrap().len(), 3);
    assert_eq!(h.remote.calls().len(), 2);
}

#[tokio::test]
async fn test_create_without_id_is_rejected() {
    #[derive(Clone)]
    struct NoIds;

    impl RemoteClient for NoIds {
        async fn send(
            &self,
            _endpoint: &str,
            _method: Method,
            _body: Option<&Value>,
        ) -> Result<Value, RemoteError> {
            Ok(json!({ "ok": true }))
        }
    }

    let (store, _dir) = temp_store().await;
    let engine = SyncEngine::new(
        store,
        NoIds,
        ManualNetworkMonitor::default(),
        SyncSettings::default(),
    );
    engine
        .queue()
        .record(Operation::create(Routine::new("Lost")))
        .await
        .unwrap();

    let report = engine.drain().await;

    assert_eq!(report.failed, 1);
    assert_eq!(engine.queue().dead_letters().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_drains_are_single_flight() {
    let h = Harness::with_remote(FakeRemote::new().with_delay(Duration::from_millis(50))).await;
    h.record(Operation::create(Routine::new("Once"))).await;

    let (a, b) = tokio::join!(h.engine.drain(), h.engine.drain());

    assert_eq!(a.success + b.success, 1);
    assert!(a.is_empty() || b.is_empty());
    assert_eq!(h.remote.calls().len(), 1);
    assert_eq!(h.remote.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_operations_sent_in_fifo_order() {
    let h = Harness::new().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        let queued = h
            .record(Operation::delete(EntityKind::FoodEntry, format!("srv-{}", i)))
            .await;
        ids.push(queued.entity_id);
    }

    h.engine.drain().await;

    let endpoints: Vec<String> = h.remote.calls().into_iter().map(|c| c.endpoint).collect();
    let expected: Vec<String> = ids.iter().map(|id| format!("/food-entries/{}", id)).collect();
    assert_eq!(endpoints, expected);
}

#[tokio::test]
async fn test_batch_size_bounds_one_drain() {
    let (store, _dir) = temp_store().await;
    let remote = FakeRemote::new();
    let settings = SyncSettings {
        batch_size: 2,
        ..SyncSettings::default()
    };
    let engine = SyncEngine::new(store, remote.clone(), ManualNetworkMonitor::default(), settings);
    for i in 0..5 {
        engine
            .queue()
            .record(Operation::delete(EntityKind::Routine, format!("srv-{}", i)))
            .await
            .unwrap();
    }

    assert_eq!(engine.drain().await.success, 2);
    assert_eq!(engine.refresh_status().await.unwrap().pending_count, 3);
}

#[tokio::test]
async fn test_start_drains_on_reconnect_and_stop_ends_tasks() {
    let h = Harness::new().await;
    h.network.set_online(false);
    h.engine.start(Duration::from_secs(3600)).unwrap();
    assert!(matches!(
        h.engine.start(Duration::from_secs(1)),
        Err(EngineError::AlreadyStarted)
    ));

    h.record(Operation::create(Routine::new("Queued offline"))).await;
    let mut status = h.engine.subscribe_status();

    h.network.set_online(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            status.changed().await.unwrap();
            let current = status.borrow_and_update().clone();
            if !current.is_syncing && current.pending_count == 0 && current.last_sync_at.is_some() {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(h.remote.calls().len(), 1);

    h.engine.stop().await;
    assert!(!h.engine.is_started());
    h.engine.start(Duration::from_secs(3600)).unwrap();
    h.engine.stop().await;
}

#[test]
fn test_server_id_accepts_strings_and_numbers() {
    assert_eq!(server_id(&json!({ "id": "abc" })), Some("abc".to_string()));
    assert_eq!(server_id(&json!({ "id": 7 })), Some("7".to_string()));
    assert_eq!(server_id(&json!({ "id": "" })), None);
    assert_eq!(server_id(&json!({ "id": "local_x" })), None);
    assert_eq!(server_id(&json!({ "name": "x" })), None);
    assert_eq!(server_id(&Value::Null), None);
}

#[tokio::test]
async fn test_child_of_evicted_create_is_evicted_not_deferred_forever() {
    let (store, _dir) = temp_store().await;
    let remote = FakeRemote::new();
    let settings = SyncSettings {
        batch_size: 1,
        ..SyncSettings::default()
    };
    let engine = SyncEngine::new(
        store.clone(),
        remote.clone(),
        ManualNetworkMonitor::default(),
        settings,
    );

    remote.reject("/routines");
    let routine = Routine::new("Doomed");
    engine.queue().record(Operation::create(routine.clone())).await.unwrap();
    assert_eq!(engine.drain().await.failed, 1);

    let parent = store.get(EntityKind::Routine, &routine.id).await.unwrap().unwrap();
    assert!(parent.deleted);
    assert!(parent.synced);

    // Recorded after the parent was already given up on
    let exercise = RoutineExercise::new(&routine.id, "Squat");
    engine.queue().record(Operation::create(exercise)).await.unwrap();
    engine
        .queue()
        .record(Operation::delete(EntityKind::CustomProduct, "srv-9"))
        .await
        .unwrap();

    let report = engine.drain().await;
    assert_eq!(
        report,
        DrainReport {
            success: 0,
            failed: 1,
            deferred: 0
        }
    );
    assert_eq!(engine.drain().await.success, 1);
    assert!(engine.queue().is_empty().await.unwrap());

    let calls = remote.calls();
    assert_eq!(calls.last().unwrap().endpoint, "/custom-products/srv-9");

    let letters = engine.queue().dead_letters().await.unwrap();
    assert_eq!(letters.len(), 2);
    assert!(letters[1].reason.contains("never be created"));
    assert_eq!(engine.status().recent_errors.len(), 2);
}

#[tokio::test]
async fn test_storage_error_keeps_counts_and_never_resends_create() {
    let h = Harness::new().await;
    h.record(Operation::delete(EntityKind::Session, "srv-1")).await;
    let routine = Routine::new("Leg Day");
    let create = h.record(Operation::create(routine.clone())).await;
    h.store
        .write(
            "CREATE TRIGGER no_mappings BEFORE INSERT ON id_mappings BEGIN SELECT RAISE(ABORT, 'disk full'); END",
            &[],
        )
        .await
        .unwrap();

    let first = h.engine.drain().await;
    assert_eq!(
        first,
        DrainReport {
            success: 1,
            failed: 1,
            deferred: 0
        }
    );
    assert_eq!(h.pending().await, 1);
    let errors = h.engine.status().recent_errors;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].op_id, Some(create.id));
    assert!(errors[0].message.contains("disk full"));

    h.store
        .write("DROP TRIGGER no_mappings", &[])
        .await
        .unwrap();
    let second = h.engine.drain().await;
    assert_eq!(second.success, 1);
    assert_eq!(h.pending().await, 0);

    let posts = h
        .remote
        .calls()
        .into_iter()
        .filter(|call| call.method == Method::Post)
        .count();
    assert_eq!(posts, 1);
    assert_eq!(
        h.engine.mapper().lookup(&routine.id).await.unwrap(),
        Some("100".to_string())
    );
}

#[tokio::test]
async fn test_quarantined_rows_reach_recent_errors() {
    let h = Harness::new().await;
    h.store
        .write(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, created_at) VALUES ('routine', 'x', 'update', 'not json', '1999-01-01T00:00:00.000000Z')",
            &[],
        )
        .await
        .unwrap();

    let report = h.engine.drain().await;

    assert_eq!(report.failed, 1);
    assert_eq!(h.pending().await, 0);
    let errors = h.engine.status().recent_errors;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].op_id.is_some());
}
