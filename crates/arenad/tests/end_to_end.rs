//! End-to-end control-plane scenarios.
//!
//! Wires the real store, allocator, reconciler, watcher and detector
//! against a manually driven in-memory orchestrator.

use std::sync::Arc;
use std::time::Duration;

use arena_allocator::Allocator;
use arena_api::{ApiState, build_router};
use arena_core::{Catalog, ResourceRequirement};
use arena_detector::Detector;
use arena_orchestrator::{
    ContainerStatus, MemoryOrchestrator, Phase, Pod, PodPhase, SUPERVISOR_CONTAINER, object_name,
    workload_selector,
};
use arena_reconciler::{Reconciler, StaticCatalog};
use arena_state::{NodeCapacity, StateStore, StatusHub, Workload, WorkloadStatus, epoch_secs};
use arena_watcher::Watcher;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::watch;
use tower::ServiceExt;

const CATALOG: &str = r#"
[[games]]
name = "X"
image = "ghcr.io/arena/x:1"
command = ["./x-server", "--port", "$ARENA_PORT_GAME"]

[[games.ports]]
name = "game"
container_port = 27015
protocol = "UDP"

[[games.ports]]
name = "rcon"
container_port = 27016

[[games.volumes]]
name = "data"
mount_path = "/data"

[games.health]
type = "port"
port = "rcon"

[games.plans.small]
cpu = "1"
memory = "2Gi"
storage = "5Gi"
"#;

struct Harness {
    store: StateStore,
    allocator: Allocator,
    orchestrator: Arc<MemoryOrchestrator>,
    reconciler: Reconciler,
    watcher: Watcher,
    detector: Detector,
}

fn node(name: &str, ip: &str) -> NodeCapacity {
    NodeCapacity {
        name: name.to_string(),
        ip: ip.to_string(),
        capacity: ResourceRequirement::new(8000, 16 << 30),
        port_range_start: 7000,
        port_range_end: 7099,
    }
}

fn harness(nodes: &[NodeCapacity]) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let allocator = Allocator::new(store.clone());
    allocator.sync_nodes(nodes).unwrap();
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    let catalog = Arc::new(StaticCatalog(Catalog::from_toml_str(CATALOG).unwrap()));
    let reconciler = Reconciler::new(
        store.clone(),
        allocator.clone(),
        orchestrator.clone(),
        catalog,
    );
    let watcher = Watcher::new(store.clone(), orchestrator.clone());
    let detector = Detector::new(store.clone(), orchestrator.clone());
    Harness {
        store,
        allocator,
        orchestrator,
        reconciler,
        watcher,
        detector,
    }
}

fn create(store: &StateStore, id: &str, status: WorkloadStatus) {
    let mut w = Workload::new(id, "user-1", "X", "small", epoch_secs());
    w.status = status;
    assert!(store.insert_workload(&w).unwrap());
}

fn get(store: &StateStore, id: &str) -> Workload {
    store.get_workload(id).unwrap().unwrap()
}

fn supervisor_pod(id: &str, restart_count: u32) -> Pod {
    Pod {
        name: object_name(id),
        labels: workload_selector(id),
        phase: PodPhase::Running,
        pod_ip: Some("10.0.0.5".to_string()),
        containers: vec![ContainerStatus {
            name: SUPERVISOR_CONTAINER.to_string(),
            restart_count,
            ..ContainerStatus::default()
        }],
        init_containers: Vec::new(),
    }
}

#[tokio::test]
async fn scenario_a_pending_becomes_starting_with_allocations() {
    let h = harness(&[node("node-a", "192.168.1.10")]);
    create(&h.store, "w1", WorkloadStatus::Pending);

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.succeeded, 1);

    assert_eq!(get(&h.store, "w1").status, WorkloadStatus::Starting);
    let ports = h.allocator.server_ports("w1").unwrap();
    assert_eq!(ports.len(), 2);
    assert!(ports.iter().all(|a| a.node_name == "node-a"));

    let object = h.orchestrator.object(&object_name("w1")).unwrap();
    assert_eq!(object.spec.node_name, "node-a");
    assert_eq!(object.spec.ports.len(), 2);
    assert_eq!(h.orchestrator.claims().len(), 1);
}

#[tokio::test]
async fn scenario_b_no_capacity_fails_without_allocations() {
    let h = harness(&[]);
    create(&h.store, "w1", WorkloadStatus::Pending);

    h.reconciler.reconcile_once().await.unwrap();

    let w = get(&h.store, "w1");
    assert_eq!(w.status, WorkloadStatus::Failed);
    assert!(w.status_message.unwrap().contains("no capacity"));
    assert!(h.store.list_allocations().unwrap().is_empty());
    assert!(h.orchestrator.objects().is_empty());
}

#[tokio::test]
async fn scenario_c_watcher_marks_running_without_reconciler_tick() {
    let h = harness(&[node("node-a", "192.168.1.10")]);
    create(&h.store, "w1", WorkloadStatus::Pending);
    h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(get(&h.store, "w1").status, WorkloadStatus::Starting);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = h.watcher;
    let task = tokio::spawn(async move { watcher.run(shutdown_rx).await });

    // Wait for the watcher to subscribe and sync before driving the object.
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.orchestrator
        .set_phase(&object_name("w1"), Phase::Ready, Some("10.0.0.5"));

    let mut running = None;
    for _ in 0..50 {
        let w = get(&h.store, "w1");
        if w.status == WorkloadStatus::Running {
            running = Some(w);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let w = running.expect("watcher did not mark the workload running");
    assert_eq!(w.pod_ip.as_deref(), Some("10.0.0.5"));
    assert_eq!(w.node_ip.as_deref(), Some("192.168.1.10"));

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn scenario_d_restart_jump_fails_workload() {
    let h = harness(&[node("node-a", "192.168.1.10")]);
    create(&h.store, "w1", WorkloadStatus::Running);

    h.orchestrator.set_pod(supervisor_pod("w1", 2));
    h.detector.detect_once().await.unwrap();
    let w = get(&h.store, "w1");
    assert_eq!(w.status, WorkloadStatus::Running);
    assert_eq!(w.restart_count, 2);

    h.orchestrator.set_pod(supervisor_pod("w1", 6));
    h.detector.detect_once().await.unwrap();
    let w = get(&h.store, "w1");
    assert_eq!(w.status, WorkloadStatus::Failed);
    assert_eq!(w.restart_count, 6);

    // Later polls see the same status and change nothing.
    h.detector.detect_once().await.unwrap();
    assert_eq!(get(&h.store, "w1").status, WorkloadStatus::Failed);
}

#[tokio::test]
async fn failed_workload_returns_capacity() {
    let h = harness(&[node("node-a", "192.168.1.10")]);
    create(&h.store, "w1", WorkloadStatus::Pending);
    h.reconciler.reconcile_once().await.unwrap();
    assert!(h.store.transition("w1", WorkloadStatus::Starting, WorkloadStatus::Running, None).unwrap());
    assert_eq!(h.allocator.server_ports("w1").unwrap().len(), 2);

    h.orchestrator.set_pod(supervisor_pod("w1", 9));
    h.detector.detect_once().await.unwrap();

    assert_eq!(get(&h.store, "w1").status, WorkloadStatus::Failed);
    assert!(h.allocator.server_ports("w1").unwrap().is_empty());
    let usage = h.allocator.node_usage().unwrap();
    assert_eq!(usage[0].workloads, 0);
}

#[tokio::test]
async fn concurrent_transitions_have_one_winner() {
    let h = harness(&[node("node-a", "192.168.1.10")]);
    for i in 0..20 {
        create(&h.store, &format!("w{i}"), WorkloadStatus::Running);
    }

    let mut tasks = Vec::new();
    for i in 0..20 {
        for target in [WorkloadStatus::Stopping, WorkloadStatus::Failed] {
            let store = h.store.clone();
            let id = format!("w{i}");
            tasks.push(tokio::task::spawn_blocking(move || {
                store
                    .transition(&id, WorkloadStatus::Running, target, None)
                    .unwrap()
            }));
        }
    }
    let mut wins = 0;
    for task in tasks {
        if task.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 20);
    for i in 0..20 {
        let status = get(&h.store, &format!("w{i}")).status;
        assert!(matches!(status, WorkloadStatus::Stopping | WorkloadStatus::Failed));
    }
}

#[tokio::test]
async fn pending_materialization_is_idempotent() {
    let h = harness(&[node("node-a", "192.168.1.10")]);
    create(&h.store, "w1", WorkloadStatus::Pending);
    h.reconciler.reconcile_once().await.unwrap();
    let ports_before = h.allocator.server_ports("w1").unwrap();
    let object_before = h.orchestrator.object(&object_name("w1")).unwrap();

    // Replay the pending step as if the first pass had crashed before its CAS.
    assert!(h.store.transition("w1", WorkloadStatus::Starting, WorkloadStatus::Pending, None).unwrap());
    h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(get(&h.store, "w1").status, WorkloadStatus::Starting);
    assert_eq!(h.allocator.server_ports("w1").unwrap(), ports_before);
    assert_eq!(h.orchestrator.object(&object_name("w1")).unwrap().spec, object_before.spec);
    assert_eq!(h.orchestrator.objects().len(), 1);
    assert_eq!(h.orchestrator.claims().len(), 1);
    assert_eq!(h.store.list_allocations().unwrap().len(), 2);
}

#[tokio::test]
async fn stop_lifecycle_releases_ports() {
    let h = harness(&[node("node-a", "192.168.1.10")]);
    create(&h.store, "w1", WorkloadStatus::Pending);
    h.reconciler.reconcile_once().await.unwrap();
    h.orchestrator
        .set_phase(&object_name("w1"), Phase::Ready, Some("10.0.0.5"));
    h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(get(&h.store, "w1").status, WorkloadStatus::Running);

    assert!(h.store.transition("w1", WorkloadStatus::Running, WorkloadStatus::Stopping, None).unwrap());
    h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(h.orchestrator.delete_requests().len(), 1);

    h.orchestrator.finish_deletion(&object_name("w1"));
    h.reconciler.reconcile_once().await.unwrap();

    let w = get(&h.store, "w1");
    assert_eq!(w.status, WorkloadStatus::Stopped);
    assert!(w.stopped_at.is_some());
    assert!(h.store.list_allocations().unwrap().is_empty());
}

#[tokio::test]
async fn transitions_reach_the_status_hub() {
    let store = StateStore::open_in_memory().unwrap();
    let allocator = Allocator::new(store.clone());
    allocator.sync_nodes(&[node("node-a", "192.168.1.10")]).unwrap();
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    let hub = StatusHub::default();
    let reconciler = Reconciler::new(
        store.clone(),
        allocator,
        orchestrator,
        Arc::new(StaticCatalog(Catalog::from_toml_str(CATALOG).unwrap())),
    )
    .with_hub(hub.clone());
    let mut rx = hub.subscribe("user-1");

    create(&store, "w1", WorkloadStatus::Pending);
    reconciler.reconcile_once().await.unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.server_id, "w1");
    assert_eq!(event.status, WorkloadStatus::Starting);
}

#[tokio::test]
async fn supervisor_reports_are_recorded_through_the_api() {
    let h = harness(&[node("node-a", "192.168.1.10")]);
    create(&h.store, "w1", WorkloadStatus::Running);
    let app = build_router(ApiState::new(h.store.clone(), h.allocator.clone(), "s3cret"));

    let request = Request::builder()
        .method("POST")
        .uri("/internal/servers/w1/heartbeat")
        .header("content-type", "application/json")
        .header("authorization", "Bearer s3cret")
        .body(Body::from(r#"{"process_pid":321,"memory_mb":900,"cpu_percent":3.5}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("POST")
        .uri("/internal/servers/w1/status")
        .header("content-type", "application/json")
        .header("authorization", "Bearer s3cret")
        .body(Body::from(r#"{"status":"failed","message":"process crashed: exit code 1"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let w = get(&h.store, "w1");
    // Reports never drive workload status.
    assert_eq!(w.status, WorkloadStatus::Running);
    assert_eq!(w.process.pid, Some(321));
    assert_eq!(w.process.memory_mb, Some(900));
    assert_eq!(w.process.status.as_deref(), Some("failed"));
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arena.redb");
    {
        let store = StateStore::open(&path).unwrap();
        let allocator = Allocator::new(store.clone());
        allocator.sync_nodes(&[node("node-a", "192.168.1.10")]).unwrap();
        let reconciler = Reconciler::new(
            store.clone(),
            allocator,
            Arc::new(MemoryOrchestrator::new()),
            Arc::new(StaticCatalog(Catalog::from_toml_str(CATALOG).unwrap())),
        );
        create(&store, "w1", WorkloadStatus::Pending);
        reconciler.reconcile_once().await.unwrap();
    }

    let store = StateStore::open(&path).unwrap();
    assert_eq!(get(&store, "w1").status, WorkloadStatus::Starting);
    assert_eq!(store.allocations_for("w1").unwrap().len(), 2);
    let ports = serde_json::to_value(store.allocations_for("w1").unwrap()).unwrap();
    assert_eq!(ports[0]["node_name"], "node-a");
}
