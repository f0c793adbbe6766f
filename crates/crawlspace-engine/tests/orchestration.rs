//! End-to-end orchestration tests over in-memory leaves and the mock
//! container runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use crawlspace_core::{ActorId, Principal, PrincipalId, RunId};
use crawlspace_engine::model::{Actor, RunOptions, RunStats};
use crawlspace_engine::runtime::MockRuntime;
use crawlspace_engine::{
    CreateRunParams, Engine, EngineConfig, MetaStore, NewRequest, OrchestratorConfig, Run,
    RunStatus,
};

async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn config(workers: usize) -> EngineConfig {
    EngineConfig {
        orchestrator: OrchestratorConfig {
            max_concurrent_runs: workers,
            poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(5),
            janitor_interval: Duration::from_secs(60),
            janitor_grace: Duration::from_secs(60),
            ..OrchestratorConfig::default()
        },
        ..EngineConfig::default()
    }
}

async fn seed_actor(engine: &Engine, owner: &PrincipalId, timeout_secs: u64) -> ActorId {
    let now = Utc::now();
    let actor = Actor {
        id: ActorId::generate(),
        owner_id: owner.clone(),
        name: format!("actor-{}", ActorId::generate()),
        title: None,
        description: None,
        default_run_options: RunOptions {
            image: "mock-image".to_string(),
            memory_mbytes: 256,
            timeout_secs,
        },
        created_at: now,
        modified_at: now,
    };
    engine.meta().insert_actor(&actor).await.unwrap();
    actor.id
}

#[tokio::test]
async fn single_run_is_dispatched_exactly_once_across_workers() {
    let runtime = Arc::new(MockRuntime::succeeding());
    let engine = Engine::in_memory(runtime.clone(), config(5));
    let handle = engine.start_orchestrator();

    let principal = Principal::user(PrincipalId::generate());
    let actor = seed_actor(&engine, &principal.id, 60).await;
    let run = engine
        .runs()
        .create_run(&principal, &actor, CreateRunParams::default())
        .await
        .unwrap();

    wait_until("run to succeed", Duration::from_secs(5), || {
        let engine = Arc::clone(&engine);
        let id = run.id.clone();
        async move { engine.runs().get(&id).await.unwrap().status == RunStatus::Succeeded }
    })
    .await;

    // Five workers raced the claim; only one container was ever started.
    assert_eq!(runtime.started_count(), 1);

    let done = engine.runs().get(&run.id).await.unwrap();
    assert_eq!(done.exit_code, Some(0));
    assert!(done.finished_at.is_some());
    assert!(done.started_at.is_some());

    handle.shutdown().await;
}

#[tokio::test]
async fn nonzero_exit_maps_to_failed_with_stderr_message() {
    let runtime = Arc::new(MockRuntime::failing(7));
    let engine = Engine::in_memory(runtime, config(2));
    let handle = engine.start_orchestrator();

    let principal = Principal::user(PrincipalId::generate());
    let actor = seed_actor(&engine, &principal.id, 60).await;
    let run = engine
        .runs()
        .create_run(&principal, &actor, CreateRunParams::default())
        .await
        .unwrap();

    wait_until("run to fail", Duration::from_secs(5), || {
        let engine = Arc::clone(&engine);
        let id = run.id.clone();
        async move { engine.runs().get(&id).await.unwrap().status == RunStatus::Failed }
    })
    .await;

    let done = engine.runs().get(&run.id).await.unwrap();
    assert_eq!(done.exit_code, Some(7));
    let message = done.status_message.unwrap();
    assert!(message.contains("something broke"), "got: {message}");

    handle.shutdown().await;
}

#[tokio::test]
async fn run_past_deadline_times_out_with_exit_143() {
    let runtime = Arc::new(MockRuntime::never_completing());
    let engine = Engine::in_memory(runtime, config(2));
    let handle = engine.start_orchestrator();

    let principal = Principal::user(PrincipalId::generate());
    let actor = seed_actor(&engine, &principal.id, 1).await;
    let run = engine
        .runs()
        .create_run(&principal, &actor, CreateRunParams::default())
        .await
        .unwrap();

    wait_until("run to time out", Duration::from_secs(10), || {
        let engine = Arc::clone(&engine);
        let id = run.id.clone();
        async move { engine.runs().get(&id).await.unwrap().status == RunStatus::TimedOut }
    })
    .await;

    let done = engine.runs().get(&run.id).await.unwrap();
    assert_eq!(done.exit_code, Some(143));
    assert!(done.finished_at.is_some());

    handle.shutdown().await;
}

#[tokio::test]
async fn abort_stops_a_logging_container() {
    let runtime = Arc::new(MockRuntime::never_completing());
    let engine = Engine::in_memory(runtime, config(2));
    let handle = engine.start_orchestrator();

    let principal = Principal::user(PrincipalId::generate());
    let actor = seed_actor(&engine, &principal.id, 600).await;
    let run = engine
        .runs()
        .create_run(&principal, &actor, CreateRunParams::default())
        .await
        .unwrap();

    // Observe at least three log lines through the subscription first.
    let mut stream = engine.logs().subscribe(&run.id).await.unwrap();
    for _ in 0..3 {
        let entry = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("log line within deadline")
            .expect("stream open");
        assert_eq!(entry.message, "hi");
    }

    engine.runs().abort_run(&run.id).await.unwrap();

    wait_until("driver to wind down", Duration::from_secs(5), || {
        let handle_active = handle.active_runs();
        async move { handle_active == 0 }
    })
    .await;

    let done = engine.runs().get(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Aborted);
    assert!(done.finished_at.is_some());

    handle.shutdown().await;
}

#[tokio::test]
async fn resurrected_run_executes_again_on_original_handles() {
    let runtime = Arc::new(MockRuntime::succeeding());
    let engine = Engine::in_memory(runtime.clone(), config(2));
    let handle = engine.start_orchestrator();

    let principal = Principal::user(PrincipalId::generate());
    let actor = seed_actor(&engine, &principal.id, 60).await;
    let run = engine
        .runs()
        .create_run(&principal, &actor, CreateRunParams::default())
        .await
        .unwrap();

    wait_until("first pass to succeed", Duration::from_secs(5), || {
        let engine = Arc::clone(&engine);
        let id = run.id.clone();
        async move { engine.runs().get(&id).await.unwrap().status == RunStatus::Succeeded }
    })
    .await;

    let resurrected = engine.runs().resurrect_run(&run.id).await.unwrap();
    assert_eq!(resurrected.default_dataset_id, run.default_dataset_id);

    wait_until("second pass to succeed", Duration::from_secs(5), || {
        let engine = Arc::clone(&engine);
        let id = run.id.clone();
        async move {
            let run = engine.runs().get(&id).await.unwrap();
            run.status == RunStatus::Succeeded && run.stats.restart_count == 1
        }
    })
    .await;

    assert_eq!(runtime.started_count(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn janitor_fails_orphaned_running_rows() {
    let runtime = Arc::new(MockRuntime::succeeding());
    let mut cfg = config(1);
    cfg.orchestrator.janitor_interval = Duration::from_millis(200);
    cfg.orchestrator.janitor_grace = Duration::from_secs(0);
    let engine = Engine::in_memory(runtime, cfg);

    // A RUNNING row with no live driver, long past its deadline.
    let principal = PrincipalId::generate();
    let orphan = Run {
        id: RunId::generate(),
        actor_id: ActorId::generate(),
        principal_id: principal,
        status: RunStatus::Running,
        status_message: None,
        created_at: Utc::now() - chrono::Duration::minutes(10),
        started_at: Some(Utc::now() - chrono::Duration::minutes(10)),
        finished_at: None,
        default_dataset_id: crawlspace_core::DatasetId::generate(),
        default_key_value_store_id: crawlspace_core::KeyValueStoreId::generate(),
        default_request_queue_id: crawlspace_core::RequestQueueId::generate(),
        image: "mock".to_string(),
        timeout_secs: 1,
        memory_mbytes: 128,
        exit_code: None,
        stats: RunStats::default(),
    };
    engine.meta().insert_run(&orphan).await.unwrap();

    let handle = engine.start_orchestrator();

    wait_until("janitor to fail the orphan", Duration::from_secs(5), || {
        let engine = Arc::clone(&engine);
        let id = orphan.id.clone();
        async move {
            let run = engine.runs().get(&id).await.unwrap();
            run.status == RunStatus::Failed && run.status_message.as_deref() == Some("orphaned")
        }
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_batch_inserts_dedup_to_one_row_per_unique_key() {
    let runtime = Arc::new(MockRuntime::succeeding());
    let engine = Engine::in_memory(runtime, config(1));

    let owner = PrincipalId::generate();
    let queue = engine.queues().create(&owner, None).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let engine = Arc::clone(&engine);
        let queue_id = queue.id.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .queues()
                .add_requests_batch(
                    &queue_id,
                    &[
                        NewRequest {
                            url: "https://a".to_string(),
                            ..NewRequest::default()
                        },
                        NewRequest {
                            url: "https://a".to_string(),
                            ..NewRequest::default()
                        },
                        NewRequest {
                            url: "https://b".to_string(),
                            ..NewRequest::default()
                        },
                    ],
                    false,
                )
                .await
                .unwrap()
        }));
    }

    let mut fresh_a = 0;
    let mut fresh_b = 0;
    for task in tasks {
        let outcome = task.await.unwrap();
        assert!(outcome.unprocessed.is_empty());
        assert_eq!(outcome.processed.len(), 3);
        for processed in outcome.processed {
            if !processed.was_already_present {
                match processed.unique_key.as_str() {
                    "https://a" => fresh_a += 1,
                    "https://b" => fresh_b += 1,
                    other => panic!("unexpected unique key {other}"),
                }
            }
        }
    }
    // Each unique key was inserted exactly once across all callers.
    assert_eq!(fresh_a, 1);
    assert_eq!(fresh_b, 1);

    let queue = engine.queues().get(&queue.id).await.unwrap();
    assert_eq!(queue.total_request_count, 2);
    assert_eq!(queue.pending_request_count, 2);

    let head = engine.queues().get_head(&queue.id, 10).await.unwrap();
    assert_eq!(head.len(), 2);
}
