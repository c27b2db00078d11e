use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use baton_coord::{CoordinationStore, FaultyStore, MemoryStore, PubSubMessage, Subscription};
use baton_core::{
    CleanupStep, EventStream, ExecutionEngine, RunError, RunExecutor, RunReader, RunReport,
    ScriptStep, ScriptedEngine, Worker, WorkerConfig,
};
use baton_persist::{RunDatabase, RunStatusStore};
use baton_types::{ControlSignal, ResponseEvent, RunKeys, RunRecord, RunRequest, RunStatus};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn config(instance_id: &str) -> WorkerConfig {
    WorkerConfig {
        instance_id: instance_id.to_string(),
        drain_timeout_ms: 5_000,
        ..WorkerConfig::default()
    }
}

fn emit(event_type: &str) -> ScriptStep {
    ScriptStep::Emit(ResponseEvent::new(event_type, json!({ "content": event_type })))
}

fn emit_status(status: RunStatus, message: Option<&str>) -> ScriptStep {
    ScriptStep::Emit(ResponseEvent::status(status, message.map(str::to_string)))
}

async fn database_with(run_ids: &[&str]) -> RunDatabase {
    let db = RunDatabase::open_in_memory().await.expect("db");
    for run_id in run_ids {
        db.insert_run(&RunRecord::started(*run_id, Some("t1".to_string())))
            .await
            .expect("insert");
    }
    db
}

fn executor(
    store: Arc<dyn CoordinationStore>,
    db: &RunDatabase,
    engine: impl ExecutionEngine + 'static,
    instance_id: &str,
) -> RunExecutor {
    RunExecutor::new(
        store,
        Arc::new(db.clone()),
        Arc::new(engine),
        Arc::new(config(instance_id)),
    )
}

async fn response_log(store: &MemoryStore, run_id: &str) -> Vec<ResponseEvent> {
    store
        .list_range(&RunKeys::new(run_id).responses(), 0, -1)
        .await
        .expect("range")
        .iter()
        .map(|raw| ResponseEvent::from_json(raw).expect("json"))
        .collect()
}

async fn control_payloads(subscription: &mut Box<dyn Subscription>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(message) = subscription
        .receive(Duration::from_millis(10))
        .await
        .expect("receive")
    {
        if let PubSubMessage::Message { payload, .. } = message {
            payloads.push(payload);
        }
    }
    payloads
}

fn assert_single_trailing_marker(log: &[ResponseEvent], status: RunStatus) {
    let markers = log
        .iter()
        .filter(|event| event.terminal_status().is_some())
        .count();
    assert_eq!(markers, 1, "log: {log:?}");
    assert_eq!(log.last().and_then(ResponseEvent::terminal_status), Some(status));
}

fn finished(report: RunReport) -> baton_core::FinalizeReport {
    match report {
        RunReport::Finished(report) => report,
        other => panic!("expected finished run, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn failed_run_is_visible_on_log_status_and_control_channel() {
    let store = MemoryStore::new();
    let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    let db = database_with(&["r1"]).await;
    let keys = RunKeys::new("r1");
    let mut broadcast = store
        .subscribe(&[keys.broadcast_control()])
        .await
        .expect("subscribe");

    let instance_a = executor(
        shared.clone(),
        &db,
        ScriptedEngine::new(vec![
            emit("assistant"),
            emit("tool"),
            ScriptStep::Delay(Duration::from_secs(2)),
            emit_status(RunStatus::Failed, Some("boom")),
        ]),
        "A",
    );
    let run_a = tokio::spawn(async move { instance_a.execute(RunRequest::new("r1")).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.get(&keys.lock()).await.expect("get").as_deref(), Some("A"));
    assert_eq!(
        store.get(&keys.liveness("A")).await.expect("get").as_deref(),
        Some("running")
    );

    let instance_b = executor(shared.clone(), &db, ScriptedEngine::default(), "B");
    let skipped = instance_b
        .execute(RunRequest::new("r1"))
        .await
        .expect("execute B");
    assert_eq!(
        skipped,
        RunReport::Skipped {
            run_id: "r1".to_string(),
            holder: Some("A".to_string()),
        }
    );

    let report = finished(run_a.await.expect("join").expect("execute A"));
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("boom"));
    assert_eq!(report.sentinel, ControlSignal::Error);
    assert!(report.status_persisted);
    assert!(report.sentinel_published);
    assert!(report.cleanup_failures.is_empty());

    let log = response_log(&store, "r1").await;
    assert_eq!(log.len(), 3);
    assert_single_trailing_marker(&log, RunStatus::Failed);
    assert_eq!(log[2].message(), Some("boom"));

    let record = db.get_run("r1").await.expect("get").expect("row");
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("boom"));
    assert!(record.completed_at.is_some());

    assert_eq!(control_payloads(&mut broadcast).await, vec!["ERROR"]);
    assert!(!store.contains_key(&keys.liveness("A")));
    assert!(!store.contains_key(&keys.lock()));
    let retention = store.ttl(&keys.responses()).expect("retention ttl");
    assert!(retention > Duration::from_secs(23 * 60 * 60));
}

#[tokio::test(start_paused = true)]
async fn stop_request_wins_and_nothing_after_it_is_appended() {
    let store = MemoryStore::new();
    let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    let db = database_with(&["r1"]).await;
    let mut broadcast = store
        .subscribe(&[RunKeys::new("r1").broadcast_control()])
        .await
        .expect("subscribe");

    let worker = executor(
        shared.clone(),
        &db,
        ScriptedEngine::new(vec![
            emit("assistant"),
            ScriptStep::Delay(Duration::from_secs(60)),
            emit("late"),
        ]),
        "A",
    );
    let run = tokio::spawn(async move { worker.execute(RunRequest::new("r1")).await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let requested = Instant::now();
    RunReader::new(shared.clone())
        .request_stop("r1", Some("A"))
        .await
        .expect("stop");
    let report = finished(run.await.expect("join").expect("execute"));
    assert!(requested.elapsed() < Duration::from_millis(600));

    assert_eq!(report.status, RunStatus::Stopped);
    assert_eq!(report.sentinel, ControlSignal::Stop);
    let log = response_log(&store, "r1").await;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].event_type, "assistant");
    assert!(log.iter().all(|event| event.event_type != "late"));
    assert_single_trailing_marker(&log, RunStatus::Stopped);

    let record = db.get_run("r1").await.expect("get").expect("row");
    assert_eq!(record.status, RunStatus::Stopped);
    assert_eq!(record.error, None);
    assert_eq!(control_payloads(&mut broadcast).await, vec!["STOP"]);
}

#[tokio::test(start_paused = true)]
async fn broadcast_stop_reaches_the_running_instance() {
    let store = MemoryStore::new();
    let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    let db = database_with(&["r1"]).await;
    let worker = executor(
        shared.clone(),
        &db,
        ScriptedEngine::new(vec![ScriptStep::Delay(Duration::from_secs(60))]),
        "A",
    );
    let run = tokio::spawn(async move { worker.execute(RunRequest::new("r1")).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    RunReader::new(shared)
        .request_stop("r1", None)
        .await
        .expect("stop");
    let report = finished(run.await.expect("join").expect("execute"));
    assert_eq!(report.status, RunStatus::Stopped);
    assert_single_trailing_marker(&response_log(&store, "r1").await, RunStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn sentinel_always_matches_persisted_status() {
    let cases = [
        (vec![emit("a")], RunStatus::Completed, ControlSignal::EndStream),
        (
            vec![emit("a"), emit_status(RunStatus::Completed, None)],
            RunStatus::Completed,
            ControlSignal::EndStream,
        ),
        (
            vec![emit_status(RunStatus::Stopped, Some("user left"))],
            RunStatus::Stopped,
            ControlSignal::Stop,
        ),
        (
            vec![emit("a"), ScriptStep::Fail("tool crashed".to_string())],
            RunStatus::Failed,
            ControlSignal::Error,
        ),
    ];
    for (idx, (steps, status, sentinel)) in cases.into_iter().enumerate() {
        let run_id = format!("run-{idx}");
        let store = MemoryStore::new();
        let db = database_with(&[run_id.as_str()]).await;
        let mut broadcast = store
            .subscribe(&[RunKeys::new(&run_id).broadcast_control()])
            .await
            .expect("subscribe");
        let report = finished(
            executor(Arc::new(store.clone()), &db, ScriptedEngine::new(steps), "A")
                .execute(RunRequest::new(&run_id))
                .await
                .expect("execute"),
        );
        assert_eq!(report.status, status);
        assert_eq!(report.sentinel, sentinel);
        let record = db.get_run(&run_id).await.expect("get").expect("row");
        assert_eq!(record.status, status);
        assert_eq!(record.status.terminal_signal(), Some(sentinel));
        assert_eq!(
            control_payloads(&mut broadcast).await,
            vec![sentinel.as_str().to_string()]
        );
        assert_single_trailing_marker(&response_log(&store, &run_id).await, status);
    }
}

#[tokio::test(start_paused = true)]
async fn engine_panic_becomes_failed_run_with_marker() {
    let store = MemoryStore::new();
    let db = database_with(&["r1"]).await;
    let report = finished(
        executor(
            Arc::new(store.clone()),
            &db,
            ScriptedEngine::new(vec![emit("a"), ScriptStep::Panic("kaboom".to_string())]),
            "A",
        )
        .execute(RunRequest::new("r1"))
        .await
        .expect("execute"),
    );
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("Engine panicked: kaboom"));
    assert_eq!(report.sentinel, ControlSignal::Error);

    let log = response_log(&store, "r1").await;
    assert_eq!(log.len(), 2);
    assert_single_trailing_marker(&log, RunStatus::Failed);
    assert_eq!(log[1].message(), Some("Engine panicked: kaboom"));
    assert!(!store.contains_key(&RunKeys::new("r1").lock()));
}

struct UnstartableEngine;

#[async_trait]
impl ExecutionEngine for UnstartableEngine {
    async fn start(
        &self,
        _request: &RunRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<EventStream> {
        Err(anyhow::anyhow!("no sandbox available"))
    }
}

#[tokio::test(start_paused = true)]
async fn engine_start_failure_is_a_failed_run() {
    let store = MemoryStore::new();
    let db = database_with(&["r1"]).await;
    let report = finished(
        executor(Arc::new(store.clone()), &db, UnstartableEngine, "A")
            .execute(RunRequest::new("r1"))
            .await
            .expect("execute"),
    );
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.error.as_deref(),
        Some("engine failed to start: no sandbox available")
    );
    let log = response_log(&store, "r1").await;
    assert_eq!(log.len(), 1);
    assert_single_trailing_marker(&log, RunStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn unreachable_control_channel_fails_run_before_engine_starts() {
    let faulty = FaultyStore::new(MemoryStore::new());
    faulty.plan().fail_subscribe_times.store(3, Ordering::SeqCst);
    let db = database_with(&["r1"]).await;
    let report = finished(
        executor(
            Arc::new(faulty.clone()),
            &db,
            ScriptedEngine::new(vec![emit("never")]),
            "A",
        )
        .execute(RunRequest::new("r1"))
        .await
        .expect("execute"),
    );
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report
        .error
        .as_deref()
        .is_some_and(|error| error.starts_with("control channel subscription failed")));
    let log = response_log(faulty.inner(), "r1").await;
    assert_eq!(log.len(), 1);
    assert!(log.iter().all(|event| event.event_type != "never"));
    assert!(!faulty.inner().contains_key(&RunKeys::new("r1").lock()));
}

#[tokio::test(start_paused = true)]
async fn lock_transport_error_prevents_start() {
    let faulty = FaultyStore::new(MemoryStore::new());
    baton_coord::FaultPlan::enable(&faulty.plan().fail_set);
    let db = database_with(&["r1"]).await;
    let result = executor(Arc::new(faulty.clone()), &db, ScriptedEngine::default(), "A")
        .execute(RunRequest::new("r1"))
        .await;
    assert!(matches!(result, Err(RunError::Lock { .. })));
    assert!(response_log(faulty.inner(), "r1").await.is_empty());
    let record = db.get_run("r1").await.expect("get").expect("row");
    assert_eq!(record.status, RunStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn missing_run_record_degrades_but_still_signals() {
    let store = MemoryStore::new();
    let db = database_with(&[]).await;
    let mut broadcast = store
        .subscribe(&[RunKeys::new("ghost").broadcast_control()])
        .await
        .expect("subscribe");
    let report = finished(
        executor(Arc::new(store.clone()), &db, ScriptedEngine::default(), "A")
            .execute(RunRequest::new("ghost"))
            .await
            .expect("execute"),
    );
    assert_eq!(report.status, RunStatus::Completed);
    assert!(!report.status_persisted);
    assert!(report.sentinel_published);
    assert_eq!(control_payloads(&mut broadcast).await, vec!["END_STREAM"]);
}

#[tokio::test(start_paused = true)]
async fn cleanup_failures_are_reported_not_raised() {
    let faulty = FaultyStore::new(MemoryStore::new());
    let db = database_with(&["r1"]).await;
    let plan_store = faulty.clone();
    let worker = executor(
        Arc::new(faulty.clone()),
        &db,
        ScriptedEngine::new(vec![emit("a"), ScriptStep::Delay(Duration::from_secs(1))]),
        "A",
    );
    let run = tokio::spawn(async move { worker.execute(RunRequest::new("r1")).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    baton_coord::FaultPlan::enable(&plan_store.plan().fail_expire);
    baton_coord::FaultPlan::enable(&plan_store.plan().fail_publish);

    let report = finished(run.await.expect("join").expect("execute"));
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.cleanup_failures.contains(&CleanupStep::RetainResponses));
    assert!(!report.sentinel_published);
    assert!(report.status_persisted);
    assert!(!faulty.inner().contains_key(&RunKeys::new("r1").lock()));
}

#[tokio::test(start_paused = true)]
async fn retention_covers_appends_that_land_during_drain() {
    let faulty = FaultyStore::new(MemoryStore::new());
    faulty.plan().append_delay_ms.store(100, Ordering::SeqCst);
    let db = database_with(&["r1"]).await;
    let report = finished(
        executor(
            Arc::new(faulty.clone()),
            &db,
            ScriptedEngine::new(vec![emit("a")]),
            "A",
        )
        .execute(RunRequest::new("r1"))
        .await
        .expect("execute"),
    );
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.cleanup_failures.is_empty());
    assert_eq!(response_log(faulty.inner(), "r1").await.len(), 2);
    let retention = faulty
        .inner()
        .ttl(&RunKeys::new("r1").responses())
        .expect("response log retention ttl");
    assert!(retention > Duration::from_secs(23 * 60 * 60));
}

#[tokio::test(start_paused = true)]
async fn control_channel_failure_stops_run_with_reason() {
    let faulty = FaultyStore::new(MemoryStore::new());
    let db = database_with(&["r1"]).await;
    let mut broadcast = faulty
        .inner()
        .subscribe(&[RunKeys::new("r1").broadcast_control()])
        .await
        .expect("subscribe");
    let worker = executor(
        Arc::new(faulty.clone()),
        &db,
        ScriptedEngine::new(vec![
            emit("a"),
            ScriptStep::Delay(Duration::from_secs(60)),
            emit("late"),
        ]),
        "A",
    );
    let run = tokio::spawn(async move { worker.execute(RunRequest::new("r1")).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    baton_coord::FaultPlan::enable(&faulty.plan().fail_receive);

    let report = finished(run.await.expect("join").expect("execute"));
    assert_eq!(report.status, RunStatus::Stopped);
    assert_eq!(report.sentinel, ControlSignal::Stop);
    assert!(report.sentinel_published);
    let error = report.error.clone().expect("stop reason");
    assert!(error.starts_with("Control channel failed: "), "{error}");
    assert!(error.contains("injected receive failure"), "{error}");

    let log = response_log(faulty.inner(), "r1").await;
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|event| event.event_type != "late"));
    assert_single_trailing_marker(&log, RunStatus::Stopped);
    assert_eq!(log[1].message(), Some(error.as_str()));

    let record = db.get_run("r1").await.expect("get").expect("row");
    assert_eq!(record.status, RunStatus::Stopped);
    assert_eq!(record.error.as_deref(), Some(error.as_str()));
    assert_eq!(control_payloads(&mut broadcast).await, vec!["STOP"]);
}

#[tokio::test(start_paused = true)]
async fn worker_runs_queue_and_skips_duplicate_run_ids() {
    let store = MemoryStore::new();
    let db = database_with(&["r1", "r2"]).await;
    let worker = Worker::spawn(
        Arc::new(executor(
            Arc::new(store.clone()),
            &db,
            ScriptedEngine::new(vec![
                emit("a"),
                ScriptStep::Delay(Duration::from_secs(2)),
            ]),
            "A",
        )),
        8,
        4,
    );
    worker.enqueue(RunRequest::new("r1")).expect("enqueue");
    worker.enqueue(RunRequest::new("r1")).expect("enqueue");
    worker.enqueue(RunRequest::new("r2")).expect("enqueue");

    let completions = worker.shutdown().await;
    assert_eq!(completions.len(), 3);
    let skipped = completions
        .iter()
        .filter(|completion| matches!(completion.result, Ok(RunReport::Skipped { .. })))
        .count();
    assert_eq!(skipped, 1);
    for run_id in ["r1", "r2"] {
        let record = db.get_run(run_id).await.expect("get").expect("row");
        assert_eq!(record.status, RunStatus::Completed);
        assert_single_trailing_marker(&response_log(&store, run_id).await, RunStatus::Completed);
    }
}

#[tokio::test(start_paused = true)]
async fn reader_follows_a_live_run_to_its_marker() {
    let store = MemoryStore::new();
    let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    let db = database_with(&["r1"]).await;
    let worker = executor(
        shared.clone(),
        &db,
        ScriptedEngine::new(vec![
            emit("a"),
            ScriptStep::Delay(Duration::from_secs(1)),
            emit("b"),
        ]),
        "A",
    );
    let run = tokio::spawn(async move { worker.execute(RunRequest::new("r1")).await });
    let events = RunReader::new(shared)
        .follow_until_terminal("r1", Duration::from_secs(30))
        .await
        .expect("follow");
    run.await.expect("join").expect("execute");
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].terminal_status(), Some(RunStatus::Completed));
}
