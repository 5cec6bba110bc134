mod common;

use common::{spawn_api, ApiState};
use getman_check::testing::Extraction;
use getman_check::{
    FsPersistence, MemoryPersistence, Request, RequestFile, RetryPolicy, RunOptions, SequenceStep,
    TestRunner, TestSequence, TestStatus, UpdateMode,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn runner(options: RunOptions) -> TestRunner {
    TestRunner::from_options(options, Arc::new(MemoryPersistence::new()), CancellationToken::new()).unwrap()
}

#[tokio::test]
async fn create_then_fetch_user_sequence() {
    let addr = spawn_api(ApiState::default()).await;
    let mut options = RunOptions::default();
    options.environment.insert("base".into(), format!("http://{addr}"));
    let runner = runner(options);

    let sequence = TestSequence::new(
        "user lifecycle",
        vec![
            SequenceStep::new(
                "create",
                Request::new("POST", "{{base}}/users")
                    .with_header("Content-Type", "application/json")
                    .with_body(r#"{"name":"Alice"}"#),
            )
            .expect_status(201)
            .extract(Extraction::body("id", "id")),
            SequenceStep::new("fetch", Request::new("GET", "${base}/users/${id}")).expect_status(200),
        ],
    );

    let report = runner.run_all(&[], &[sequence]).await.unwrap();
    let result = &report.sequences[0];
    assert!(result.success, "{result:?}");
    assert_eq!(result.variables["id"], "7");
    assert_eq!(result.steps[1].actual_status, Some(200));
    let fetched = result.steps[1].response.as_ref().unwrap();
    assert_eq!(fetched.request.url, format!("http://{addr}/users/7"));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn snapshots_heal_on_disk() {
    let state = ApiState::default();
    let addr = spawn_api(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let snapshot_dir = dir.path().join("__snapshots__").to_string_lossy().into_owned();

    let file = RequestFile::new(
        "collections/service.json",
        vec![Request::new("GET", format!("http://{addr}/version")).with_name("version")],
    );
    let run = |update_mode: UpdateMode| {
        let options = RunOptions {
            update_mode,
            snapshot_dir: snapshot_dir.clone(),
            ..RunOptions::default()
        };
        TestRunner::from_options(options, Arc::new(FsPersistence::new()), CancellationToken::new()).unwrap()
    };

    let created = run(UpdateMode::Missing).run(std::slice::from_ref(&file)).await.unwrap();
    assert!(created.results[0].snapshot.as_ref().unwrap().created());
    let path = created.results[0].snapshot.as_ref().unwrap().path.clone();
    assert!(std::path::Path::new(&path).exists());
    assert!(path.ends_with("service/get_version.snap.json"), "{path}");

    let unchanged = run(UpdateMode::None).run(std::slice::from_ref(&file)).await.unwrap();
    assert_eq!(unchanged.results[0].status, TestStatus::Passed);

    state.version.store(2, Ordering::SeqCst);
    let drifted = run(UpdateMode::None).run(std::slice::from_ref(&file)).await.unwrap();
    assert_eq!(drifted.results[0].status, TestStatus::Failed);
    assert_eq!(drifted.exit_code(), 1);

    let healed = run(UpdateMode::Failed).run(std::slice::from_ref(&file)).await.unwrap();
    assert_eq!(healed.results[0].status, TestStatus::Passed);
    assert!(healed.results[0].snapshot.as_ref().unwrap().updated());
    assert_eq!(healed.exit_code(), 0);

    let stored: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(stored["metadata"]["statusCode"], 200);
    assert_eq!(stored["metadata"]["requestMethod"], "GET");
    assert!(stored["content"].as_str().unwrap().contains("\"version\": 2"));

    let after = run(UpdateMode::None).run(std::slice::from_ref(&file)).await.unwrap();
    assert_eq!(after.results[0].status, TestStatus::Passed);
}

#[tokio::test]
async fn session_cookies_are_replayed() {
    let addr = spawn_api(ApiState::default()).await;
    let runner = runner(RunOptions::default());
    let executor = runner.executor();
    let no_vars = HashMap::new();

    let anonymous = executor
        .execute(&Request::new("GET", format!("http://{addr}/me")), &no_vars)
        .await
        .unwrap();
    assert_eq!(anonymous.status, 401);

    executor
        .execute(&Request::new("GET", format!("http://{addr}/login")), &no_vars)
        .await
        .unwrap();
    assert_eq!(executor.sessions().unwrap().hosts(), vec!["127.0.0.1".to_string()]);

    let authed = executor
        .execute(&Request::new("GET", format!("http://{addr}/me")), &no_vars)
        .await
        .unwrap();
    assert_eq!(authed.status, 200);
}

#[tokio::test]
async fn sessions_can_be_disabled() {
    let addr = spawn_api(ApiState::default()).await;
    let runner = runner(RunOptions {
        sessions: false,
        ..RunOptions::default()
    });
    let executor = runner.executor();
    let no_vars = HashMap::new();

    executor
        .execute(&Request::new("GET", format!("http://{addr}/login")), &no_vars)
        .await
        .unwrap();
    let me = executor
        .execute(&Request::new("GET", format!("http://{addr}/me")), &no_vars)
        .await
        .unwrap();
    assert_eq!(me.status, 401);
    assert!(executor.sessions().is_none());
}

#[tokio::test]
async fn retries_through_service_unavailable() {
    let state = ApiState::default();
    let addr = spawn_api(state.clone()).await;
    let runner = runner(RunOptions {
        retry: RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            jitter: 0.0,
            ..RetryPolicy::default()
        },
        ..RunOptions::default()
    });

    let response = runner
        .executor()
        .execute(&Request::new("GET", format!("http://{addr}/flaky")), &HashMap::new())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "recovered");
    assert_eq!(response.attempts, 3);
    assert_eq!(state.flaky_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn parallel_run_against_live_server() {
    let addr = spawn_api(ApiState::default()).await;
    let requests = (0..12)
        .map(|i| {
            let id = if i % 3 == 0 { 7 } else { 100 + i };
            Request::new("GET", format!("http://{addr}/users/{id}")).with_name(format!("user {i}"))
        })
        .collect();
    let file = RequestFile::new("users.json", requests);

    let sequential = runner(RunOptions::default()).run(std::slice::from_ref(&file)).await.unwrap();
    let mut parallel = runner(RunOptions {
        parallel: true,
        concurrency: 4,
        ..RunOptions::default()
    })
    .run(std::slice::from_ref(&file))
    .await
    .unwrap();
    parallel.sort_stable();

    let pairs = |report: &getman_check::TestReport| -> Vec<(String, TestStatus, u16)> {
        report
            .results
            .iter()
            .map(|r| (r.name.clone(), r.status, r.response.as_ref().unwrap().status))
            .collect()
    };
    assert_eq!(pairs(&sequential), pairs(&parallel));
    assert_eq!(parallel.summary.total, 12);
    assert!(parallel.summary.timing.is_some());
}
