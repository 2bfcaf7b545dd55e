//! End-to-end orchestrator scenarios against real worker processes and a
//! throw-away database.

use std::time::Duration;

use tempfile::TempDir;
use testrig::config::Config;
use testrig::model::{BatchStatus, BatchSubmission, RunRequest, RunStatus};
use testrig::orchestrator::{BatchView, Orchestrator};
use testrig::storage;

fn orchestrator(dir: &TempDir, script: &str) -> Orchestrator {
    let mut config = Config::default();
    config.worker.program = "sh".to_string();
    config.worker.args = vec!["-c".to_string(), script.to_string()];
    config.worker.artifacts_dir = dir.path().join("artifacts");
    config.reports.dir = dir.path().join("reports");
    let pool = storage::open_pool(dir.path().join("testrig.db")).unwrap();
    Orchestrator::new(&config, pool)
}

fn submission(test_set_ids: Vec<i64>) -> BatchSubmission {
    BatchSubmission {
        batch_id: None,
        release_id: 12,
        release_label: Some("2024.06".to_string()),
        environment: Some("staging".to_string()),
        base_url: "http://staging.local".to_string(),
        test_set_ids,
    }
}

#[tokio::test]
async fn test_slow_run_blocks_fast_run_on_serial_queue() {
    let dir = TempDir::new().unwrap();
    let script = r#"
if [ "$TESTRIG_TEST_SET_ID" = "1" ]; then sleep 0.5; else sleep 0.1; fi
echo 'RESULT:{"status":"passed"}'
"#;
    let orch = orchestrator(&dir, script);

    let slow = orch.submit_run(RunRequest::new(1, 1, "http://x")).await.unwrap();
    let fast = orch.submit_run(RunRequest::new(2, 1, "http://x")).await.unwrap();

    // Sample while both are in flight: never two running at once.
    let sampler = {
        let orch = orch.clone();
        tokio::spawn(async move {
            loop {
                let a = orch.run_status(slow).await.unwrap();
                let b = orch.run_status(fast).await.unwrap();
                let running = [a, b]
                    .into_iter()
                    .flatten()
                    .filter(|v| v.status() == RunStatus::Running)
                    .count();
                assert!(running <= 1);
                let done = orch
                    .run_status(fast)
                    .await
                    .unwrap()
                    .is_some_and(|v| v.status().is_terminal());
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };
    tokio::time::timeout(Duration::from_secs(10), sampler)
        .await
        .unwrap()
        .unwrap();

    let first = orch.stored_run(slow).await.unwrap().unwrap();
    let second = orch.stored_run(fast).await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Passed);
    assert_eq!(second.status, RunStatus::Passed);
    assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
}

#[tokio::test]
async fn test_batch_of_ten_with_two_failing_sets() {
    let dir = TempDir::new().unwrap();
    let script = r#"
sleep 0.3
case "$TESTRIG_TEST_SET_ID" in
  3|7)
    echo 'RESULT:{"status":"failed","totalSteps":2,"passedSteps":1,"failedSteps":1,"steps":[{"description":"load","status":"passed"},{"description":"verify","status":"failed","error":"expected 200"}]}'
    exit 1 ;;
  *)
    echo 'RESULT:{"status":"passed","totalSteps":2,"passedSteps":2}' ;;
esac
"#;
    let orch = orchestrator(&dir, script);
    let handle = orch.submit_batch(submission((1..=10).collect())).await.unwrap();
    assert_eq!(handle.run_ids.len(), 10);

    // Counters only move forward and the bound holds throughout.
    let mut last_completed = 0;
    let watcher = async {
        loop {
            let Some(BatchView::Live(state)) = orch.batch_status(&handle.batch_id).await.unwrap()
            else {
                panic!("batch should be live");
            };
            assert!(state.running <= 7);
            assert!(state.completed_sets >= last_completed);
            assert_eq!(
                state.status.is_terminal(),
                state.completed_sets == state.total_sets
            );
            last_completed = state.completed_sets;
            if state.status.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    };
    let state = tokio::time::timeout(Duration::from_secs(20), watcher)
        .await
        .unwrap();

    assert_eq!(state.status, BatchStatus::Failed);
    assert_eq!(state.passed_sets, 8);
    assert_eq!(state.failed_sets, 2);
    assert_eq!(state.completed_sets, 10);
    assert_eq!(state.peak_running, 7);

    let details = orch
        .wait_for_batch(&handle.batch_id, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(details.batch.status, BatchStatus::Failed);
    assert_eq!(details.batch.completed_sets, 10);
    for run in &details.runs {
        let expected = if matches!(run.test_set_id, 3 | 7) {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };
        assert_eq!(run.status, expected, "test set {}", run.test_set_id);
        assert_eq!(run.environment.as_deref(), Some("staging"));
    }

    let failing = details.runs.iter().find(|r| r.test_set_id == 3).unwrap();
    let steps = orch.run_steps(failing.id).await.unwrap().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].error.as_deref(), Some("expected 200"));
}

#[tokio::test]
async fn test_queue_and_batch_do_not_share_slots() {
    let dir = TempDir::new().unwrap();
    let script = r#"
if [ "$TESTRIG_BATCH" = "1" ]; then sleep 0.6; fi
echo 'RESULT:{"status":"passed"}'
"#;
    let orch = orchestrator(&dir, script);

    let handle = orch.submit_batch(submission(vec![1, 2])).await.unwrap();
    let single = orch.submit_run(RunRequest::new(9, 12, "http://x")).await.unwrap();

    let view = tokio::time::timeout(
        Duration::from_secs(10),
        orch.wait_for_run(single, Duration::from_millis(10)),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(view.status(), RunStatus::Passed);

    // The single run finished while the batch was still busy.
    match orch.batch_status(&handle.batch_id).await.unwrap() {
        Some(BatchView::Live(batch)) => assert!(!batch.status.is_terminal()),
        other => panic!("unexpected batch view: {other:?}"),
    }
}

#[tokio::test]
async fn test_spawn_failure_fails_run_without_stalling() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.worker.program = "/nonexistent/testrig-worker".to_string();
    config.worker.args = Vec::new();
    config.worker.artifacts_dir = dir.path().join("artifacts");
    config.reports.dir = dir.path().join("reports");
    let pool = storage::open_pool(dir.path().join("testrig.db")).unwrap();
    let orch = Orchestrator::new(&config, pool);

    let a = orch.submit_run(RunRequest::new(1, 1, "http://x")).await.unwrap();
    let b = orch.submit_run(RunRequest::new(2, 1, "http://x")).await.unwrap();

    for run_id in [a, b] {
        let view = tokio::time::timeout(
            Duration::from_secs(10),
            orch.wait_for_run(run_id, Duration::from_millis(10)),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(view.status(), RunStatus::Failed);
        assert!(view.error().unwrap().contains("testrig-worker"));
    }
    assert!(orch.queue_status().await.pending.is_empty());
}
