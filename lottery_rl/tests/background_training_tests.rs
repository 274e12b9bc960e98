// tests/background_training_tests.rs
//
// Background training jobs:
// - cancellation stops at an episode boundary and keeps partial stats
// - different configuration keys train concurrently
// - runs on one key are serialized by the per-key lock

use std::sync::Arc;
use std::time::Duration;

use lottery_rl::history::synthetic_history;
use lottery_rl::rl::telemetry::TrainingTelemetry;
use lottery_rl::{EngineConfig, EngineError, LotteryConfig, Manager, TrainingBudget};

fn manager(dir: &std::path::Path) -> Arc<Manager> {
    let mut cfg = EngineConfig::for_testing();
    cfg.model_dir = dir.to_path_buf();
    Arc::new(Manager::new(cfg).with_telemetry(TrainingTelemetry::disabled()))
}

/// Test: a cancelled long run ends early with interrupted stats or Cancelled.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_background_training() {
    let dir = tempfile::tempdir().expect("tempdir");
    let m = manager(dir.path());
    let lottery = LotteryConfig::mini();
    let history = synthetic_history(&lottery, 200, 3);
    let budget = TrainingBudget::both(1_000_000);

    let handle = m.spawn_training(lottery, history, budget);
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(60), handle.join())
        .await
        .expect("cancelled run must finish promptly");
    match result {
        Ok(report) => {
            assert!(report.tabular.interrupted);
            assert!(report.approx.interrupted);
            assert!(report.tabular.episodes < budget.tabular_episodes);
            assert!(report.approx.episodes < budget.approx_episodes);
            assert!(report.tabular.episodes + report.approx.episodes >= 1);
            let status = m.status(&lottery).unwrap();
            assert_eq!(status.tabular_episodes, report.tabular.episodes);
        }
        Err(EngineError::Cancelled) => {
            let status = m.status(&lottery).unwrap();
            assert_eq!(status.tabular_episodes, 0);
            assert_eq!(status.approx_episodes, 0);
        }
        Err(other) => panic!("unexpected error: {other}"),
    }
}

/// Test: cancelling before the job starts any episode reports Cancelled.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_start_is_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let m = manager(dir.path());
    let lottery = LotteryConfig::mini();
    let history = synthetic_history(&lottery, 100, 3);

    // Hold the key's lock so the job cannot start before the cancel lands.
    let pair = m.pair(&lottery).unwrap();
    let guard = pair.lock().unwrap();
    let handle = m.spawn_training(lottery, history, TrainingBudget::both(50));
    handle.cancel();
    drop(guard);

    let result = handle.join().await;
    assert!(matches!(result, Err(EngineError::Cancelled)), "{result:?}");
    assert!(!m.status(&lottery).unwrap().tabular_trained);
}

/// Test: two configuration keys train side by side.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_distinct_keys_train_concurrently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let m = manager(dir.path());
    let mini = LotteryConfig::mini();
    let small = LotteryConfig::new(3, 10, 2, 5).unwrap();

    let a = m.spawn_training(mini, synthetic_history(&mini, 120, 1), TrainingBudget::both(5));
    let b = m.spawn_training(small, synthetic_history(&small, 120, 2), TrainingBudget::both(5));
    let (ra, rb) = tokio::join!(a.join(), b.join());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.config_id, mini.config_id());
    assert_eq!(rb.config_id, small.config_id());
    assert_eq!(ra.tabular.episodes, 5);
    assert_eq!(rb.approx.episodes, 5);
    assert_eq!(m.registered().len(), 2);
}

/// Test: runs on the same key never interleave; their counts add up.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_key_runs_are_serialized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let m = manager(dir.path());
    let lottery = LotteryConfig::mini();
    let history = synthetic_history(&lottery, 120, 4);

    let first = m.spawn_training(lottery, history.clone(), TrainingBudget::both(4));
    let second = m.spawn_training(lottery, history, TrainingBudget::both(6));
    let (r1, r2) = tokio::join!(first.join(), second.join());
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    let status = m.status(&lottery).unwrap();
    assert_eq!(status.tabular_episodes, r1.tabular.episodes + r2.tabular.episodes);
    assert_eq!(status.tabular_episodes, 10);
    assert_eq!(status.approx_episodes, 10);
    assert_eq!(status.tabular_history.len(), 2);
}
