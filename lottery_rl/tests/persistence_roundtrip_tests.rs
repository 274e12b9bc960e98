// tests/persistence_roundtrip_tests.rs
//
// save -> load on a fresh Manager must reproduce the trained agents: same
// counters and epsilon, same greedy (epsilon = 0) choices for the same states,
// every time they are asked.

use std::sync::Arc;

use lottery_rl::history::synthetic_history;
use lottery_rl::rl::hot_cold::FrequencyHotCold;
use lottery_rl::rl::telemetry::TrainingTelemetry;
use lottery_rl::{
    AgentKind, EngineConfig, EngineError, Environment, LotteryConfig, Manager, RewardModel,
    Strategy, TrainingBudget,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn manager(dir: &std::path::Path) -> Manager {
    let mut cfg = EngineConfig::for_testing();
    cfg.model_dir = dir.to_path_buf();
    Manager::new(cfg).with_telemetry(TrainingTelemetry::disabled())
}

fn sample_states(cfg: &EngineConfig, lottery: LotteryConfig) -> Vec<lottery_rl::State> {
    let history = synthetic_history(&lottery, 120, 77);
    let mut env = Environment::new(
        lottery,
        cfg.env.clone(),
        history,
        RewardModel::new(lottery, cfg.reward.clone()),
        Arc::new(FrequencyHotCold::default()),
        0,
    )
    .unwrap();
    (cfg.env.window..120).step_by(7).map(|p| env.observe(p).unwrap()).collect()
}

/// Test: a reloaded pair makes identical greedy decisions, repeatedly.
#[test]
fn test_save_load_reproduces_greedy_actions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lottery = LotteryConfig::mini();
    let history = synthetic_history(&lottery, 150, 3);

    let original = manager(dir.path());
    let report = original
        .train(&lottery, &history, TrainingBudget::both(8))
        .unwrap();
    assert!(report.saved);
    assert!(original.store().exists(&lottery.config_id(), AgentKind::Tabular));
    assert!(original.store().exists(&lottery.config_id(), AgentKind::FunctionApprox));

    let reloaded = manager(dir.path());
    let before = original.status(&lottery).unwrap();
    let after = reloaded.status(&lottery).unwrap();
    assert_eq!(before.tabular_episodes, after.tabular_episodes);
    assert_eq!(before.approx_episodes, after.approx_episodes);
    assert_eq!(before.tabular_epsilon, after.tabular_epsilon);
    assert_eq!(before.approx_epsilon, after.approx_epsilon);
    assert_eq!(before.table_size, after.table_size);

    let states = sample_states(original.config(), lottery);
    let a = original.pair(&lottery).unwrap();
    let b = reloaded.pair(&lottery).unwrap();
    let a = a.lock().unwrap();
    let b = b.lock().unwrap();
    for _round in 0..3 {
        for state in &states {
            assert_eq!(a.tabular().best_action(state), b.tabular().best_action(state));

            let mut rng_a = ChaCha8Rng::seed_from_u64(5);
            let mut rng_b = ChaCha8Rng::seed_from_u64(5);
            let (act_a, val_a) = a.approx().greedy(state, &mut rng_a).unwrap();
            let (act_b, val_b) = b.approx().greedy(state, &mut rng_b).unwrap();
            assert_eq!(act_a, act_b);
            assert!((val_a - val_b).abs() < 1e-6, "{} vs {}", val_a, val_b);
        }
    }
}

/// Test: generation after reload matches generation before it.
#[test]
fn test_generate_matches_after_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lottery = LotteryConfig::mini();
    let history = synthetic_history(&lottery, 100, 9);

    let original = manager(dir.path());
    original.train(&lottery, &history, TrainingBudget::both(5)).unwrap();
    let expected = original.generate(&lottery, &history, 4, Strategy::Ensemble).unwrap();

    let reloaded = manager(dir.path());
    let actual = reloaded.generate(&lottery, &history, 4, Strategy::Ensemble).unwrap();
    assert_eq!(expected, actual);
}

/// Test: a tampered blob is rejected and leaves a fresh pair untrained.
#[test]
fn test_tampered_blob_is_not_loaded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lottery = LotteryConfig::mini();
    let history = synthetic_history(&lottery, 80, 4);

    manager(dir.path())
        .train(&lottery, &history, TrainingBudget::both(3))
        .unwrap();
    let path = dir
        .path()
        .join(lottery.config_id())
        .join(AgentKind::Tabular.file_name());
    let text = std::fs::read_to_string(&path).unwrap();
    let tampered = text.replacen("\\\"episodes\\\":3", "\\\"episodes\\\":4", 1);
    assert_ne!(text, tampered, "fixture must change the payload");
    std::fs::write(&path, tampered).unwrap();

    let fresh = manager(dir.path());
    assert!(matches!(fresh.load(&lottery), Err(EngineError::Persistence { .. })));
    let status = fresh.status(&lottery).unwrap();
    assert!(!status.tabular_trained);
    assert!(!status.approx_trained);
}

/// Test: a blob that fails the automatic load is reported by status until a
/// later save replaces it.
#[test]
fn test_status_reports_failed_automatic_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lottery = LotteryConfig::mini();
    let history = synthetic_history(&lottery, 80, 12);

    manager(dir.path())
        .train(&lottery, &history, TrainingBudget::both(3))
        .unwrap();
    let path = dir
        .path()
        .join(lottery.config_id())
        .join(AgentKind::FunctionApprox.file_name());
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replacen("sha256:", "sha256:0", 1)).unwrap();

    let fresh = manager(dir.path());
    let status = fresh.status(&lottery).unwrap();
    let error = status.last_load_error.expect("load error is reported");
    assert!(error.contains("approx.json"), "{}", error);
    assert!(!status.tabular_trained);
    assert!(!status.approx_trained);

    let report = fresh
        .train(&lottery, &history, TrainingBudget::both(2))
        .unwrap();
    assert!(report.saved);
    assert_eq!(fresh.status(&lottery).unwrap().last_load_error, None);
    assert_eq!(manager(dir.path()).status(&lottery).unwrap().last_load_error, None);
}
