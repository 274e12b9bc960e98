// tests/action_validity_tests.rs
//
// Every materialized action must have the right field sizes, in-range
// numbers and no duplicates within a field, for any valid configuration and
// any probability vector the network might emit.

use lottery_rl::config::ApproxConfig;
use lottery_rl::rl::action_encoding::materialize_top_k;
use lottery_rl::rl::FeatureRanges;
use lottery_rl::{Action, EngineConfig, FunctionApproxAgent, LotteryConfig, State};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn configs() -> Vec<LotteryConfig> {
    vec![
        LotteryConfig::euro_style(),
        LotteryConfig::power_style(),
        LotteryConfig::mini(),
        LotteryConfig::new(1, 1, 1, 1).unwrap(),
        LotteryConfig::new(6, 49, 1, 10).unwrap(),
        LotteryConfig::new(7, 7, 3, 3).unwrap(),
    ]
}

fn assert_valid(action: &Action, cfg: &LotteryConfig) {
    assert_eq!(action.field1.len(), cfg.field1_size, "field1 size for {}", cfg.config_id());
    assert_eq!(action.field2.len(), cfg.field2_size, "field2 size for {}", cfg.config_id());
    for (numbers, max) in [(&action.field1, cfg.field1_max), (&action.field2, cfg.field2_max)] {
        assert!(numbers.iter().all(|&n| n >= 1 && n as usize <= max));
        assert!(numbers.windows(2).all(|w| w[0] < w[1]), "sorted and unique: {:?}", numbers);
    }
    assert!(action.is_valid(cfg));
}

/// Test: uniformly random actions are valid for every configuration.
#[test]
fn test_random_actions_valid_for_all_configs() {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    for cfg in configs() {
        for _ in 0..200 {
            assert_valid(&Action::random(&cfg, &mut rng), &cfg);
        }
    }
}

/// Test: top-k materialization survives NaN, infinite, short and empty vectors.
#[test]
fn test_materialization_handles_degenerate_probabilities() {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    for cfg in configs() {
        let cases: Vec<(Vec<f32>, Vec<f32>)> = vec![
            (vec![], vec![]),
            (vec![f32::NAN; cfg.field1_max], vec![f32::INFINITY; cfg.field2_max]),
            (vec![0.0; cfg.field1_max], vec![0.0; cfg.field2_max]),
            (vec![1.0; 1], vec![0.5; 1]),
            (
                (0..cfg.field1_max + 5).map(|_| rng.gen::<f32>()).collect(),
                (0..cfg.field2_max).map(|_| rng.gen::<f32>()).collect(),
            ),
        ];
        for (p1, p2) in cases {
            let action = materialize_top_k(&p1, &p2, &cfg, &mut rng);
            assert_valid(&action, &cfg);
        }
    }
}

/// Test: canonical keys parse back to the same action.
#[test]
fn test_action_key_is_canonical() {
    let cfg = LotteryConfig::euro_style();
    let action = Action::new(vec![9, 1, 12, 5, 40], vec![7, 3], &cfg).unwrap();
    assert_eq!(action.key(), "1,5,9,12,40|3,7");
    assert_eq!(Action::from_key(&action.key(), &cfg).unwrap(), action);
    assert!(Action::new(vec![1, 1, 2, 3, 4], vec![1, 2], &cfg).is_err());
    assert!(Action::new(vec![1, 2, 3, 4, 51], vec![1, 2], &cfg).is_err());
}

/// Test: the network learner only ever emits valid tickets.
#[test]
fn test_function_approx_actions_valid() {
    let engine = EngineConfig::for_testing();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    for cfg in [LotteryConfig::mini(), LotteryConfig::euro_style(), LotteryConfig::new(1, 1, 1, 1).unwrap()] {
        let ranges = FeatureRanges::new(&cfg, &engine.env);
        let approx_cfg = ApproxConfig {
            hidden_dim: 8,
            ..engine.approx.clone()
        };
        let mut agent = FunctionApproxAgent::new(cfg, approx_cfg, ranges, 11).unwrap();
        let state = State::neutral();
        for _ in 0..20 {
            assert_valid(&agent.choose_action(&state), &cfg);
            let (greedy, _) = agent.greedy(&state, &mut rng).unwrap();
            assert_valid(&greedy, &cfg);
            let (sampled, _) = agent.sample_action(&state, &mut rng).unwrap();
            assert_valid(&sampled, &cfg);
        }
    }
}
