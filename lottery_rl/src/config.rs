// src/config.rs
//
// Configuration records for the engine.
//
// - LotteryConfig: the immutable game shape (two fields, size/max each).
//   Copied into every component at construction and never mutated.
// - EngineConfig: learner hyperparameters, environment window, reward
//   weights, ensemble calibration and the model directory.
//
// Defaults are the single source of truth; `EngineConfig::from_env()`
// layers LOTTERY_RL_* environment overrides on top. Any variable that
// fails to parse is ignored with a warning.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::rl::reward::RewardWeights;

/// Shape of a two-field lottery: pick `field1_size` of `1..=field1_max`
/// and `field2_size` of `1..=field2_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LotteryConfig {
    pub field1_size: usize,
    pub field2_size: usize,
    pub field1_max: usize,
    pub field2_max: usize,
}

impl LotteryConfig {
    /// Build and validate a configuration.
    pub fn new(
        field1_size: usize,
        field1_max: usize,
        field2_size: usize,
        field2_max: usize,
    ) -> EngineResult<Self> {
        let cfg = Self {
            field1_size,
            field2_size,
            field1_max,
            field2_max,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// 5 of 50 + 2 of 12.
    pub fn euro_style() -> Self {
        Self {
            field1_size: 5,
            field2_size: 2,
            field1_max: 50,
            field2_max: 12,
        }
    }

    /// 5 of 69 + 1 of 26.
    pub fn power_style() -> Self {
        Self {
            field1_size: 5,
            field2_size: 1,
            field1_max: 69,
            field2_max: 26,
        }
    }

    /// 4 of 20 + 4 of 20; small enough for fast tests.
    pub fn mini() -> Self {
        Self {
            field1_size: 4,
            field2_size: 4,
            field1_max: 20,
            field2_max: 20,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let checks = [
            ("field1_size", self.field1_size, self.field1_max),
            ("field2_size", self.field2_size, self.field2_max),
        ];
        for (name, size, max) in checks {
            if size == 0 {
                return Err(EngineError::invalid_config(name, "must be positive"));
            }
            if size > max {
                return Err(EngineError::invalid_config(
                    name,
                    format!("size {} exceeds max {}", size, max),
                ));
            }
        }
        Ok(())
    }

    /// Stable identifier used as the persistence directory name.
    pub fn config_id(&self) -> String {
        format!(
            "f1-{}of{}_f2-{}of{}",
            self.field1_size, self.field1_max, self.field2_size, self.field2_max
        )
    }

    /// Total number range across both fields.
    pub fn number_span(&self) -> usize {
        self.field1_max + self.field2_max
    }
}

/// Environment / state-window settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Trailing window W of prior draws used to compute a state.
    pub window: usize,
    /// Optional cap on steps per episode (None = run to end of data).
    pub max_episode_steps: Option<usize>,
    /// Number of recent draws sampled for `sum_trend`.
    pub trend_samples: usize,
    /// Fraction of each field treated as hot / cold by the default provider.
    pub hot_cold_fraction: f64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            window: 50,
            max_episode_steps: Some(52),
            trend_samples: 10,
            hot_cold_fraction: 0.2,
        }
    }
}

/// Epsilon schedule shared by both learners (each owns its own copy).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpsilonSchedule {
    pub start: f64,
    pub floor: f64,
    /// Multiplicative decay applied after each episode.
    pub decay: f64,
}

impl EpsilonSchedule {
    pub fn next(&self, current: f64) -> f64 {
        (current * self.decay).max(self.floor)
    }
}

/// Tabular Q-learning hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularConfig {
    pub learning_rate: f64,
    pub gamma: f64,
    pub epsilon: EpsilonSchedule,
    /// Buckets per feature when discretizing states.
    pub bins: usize,
    /// Table size (state entries) above which least-visited eviction runs.
    pub max_states: usize,
    /// Fraction of state entries dropped per eviction pass.
    pub eviction_fraction: f64,
}

impl Default for TabularConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            gamma: 0.95,
            epsilon: EpsilonSchedule {
                start: 1.0,
                floor: 0.05,
                decay: 0.995,
            },
            bins: 5,
            max_states: 10_000,
            eviction_fraction: 0.2,
        }
    }
}

/// Function-approximation (DQN-style) hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproxConfig {
    pub hidden_dim: usize,
    /// Size of the value head's action embedding.
    pub action_slots: usize,
    pub learning_rate: f64,
    pub gamma: f64,
    pub epsilon: EpsilonSchedule,
    pub replay_capacity: usize,
    pub batch_size: usize,
    /// Minimum buffer occupancy before learning starts (never below 2).
    pub min_replay: usize,
    /// Hard-copy online weights into the target every N learning steps.
    pub target_sync_interval: u64,
    /// Global gradient-norm bound.
    pub max_grad_norm: f64,
    /// Weight of the advantage-weighted log-likelihood term on the field heads.
    pub policy_loss_weight: f64,
}

impl Default for ApproxConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 64,
            action_slots: 128,
            learning_rate: 1e-3,
            gamma: 0.95,
            epsilon: EpsilonSchedule {
                start: 1.0,
                floor: 0.05,
                decay: 0.99,
            },
            replay_capacity: 10_000,
            batch_size: 32,
            min_replay: 64,
            target_sync_interval: 100,
            max_grad_norm: 1.0,
            policy_loss_weight: 0.1,
        }
    }
}

/// Calibration used when the ensemble compares the two learners.
///
/// Raw values are squashed with `1 / (1 + exp(-(v - offset) / scale))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub tabular_scale: f64,
    pub tabular_offset: f64,
    pub approx_scale: f64,
    pub approx_offset: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            tabular_scale: 1.0,
            tabular_offset: -1.0,
            approx_scale: 2.0,
            approx_offset: -1.0,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub env: EnvConfig,
    pub reward: RewardWeights,
    pub tabular: TabularConfig,
    pub approx: ApproxConfig,
    pub ensemble: EnsembleConfig,
    /// Directory under which `<config_id>/` model folders live.
    pub model_dir: PathBuf,
    /// Base seed for agent and environment RNGs.
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            env: EnvConfig::default(),
            reward: RewardWeights::default(),
            tabular: TabularConfig::default(),
            approx: ApproxConfig::default(),
            ensemble: EnsembleConfig::default(),
            model_dir: PathBuf::from("models"),
            seed: 42,
        }
    }
}

impl EngineConfig {
    /// Defaults with LOTTERY_RL_* environment overrides applied.
    ///
    /// Recognized variables:
    ///   - LOTTERY_RL_MODEL_DIR        (path)
    ///   - LOTTERY_RL_SEED             (u64)
    ///   - LOTTERY_RL_WINDOW           (usize)
    ///   - LOTTERY_RL_TICKET_COST      (f64)
    ///   - LOTTERY_RL_TABULAR_ALPHA    (f64)
    ///   - LOTTERY_RL_TABULAR_BINS     (usize)
    ///   - LOTTERY_RL_MAX_STATES       (usize)
    ///   - LOTTERY_RL_APPROX_LR        (f64)
    ///   - LOTTERY_RL_BATCH_SIZE       (usize)
    ///   - LOTTERY_RL_TARGET_SYNC      (u64)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(raw) = env::var("LOTTERY_RL_MODEL_DIR") {
            if !raw.trim().is_empty() {
                log::info!("[config] LOTTERY_RL_MODEL_DIR = {} (overrode default)", raw);
                cfg.model_dir = PathBuf::from(raw);
            }
        }
        override_from_env("LOTTERY_RL_SEED", &mut cfg.seed);
        override_from_env("LOTTERY_RL_WINDOW", &mut cfg.env.window);
        override_from_env("LOTTERY_RL_TICKET_COST", &mut cfg.reward.ticket_cost);
        override_from_env("LOTTERY_RL_TABULAR_ALPHA", &mut cfg.tabular.learning_rate);
        override_from_env("LOTTERY_RL_TABULAR_BINS", &mut cfg.tabular.bins);
        override_from_env("LOTTERY_RL_MAX_STATES", &mut cfg.tabular.max_states);
        override_from_env("LOTTERY_RL_APPROX_LR", &mut cfg.approx.learning_rate);
        override_from_env("LOTTERY_RL_BATCH_SIZE", &mut cfg.approx.batch_size);
        override_from_env("LOTTERY_RL_TARGET_SYNC", &mut cfg.approx.target_sync_interval);

        cfg.sanitize();
        cfg
    }

    /// Clamp values into workable ranges.
    pub fn sanitize(&mut self) {
        self.env.window = self.env.window.max(1);
        self.env.trend_samples = self.env.trend_samples.max(2);
        self.env.hot_cold_fraction = self.env.hot_cold_fraction.clamp(0.0, 1.0);
        self.tabular.bins = self.tabular.bins.max(1);
        self.tabular.max_states = self.tabular.max_states.max(1);
        self.tabular.eviction_fraction = self.tabular.eviction_fraction.clamp(0.01, 1.0);
        self.approx.batch_size = self.approx.batch_size.max(2);
        self.approx.min_replay = self.approx.min_replay.max(2).max(self.approx.batch_size);
        self.approx.action_slots = self.approx.action_slots.max(1);
        self.approx.hidden_dim = self.approx.hidden_dim.max(2);
        self.approx.target_sync_interval = self.approx.target_sync_interval.max(1);
        self.reward.ticket_cost = self.reward.ticket_cost.max(f64::EPSILON);
        self.reward.return_to_player = self.reward.return_to_player.clamp(0.0, 0.99);
    }

    /// Small, fast settings for tests and smoke runs.
    pub fn for_testing() -> Self {
        let mut cfg = Self::default();
        cfg.env.window = 20;
        cfg.env.max_episode_steps = Some(10);
        cfg.approx.hidden_dim = 16;
        cfg.approx.action_slots = 32;
        cfg.approx.batch_size = 8;
        cfg.approx.min_replay = 16;
        cfg.approx.replay_capacity = 500;
        cfg.approx.target_sync_interval = 10;
        cfg.sanitize();
        cfg
    }
}

fn override_from_env<T>(name: &str, slot: &mut T)
where
    T: FromStr + Display,
{
    let Ok(raw) = env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => {
            log::info!("[config] {} = {} (overrode default)", name, v);
            *slot = v;
        }
        Err(_) => {
            log::warn!(
                "[config] could not parse {} = {:?}; using default {}",
                name,
                raw,
                slot
            );
        }
    }
}
