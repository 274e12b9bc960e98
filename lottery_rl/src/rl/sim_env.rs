// src/rl/sim_env.rs
//
// Gym-style environment that replays a draw history.
//
// - reset(start) -> State
// - step(action) -> StepResult (reward, next state, done, info)
// - observe(position) / latest_state() for read-only state queries
//
// Position p means "the next draw to be predicted is history[p]"; the state
// at p is computed from the trailing window history[p - W .. p]. States are
// memoized per position and the cache is cleared on every reset.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{EnvConfig, LotteryConfig};
use crate::error::{EngineError, EngineResult};
use crate::history::DrawRecord;

use super::action_encoding::Action;
use super::hot_cold::{HotColdProvider, HotColdSets};
use super::observation::{FeatureRanges, State, JACKPOT_PERIOD};
use super::reward::{RewardComponents, RewardModel};

/// Result of a single environment step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// State after the step; None at end of data.
    pub next_state: Option<State>,
    /// Scalar (shaped) reward.
    pub reward: f64,
    /// Whether the episode has terminated.
    pub done: bool,
    pub info: StepInfo,
}

/// Additional information returned from a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInfo {
    /// Position of the draw the action was scored against.
    pub position: usize,
    pub draw_number: Option<u64>,
    pub matches_field1: usize,
    pub matches_field2: usize,
    pub prize: f64,
    /// prize - ticket_cost, without shaping.
    pub net: f64,
    pub reward_components: RewardComponents,
    /// Termination reason if done.
    pub termination_reason: Option<String>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: State,
    hot_cold: HotColdSets,
}

/// Replay environment over one lottery history.
pub struct Environment {
    lottery: LotteryConfig,
    cfg: EnvConfig,
    history: Vec<DrawRecord>,
    reward: RewardModel,
    hot_cold: Arc<dyn HotColdProvider>,
    ranges: FeatureRanges,
    rng: ChaCha8Rng,
    cache: HashMap<usize, Snapshot>,
    /// Next draw to score.
    position: usize,
    start: usize,
    steps: usize,
    /// True between reset and the terminal step.
    active: bool,
    episode_rewards: Vec<f64>,
}

impl Environment {
    /// Fails with `DataInsufficient` when the history is shorter than
    /// `window + 1` draws.
    pub fn new(
        lottery: LotteryConfig,
        cfg: EnvConfig,
        history: Vec<DrawRecord>,
        reward: RewardModel,
        hot_cold: Arc<dyn HotColdProvider>,
        seed: u64,
    ) -> EngineResult<Self> {
        let required = cfg.window + 1;
        if history.len() < required {
            return Err(EngineError::DataInsufficient {
                required,
                available: history.len(),
            });
        }
        let ranges = FeatureRanges::new(&lottery, &cfg);
        Ok(Self {
            lottery,
            cfg,
            history,
            reward,
            hot_cold,
            ranges,
            rng: ChaCha8Rng::seed_from_u64(seed),
            cache: HashMap::new(),
            position: 0,
            start: 0,
            steps: 0,
            active: false,
            episode_rewards: Vec::new(),
        })
    }

    /// Start a new episode at `start` (clamped to `[window, len - 1]`) or at a
    /// random valid position. Returns the initial state.
    pub fn reset(&mut self, start: Option<usize>) -> State {
        let lo = self.cfg.window;
        let hi = self.history.len() - 1;
        let start = match start {
            Some(s) => s.clamp(lo, hi),
            None => self.rng.gen_range(lo..=hi),
        };
        self.cache.clear();
        self.episode_rewards.clear();
        self.start = start;
        self.position = start;
        self.steps = 0;
        self.active = true;
        self.snapshot(start).state
    }

    /// Score `action` against the draw at the current position and advance.
    pub fn step(&mut self, action: &Action) -> EngineResult<StepResult> {
        if !self.active {
            return Err(EngineError::EnvironmentNotReset);
        }
        let pos = self.position;
        let snap = self.snapshot(pos);
        let state_key = snap
            .state
            .discretize(&self.ranges, self.reward.weights().exploration_bins);
        let draw = self.history.get(pos);
        let components = self.reward.compute(action, draw, &snap.hot_cold, &state_key);
        let reward = components.total;
        let draw_number = draw.map(|d| d.draw_number);

        self.position += 1;
        self.steps += 1;
        self.episode_rewards.push(reward);

        let end_of_data = self.position >= self.history.len();
        let step_cap = self
            .cfg
            .max_episode_steps
            .is_some_and(|cap| self.steps >= cap);
        let termination_reason = if end_of_data {
            Some("end_of_data".to_string())
        } else if step_cap {
            Some("max_episode_steps".to_string())
        } else {
            None
        };
        let done = termination_reason.is_some();
        if done {
            self.active = false;
        }

        let next_state = if end_of_data {
            None
        } else {
            Some(self.snapshot(self.position).state)
        };

        Ok(StepResult {
            next_state,
            reward,
            done,
            info: StepInfo {
                position: pos,
                draw_number,
                matches_field1: components.matches_field1,
                matches_field2: components.matches_field2,
                prize: components.prize,
                net: components.base,
                reward_components: components,
                termination_reason,
            },
        })
    }

    /// State at any position in `[window, len]` without touching the episode.
    pub fn observe(&mut self, position: usize) -> EngineResult<State> {
        if position < self.cfg.window || position > self.history.len() {
            return Err(EngineError::invalid_config(
                "position",
                format!(
                    "{} outside [{}, {}]",
                    position,
                    self.cfg.window,
                    self.history.len()
                ),
            ));
        }
        Ok(self.snapshot(position).state)
    }

    /// State after the most recent draw; used for generation.
    pub fn latest_state(&mut self) -> State {
        let len = self.history.len();
        self.snapshot(len).state
    }

    pub fn lottery(&self) -> &LotteryConfig {
        &self.lottery
    }

    pub fn config(&self) -> &EnvConfig {
        &self.cfg
    }

    pub fn ranges(&self) -> &FeatureRanges {
        &self.ranges
    }

    pub fn reward_model(&self) -> &RewardModel {
        &self.reward
    }

    pub fn reward_model_mut(&mut self) -> &mut RewardModel {
        &mut self.reward
    }

    pub fn history(&self) -> &[DrawRecord] {
        &self.history
    }

    pub fn draw_at(&self, position: usize) -> Option<&DrawRecord> {
        self.history.get(position)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn episode_start(&self) -> usize {
        self.start
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Rewards collected so far in the current episode.
    pub fn episode_rewards(&self) -> &[f64] {
        &self.episode_rewards
    }

    fn snapshot(&mut self, position: usize) -> Snapshot {
        if let Some(snap) = self.cache.get(&position) {
            return snap.clone();
        }
        let snap = self.compute_snapshot(position);
        self.cache.insert(position, snap.clone());
        snap
    }

    fn compute_snapshot(&self, position: usize) -> Snapshot {
        let end = position.min(self.history.len());
        let begin = end.saturating_sub(self.cfg.window);
        let window = &self.history[begin..end];
        if window.is_empty() || window.iter().any(|d| !d.is_valid_for(&self.lottery)) {
            return Snapshot {
                state: State::neutral(),
                hot_cold: HotColdSets::default(),
            };
        }
        let hot_cold = self.hot_cold.hot_cold(window, &self.lottery);
        let state = compute_state(window, &self.lottery, &self.cfg, &hot_cold, position);
        Snapshot { state, hot_cold }
    }
}

/// Feature extraction over a non-empty, validated window.
fn compute_state(
    window: &[DrawRecord],
    lottery: &LotteryConfig,
    cfg: &EnvConfig,
    hot_cold: &HotColdSets,
    position: usize,
) -> State {
    // (field, number) -> occurrences
    let mut counts: HashMap<(u8, u32), usize> = HashMap::new();
    let mut distinct1 = HashSet::new();
    let mut distinct2 = HashSet::new();
    let mut total = 0usize;
    let mut evens = 0usize;

    for draw in window {
        for &n in &draw.field1_numbers {
            *counts.entry((1, n)).or_insert(0) += 1;
            distinct1.insert(n);
            total += 1;
            evens += usize::from(n % 2 == 0);
        }
        for &n in &draw.field2_numbers {
            *counts.entry((2, n)).or_insert(0) += 1;
            distinct2.insert(n);
            total += 1;
            evens += usize::from(n % 2 == 0);
        }
    }

    let universe_length = (distinct1.len() + distinct2.len()) as f64;
    let parity_ratio = if total == 0 {
        0.5
    } else {
        evens as f64 / total as f64
    };
    let window_len = window.len() as f64;
    let appearing = counts.len().max(1) as f64;
    let mean_gap = counts.values().map(|&c| window_len / c as f64).sum::<f64>() / appearing;
    let mean_frequency = counts.values().sum::<usize>() as f64 / appearing;

    let samples = cfg.trend_samples.max(2).min(window.len());
    let recent = &window[window.len() - samples..];
    let sum_trend = match (recent.first(), recent.last()) {
        (Some(first), Some(last)) if samples > 1 => {
            (last.field1_sum() as f64 - first.field1_sum() as f64) / samples as f64
        }
        _ => 0.0,
    };

    State {
        universe_length,
        parity_ratio,
        mean_gap,
        mean_frequency,
        hot_count: hot_cold.hot_count() as f64,
        cold_count: hot_cold.cold_count() as f64,
        sum_trend,
        diversity_index: universe_length / lottery.number_span() as f64,
        days_since_jackpot: (position % JACKPOT_PERIOD) as f64,
        position_index: position as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::synthetic_history;
    use crate::rl::hot_cold::FrequencyHotCold;
    use crate::rl::reward::RewardWeights;

    fn env(len: usize, window: usize, max_steps: Option<usize>) -> EngineResult<Environment> {
        let lottery = LotteryConfig::mini();
        let cfg = EnvConfig {
            window,
            max_episode_steps: max_steps,
            ..EnvConfig::default()
        };
        Environment::new(
            lottery,
            cfg,
            synthetic_history(&lottery, len, 11),
            RewardModel::new(lottery, RewardWeights::default()),
            Arc::new(FrequencyHotCold::default()),
            5,
        )
    }

    #[test]
    fn short_history_is_rejected() {
        match env(10, 10, None) {
            Err(EngineError::DataInsufficient {
                required,
                available,
            }) => {
                assert_eq!(required, 11);
                assert_eq!(available, 10);
            }
            other => panic!("expected DataInsufficient, got {:?}", other.err()),
        }
        assert!(env(11, 10, None).is_ok());
    }

    #[test]
    fn step_before_reset_fails_fast() {
        let mut e = env(30, 10, None).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let a = Action::random(&LotteryConfig::mini(), &mut rng);
        assert_eq!(e.step(&a).unwrap_err(), EngineError::EnvironmentNotReset);
    }

    #[test]
    fn episode_runs_to_end_of_data() {
        let mut e = env(30, 10, None).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        e.reset(Some(25));
        let mut steps = 0;
        loop {
            let a = Action::random(&LotteryConfig::mini(), &mut rng);
            let r = e.step(&a).unwrap();
            steps += 1;
            if r.done {
                assert!(r.next_state.is_none());
                assert_eq!(r.info.termination_reason.as_deref(), Some("end_of_data"));
                break;
            }
            assert!(r.next_state.is_some());
        }
        assert_eq!(steps, 5);
        assert!(e.step(&Action::random(&LotteryConfig::mini(), &mut rng)).is_err());
    }

    #[test]
    fn step_cap_terminates_episode() {
        let mut e = env(100, 10, Some(3)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        e.reset(Some(10));
        let a = Action::random(&LotteryConfig::mini(), &mut rng);
        assert!(!e.step(&a).unwrap().done);
        assert!(!e.step(&a).unwrap().done);
        let last = e.step(&a).unwrap();
        assert!(last.done);
        assert!(last.next_state.is_some());
    }

    #[test]
    fn reset_clamps_start_and_states_are_deterministic() {
        let mut e = env(40, 10, None).unwrap();
        let s1 = e.reset(Some(0));
        assert_eq!(e.position(), 10);
        let s2 = e.reset(Some(10));
        assert_eq!(s1, s2);
        e.reset(Some(1000));
        assert_eq!(e.position(), 39);
        for _ in 0..20 {
            e.reset(None);
            assert!((10..40).contains(&e.position()));
        }
    }

    #[test]
    fn state_features_are_consistent() {
        let mut e = env(40, 10, None).unwrap();
        let s = e.observe(20).unwrap();
        assert!(s.is_finite());
        assert!(s.universe_length > 0.0 && s.universe_length <= 40.0);
        assert!((0.0..=1.0).contains(&s.parity_ratio));
        assert!((s.diversity_index - s.universe_length / 40.0).abs() < 1e-12);
        assert_eq!(s.days_since_jackpot, 20.0);
        assert_eq!(s.position_index, 20.0);
        assert!(e.observe(5).is_err());
        assert_eq!(e.latest_state().position_index, 40.0);
    }
}
