// src/training.rs
//
// Episode loop shared by both learners.
//
//   reset -> (act -> step -> learn)* -> end_episode      repeated per budget
//
// Cancellation is cooperative and checked at episode boundaries only, so a
// cancelled run never leaves an agent mid-update. Win rate counts episodes
// whose summed net reward (prize - stake, no shaping) is strictly positive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::rl::action_encoding::Action;
use crate::rl::approx::FunctionApproxAgent;
use crate::rl::observation::State;
use crate::rl::replay::Experience;
use crate::rl::sim_env::{Environment, StepResult};
use crate::rl::tabular::TabularAgent;
use crate::rl::telemetry::TrainingTelemetry;

/// Number of trailing losses copied into `TrainingStats`.
const LOSS_TRACE_IN_STATS: usize = 32;

/// Cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Aggregates of one training run for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub agent: String,
    pub episodes: u64,
    pub steps: u64,
    /// Mean shaped reward per episode.
    pub mean_reward: f64,
    /// Best shaped episode reward.
    pub best_reward: f64,
    /// Mean net (prize - stake) reward per episode.
    pub mean_net_reward: f64,
    pub wins: u64,
    /// wins / episodes.
    pub win_rate: f64,
    pub final_epsilon: f64,
    /// Tabular only.
    pub table_size: Option<usize>,
    /// Function approximation only.
    pub buffer_size: Option<usize>,
    pub learn_steps: u64,
    pub mean_loss: Option<f64>,
    pub loss_trace: Vec<f32>,
    /// True when the run stopped early on cancellation.
    pub interrupted: bool,
    pub duration_ms: u64,
}

/// Training-time view of a learner.
pub trait Learner: Send {
    fn name(&self) -> &'static str;

    fn act(&mut self, state: &State) -> Action;

    /// Learn from one transition; returns a loss when an optimizer step ran.
    fn learn(&mut self, state: &State, action: &Action, step: &StepResult) -> Option<f32>;

    fn end_episode(&mut self);

    fn epsilon(&self) -> f64;

    /// Agent-specific fields of the stats record.
    fn fill_stats(&self, stats: &mut TrainingStats);
}

impl Learner for TabularAgent {
    fn name(&self) -> &'static str {
        "tabular"
    }

    fn act(&mut self, state: &State) -> Action {
        self.choose_action(state)
    }

    fn learn(&mut self, state: &State, action: &Action, step: &StepResult) -> Option<f32> {
        match TabularAgent::learn(
            self,
            state,
            action,
            step.reward,
            step.next_state.as_ref(),
            step.done,
        ) {
            Ok(_) => None,
            Err(e) => {
                log::debug!("[tabular] update skipped: {}", e);
                None
            }
        }
    }

    fn end_episode(&mut self) {
        TabularAgent::end_episode(self)
    }

    fn epsilon(&self) -> f64 {
        TabularAgent::epsilon(self)
    }

    fn fill_stats(&self, stats: &mut TrainingStats) {
        stats.table_size = Some(self.state_count());
        stats.learn_steps = self.updates();
    }
}

impl Learner for FunctionApproxAgent {
    fn name(&self) -> &'static str {
        "function_approx"
    }

    fn act(&mut self, state: &State) -> Action {
        self.choose_action(state)
    }

    fn learn(&mut self, state: &State, action: &Action, step: &StepResult) -> Option<f32> {
        self.observe(Experience {
            state: state.clone(),
            action: action.clone(),
            reward: step.reward,
            next_state: step.next_state.clone(),
            done: step.done,
        })
    }

    fn end_episode(&mut self) {
        FunctionApproxAgent::end_episode(self)
    }

    fn epsilon(&self) -> f64 {
        FunctionApproxAgent::epsilon(self)
    }

    fn fill_stats(&self, stats: &mut TrainingStats) {
        stats.buffer_size = Some(self.buffer_len());
        stats.learn_steps = self.learn_steps();
        let trace: Vec<f32> = self.losses().collect();
        let start = trace.len().saturating_sub(LOSS_TRACE_IN_STATS);
        stats.loss_trace = trace[start..].to_vec();
    }
}

/// Run up to `episodes` episodes of `agent` in `env`.
pub fn run_training<L: Learner + ?Sized>(
    agent: &mut L,
    env: &mut Environment,
    episodes: u64,
    cancel: &CancelToken,
    telemetry: &Mutex<TrainingTelemetry>,
    config_id: &str,
) -> TrainingStats {
    let started = Instant::now();
    let mut stats = TrainingStats {
        agent: agent.name().to_string(),
        best_reward: f64::NEG_INFINITY,
        ..Default::default()
    };
    let mut reward_sum = 0.0;
    let mut net_sum = 0.0;
    let mut loss_sum = 0.0;
    let mut loss_count = 0u64;

    for episode in 0..episodes {
        if cancel.is_cancelled() {
            stats.interrupted = true;
            log::info!(
                "[train] {} cancelled after {} episodes",
                agent.name(),
                stats.episodes
            );
            break;
        }

        let mut state = env.reset(None);
        let start = env.episode_start();
        telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .log_episode_start(agent.name(), config_id, episode, start);

        let mut total = 0.0;
        let mut net = 0.0;
        let mut steps = 0usize;
        let mut reason = None;
        loop {
            let action = agent.act(&state);
            let result = match env.step(&action) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("[train] {} step failed: {}", agent.name(), e);
                    break;
                }
            };
            let loss = agent.learn(&state, &action, &result);
            if let Some(l) = loss {
                loss_sum += l as f64;
                loss_count += 1;
            }
            telemetry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .log_step(agent.name(), episode, action.key(), loss, &result.info);

            total += result.reward;
            net += result.info.net;
            steps += 1;
            if result.done {
                reason = result.info.termination_reason.clone();
                break;
            }
            match result.next_state {
                Some(next) => state = next,
                None => break,
            }
        }
        agent.end_episode();

        stats.episodes += 1;
        stats.steps += steps as u64;
        reward_sum += total;
        net_sum += net;
        stats.best_reward = stats.best_reward.max(total);
        if net > 0.0 {
            stats.wins += 1;
        }
        telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .log_episode_end(
                agent.name(),
                config_id,
                episode,
                start,
                steps,
                total,
                net,
                agent.epsilon(),
                reason,
            );
    }

    if stats.episodes > 0 {
        let n = stats.episodes as f64;
        stats.mean_reward = reward_sum / n;
        stats.mean_net_reward = net_sum / n;
        stats.win_rate = stats.wins as f64 / n;
    } else {
        stats.best_reward = 0.0;
    }
    if loss_count > 0 {
        stats.mean_loss = Some(loss_sum / loss_count as f64);
    }
    stats.final_epsilon = agent.epsilon();
    agent.fill_stats(&mut stats);
    stats.duration_ms = started.elapsed().as_millis() as u64;
    telemetry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .flush();

    log::info!(
        "[train] {} {}: episodes={} steps={} mean_reward={:.4} win_rate={:.3} epsilon={:.4}",
        config_id,
        stats.agent,
        stats.episodes,
        stats.steps,
        stats.mean_reward,
        stats.win_rate,
        stats.final_epsilon
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, LotteryConfig};
    use crate::history::synthetic_history;
    use crate::rl::hot_cold::FrequencyHotCold;
    use crate::rl::observation::FeatureRanges;
    use crate::rl::reward::RewardModel;

    fn env(cfg: &EngineConfig, lottery: LotteryConfig) -> Environment {
        Environment::new(
            lottery,
            cfg.env.clone(),
            synthetic_history(&lottery, 400, 4),
            RewardModel::new(lottery, cfg.reward.clone()),
            Arc::new(FrequencyHotCold::default()),
            1,
        )
        .unwrap()
    }

    #[test]
    fn tabular_stats_count_episodes_and_wins() {
        let cfg = EngineConfig::for_testing();
        let lottery = LotteryConfig::mini();
        let ranges = FeatureRanges::new(&lottery, &cfg.env);
        let mut agent = TabularAgent::new(lottery, cfg.tabular.clone(), ranges, 1);
        let mut e = env(&cfg, lottery);
        let telemetry = Mutex::new(TrainingTelemetry::disabled());

        let stats = run_training(&mut agent, &mut e, 12, &CancelToken::new(), &telemetry, "t");
        assert_eq!(stats.episodes, 12);
        assert!(stats.steps >= 12);
        assert!(stats.wins <= stats.episodes);
        assert!((stats.win_rate - stats.wins as f64 / 12.0).abs() < 1e-12);
        assert!(!stats.interrupted);
        assert!(stats.table_size.unwrap_or(0) > 0);
        assert!(stats.final_epsilon < 1.0);
    }

    #[test]
    fn cancelled_token_stops_before_first_episode() {
        let cfg = EngineConfig::for_testing();
        let lottery = LotteryConfig::mini();
        let ranges = FeatureRanges::new(&lottery, &cfg.env);
        let mut agent = TabularAgent::new(lottery, cfg.tabular.clone(), ranges, 1);
        let mut e = env(&cfg, lottery);
        let telemetry = Mutex::new(TrainingTelemetry::disabled());
        let cancel = CancelToken::new();
        cancel.cancel();

        let stats = run_training(&mut agent, &mut e, 5, &cancel, &telemetry, "t");
        assert_eq!(stats.episodes, 0);
        assert!(stats.interrupted);
        assert_eq!(agent.episodes(), 0);
    }

    #[test]
    fn approx_agent_learns_during_training() {
        let cfg = EngineConfig::for_testing();
        let lottery = LotteryConfig::mini();
        let ranges = FeatureRanges::new(&lottery, &cfg.env);
        let mut agent = FunctionApproxAgent::new(lottery, cfg.approx.clone(), ranges, 2).unwrap();
        let mut e = env(&cfg, lottery);
        let telemetry = Mutex::new(TrainingTelemetry::disabled());

        let stats = run_training(&mut agent, &mut e, 6, &CancelToken::new(), &telemetry, "t");
        assert_eq!(stats.episodes, 6);
        assert!(stats.learn_steps > 0);
        assert!(stats.mean_loss.is_some());
        assert!(stats.buffer_size.unwrap_or(0) >= 16);
    }
}
