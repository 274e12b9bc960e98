// src/rl/approx.rs
//
// Function-approximation agent (DQN-style).
//
// - epsilon-greedy acting; greedy = top-K numbers per field from the field
//   heads, valued by Q(s, slot(action)) from the value head
// - experience replay with a minimum occupancy before learning
// - Bellman targets from the target network, hard-synced every N steps
// - transient numeric failures skip the learning step instead of aborting

use std::collections::VecDeque;

use rand::seq::index::sample_weighted;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{ApproxConfig, LotteryConfig};
use crate::error::{EngineError, EngineResult};

use super::action_encoding::{materialize_top_k, Action};
use super::network::{NetworkDims, NetworkSnapshot, QNetwork, TrainBatch};
use super::observation::{FeatureRanges, State, STATE_DIM};
use super::replay::{Experience, ReplayBuffer};

/// Recent losses kept for stats.
const LOSS_TRACE_LEN: usize = 256;

pub struct FunctionApproxAgent {
    lottery: LotteryConfig,
    cfg: ApproxConfig,
    ranges: FeatureRanges,
    network: QNetwork,
    replay: ReplayBuffer,
    rng: ChaCha8Rng,
    epsilon: f64,
    episodes: u64,
    learn_steps: u64,
    skipped_steps: u64,
    losses: VecDeque<f32>,
}

/// Persisted form; the replay buffer is not included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproxSnapshot {
    pub lottery: LotteryConfig,
    pub cfg: ApproxConfig,
    pub ranges: FeatureRanges,
    pub network: NetworkSnapshot,
    pub rng: ChaCha8Rng,
    pub epsilon: f64,
    pub episodes: u64,
    pub learn_steps: u64,
    pub skipped_steps: u64,
    pub losses: Vec<f32>,
}

impl FunctionApproxAgent {
    pub fn new(
        lottery: LotteryConfig,
        cfg: ApproxConfig,
        ranges: FeatureRanges,
        seed: u64,
    ) -> EngineResult<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let dims = NetworkDims {
            input: STATE_DIM,
            hidden: cfg.hidden_dim,
            action_slots: cfg.action_slots,
            field1: lottery.field1_max,
            field2: lottery.field2_max,
        };
        let network = QNetwork::new(dims, &mut rng)?;
        Ok(Self {
            lottery,
            replay: ReplayBuffer::new(cfg.replay_capacity),
            epsilon: cfg.epsilon.start,
            cfg,
            ranges,
            network,
            rng,
            episodes: 0,
            learn_steps: 0,
            skipped_steps: 0,
            losses: VecDeque::new(),
        })
    }

    pub fn lottery(&self) -> &LotteryConfig {
        &self.lottery
    }

    /// Epsilon-greedy choice; inference failures degrade to a random action.
    pub fn choose_action(&mut self, state: &State) -> Action {
        if self.rng.gen_bool(self.epsilon.clamp(0.0, 1.0)) {
            return Action::random(&self.lottery, &mut self.rng);
        }
        let features = state.to_features(&self.ranges);
        let result = self.network.predict(&features).map(|out| {
            materialize_top_k(&out.field1_probs, &out.field2_probs, &self.lottery, &mut self.rng)
        });
        match result {
            Ok(action) => action,
            Err(e) => {
                log::debug!("[approx] greedy failed, acting randomly: {}", e);
                Action::random(&self.lottery, &mut self.rng)
            }
        }
    }

    /// Greedy action and its Q-value. `rng` is only used to pad fields when
    /// the distributions are unusable.
    pub fn greedy<R: Rng + ?Sized>(&self, state: &State, rng: &mut R) -> EngineResult<(Action, f64)> {
        let out = self.network.predict(&state.to_features(&self.ranges))?;
        let action = materialize_top_k(&out.field1_probs, &out.field2_probs, &self.lottery, rng);
        let value = out
            .q
            .get(action.slot(self.cfg.action_slots))
            .copied()
            .ok_or_else(|| EngineError::computation("action slot out of range"))?;
        Ok((action, value as f64))
    }

    /// Ticket sampled from the field distributions without replacement,
    /// valued like `greedy`. Used to diversify multi-ticket generation.
    pub fn sample_action<R: Rng + ?Sized>(&self, state: &State, rng: &mut R) -> EngineResult<(Action, f64)> {
        let out = self.network.predict(&state.to_features(&self.ranges))?;
        let field1 = sample_field(&out.field1_probs, self.lottery.field1_size, rng)?;
        let field2 = sample_field(&out.field2_probs, self.lottery.field2_size, rng)?;
        let action = Action::new(field1, field2, &self.lottery)?;
        let value = out
            .q
            .get(action.slot(self.cfg.action_slots))
            .copied()
            .ok_or_else(|| EngineError::computation("action slot out of range"))?;
        Ok((action, value as f64))
    }

    /// Q-value estimate for an arbitrary action.
    pub fn value_of(&self, state: &State, action: &Action) -> EngineResult<f64> {
        let out = self.network.predict(&state.to_features(&self.ranges))?;
        out.q
            .get(action.slot(self.cfg.action_slots))
            .map(|v| *v as f64)
            .ok_or_else(|| EngineError::computation("action slot out of range"))
    }

    /// Store a transition and run one learning step when the buffer is warm.
    pub fn observe(&mut self, exp: Experience) -> Option<f32> {
        self.replay.push(exp);
        self.learn()
    }

    /// One learning step; None when skipped (cold buffer or transient failure).
    pub fn learn(&mut self) -> Option<f32> {
        let needed = self.cfg.min_replay.max(2);
        if self.replay.len() < needed {
            return None;
        }
        match self.learn_inner() {
            Ok(loss) => {
                self.learn_steps += 1;
                if self.losses.len() == LOSS_TRACE_LEN {
                    self.losses.pop_front();
                }
                self.losses.push_back(loss);
                if self.learn_steps % self.cfg.target_sync_interval.max(1) == 0 {
                    if let Err(e) = self.network.sync_target() {
                        log::warn!("[approx] target sync failed: {}", e);
                    }
                }
                Some(loss)
            }
            Err(e) if e.is_transient() => {
                self.skipped_steps += 1;
                log::debug!("[approx] learning step skipped: {}", e);
                None
            }
            Err(e) => {
                self.skipped_steps += 1;
                log::warn!("[approx] learning step failed: {}", e);
                None
            }
        }
    }

    fn learn_inner(&mut self) -> EngineResult<f32> {
        let batch: Vec<Experience> = self
            .replay
            .sample(self.cfg.batch_size, &mut self.rng)
            .into_iter()
            .cloned()
            .collect();
        let train = self.build_batch(&batch)?;
        self.network.train_step(
            &train,
            self.cfg.learning_rate,
            self.cfg.max_grad_norm,
            self.cfg.policy_loss_weight,
        )
    }

    fn build_batch(&self, batch: &[Experience]) -> EngineResult<TrainBatch> {
        let (n1, n2) = (self.lottery.field1_max, self.lottery.field2_max);

        // Bootstrap only rows that continue.
        let continuing: Vec<usize> = batch
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.done && e.next_state.is_some())
            .map(|(i, _)| i)
            .collect();
        let next_rows: Vec<Vec<f32>> = continuing
            .iter()
            .filter_map(|&i| batch[i].next_state.as_ref())
            .map(|s| s.to_features(&self.ranges))
            .collect();
        let next_max = self.network.target_max_q(&next_rows)?;
        let mut bootstrap = vec![0f32; batch.len()];
        for (&i, q) in continuing.iter().zip(next_max) {
            bootstrap[i] = q;
        }

        let mean_reward = batch.iter().map(|e| e.reward).sum::<f64>() / batch.len() as f64;
        let std_reward = (batch
            .iter()
            .map(|e| (e.reward - mean_reward).powi(2))
            .sum::<f64>()
            / batch.len() as f64)
            .sqrt();

        let mut train = TrainBatch::default();
        for (i, e) in batch.iter().enumerate() {
            train.states.extend(e.state.to_features(&self.ranges));
            train.slots.push(e.action.slot(self.cfg.action_slots));
            let target = e.reward + self.cfg.gamma * bootstrap[i] as f64;
            if !target.is_finite() {
                return Err(EngineError::computation("non-finite Bellman target"));
            }
            train.targets.push(target as f32);

            let mut m1 = vec![0f32; n1];
            for &n in &e.action.field1 {
                if let Some(slot) = (n as usize).checked_sub(1).and_then(|i| m1.get_mut(i)) {
                    *slot = 1.0;
                }
            }
            let mut m2 = vec![0f32; n2];
            for &n in &e.action.field2 {
                if let Some(slot) = (n as usize).checked_sub(1).and_then(|i| m2.get_mut(i)) {
                    *slot = 1.0;
                }
            }
            train.field1_chosen.extend(m1);
            train.field2_chosen.extend(m2);

            let adv = if std_reward > 1e-8 {
                (e.reward - mean_reward) / std_reward
            } else {
                0.0
            };
            train.advantages.push(adv as f32);
        }
        Ok(train)
    }

    /// Decay epsilon and count the episode.
    pub fn end_episode(&mut self) {
        self.epsilon = self.cfg.epsilon.next(self.epsilon);
        self.episodes += 1;
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn learn_steps(&self) -> u64 {
        self.learn_steps
    }

    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }

    pub fn buffer_len(&self) -> usize {
        self.replay.len()
    }

    pub fn losses(&self) -> impl Iterator<Item = f32> + '_ {
        self.losses.iter().copied()
    }

    pub fn is_trained(&self) -> bool {
        self.episodes > 0
    }

    pub fn snapshot(&self) -> EngineResult<ApproxSnapshot> {
        Ok(ApproxSnapshot {
            lottery: self.lottery,
            cfg: self.cfg.clone(),
            ranges: self.ranges.clone(),
            network: self.network.snapshot()?,
            rng: self.rng.clone(),
            epsilon: self.epsilon,
            episodes: self.episodes,
            learn_steps: self.learn_steps,
            skipped_steps: self.skipped_steps,
            losses: self.losses.iter().copied().collect(),
        })
    }

    /// Rebuild from a snapshot; the replay buffer starts empty.
    pub fn from_snapshot(snap: ApproxSnapshot, lottery: &LotteryConfig) -> EngineResult<Self> {
        if snap.lottery != *lottery {
            return Err(EngineError::invalid_config(
                "lottery",
                format!(
                    "blob is for {}, expected {}",
                    snap.lottery.config_id(),
                    lottery.config_id()
                ),
            ));
        }
        let dims = snap.network.dims;
        if dims.input != STATE_DIM
            || dims.field1 != lottery.field1_max
            || dims.field2 != lottery.field2_max
            || dims.action_slots != snap.cfg.action_slots
        {
            return Err(EngineError::invalid_config(
                "network",
                format!("dimensions {:?} do not fit {}", dims, lottery.config_id()),
            ));
        }
        let network = QNetwork::from_snapshot(&snap.network)?;
        Ok(Self {
            lottery: snap.lottery,
            replay: ReplayBuffer::new(snap.cfg.replay_capacity),
            cfg: snap.cfg,
            ranges: snap.ranges,
            network,
            rng: snap.rng,
            epsilon: snap.epsilon,
            episodes: snap.episodes,
            learn_steps: snap.learn_steps,
            skipped_steps: snap.skipped_steps,
            losses: snap.losses.into_iter().collect(),
        })
    }

    pub fn to_payload(&self) -> EngineResult<String> {
        serde_json::to_string(&self.snapshot()?).map_err(|e| EngineError::computation(e.to_string()))
    }

    pub fn from_payload(payload: &str, lottery: &LotteryConfig) -> EngineResult<Self> {
        let snap: ApproxSnapshot =
            serde_json::from_str(payload).map_err(|e| EngineError::computation(e.to_string()))?;
        Self::from_snapshot(snap, lottery)
    }
}

fn sample_field<R: Rng + ?Sized>(probs: &[f32], k: usize, rng: &mut R) -> EngineResult<Vec<u32>> {
    sample_weighted(rng, probs.len(), |i| probs[i].max(1e-12) as f64, k)
        .map(|idx| idx.into_iter().map(|i| i as u32 + 1).collect())
        .map_err(|e| EngineError::computation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, EnvConfig};

    fn agent() -> FunctionApproxAgent {
        let lottery = LotteryConfig::mini();
        let cfg = EngineConfig::for_testing().approx;
        let ranges = FeatureRanges::new(&lottery, &EnvConfig::default());
        FunctionApproxAgent::new(lottery, cfg, ranges, 17).unwrap()
    }

    fn state(pos: f64) -> State {
        State {
            position_index: pos,
            ..State::neutral()
        }
    }

    fn experience(a: &mut FunctionApproxAgent, pos: f64, reward: f64) -> Experience {
        let action = Action::random(&LotteryConfig::mini(), &mut a.rng);
        Experience {
            state: state(pos),
            action,
            reward,
            next_state: Some(state(pos + 1.0)),
            done: false,
        }
    }

    #[test]
    fn greedy_actions_are_valid() {
        let a = agent();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let (action, value) = a.greedy(&state(10.0), &mut rng).unwrap();
        assert!(action.is_valid(a.lottery()));
        assert!(value.is_finite());
    }

    #[test]
    fn learning_waits_for_min_replay() {
        let mut a = agent();
        let needed = a.cfg.min_replay.max(2);
        for i in 0..needed - 1 {
            let e = experience(&mut a, i as f64, -2.0);
            assert!(a.observe(e).is_none());
        }
        let e = experience(&mut a, 99.0, 5.0);
        assert!(a.observe(e).is_some());
        assert_eq!(a.learn_steps(), 1);
    }

    #[test]
    fn target_network_syncs_every_interval() {
        let lottery = LotteryConfig::mini();
        let mut cfg = EngineConfig::for_testing().approx;
        cfg.target_sync_interval = 3;
        cfg.min_replay = 4;
        cfg.batch_size = 4;
        cfg.learning_rate = 1e-2;
        let ranges = FeatureRanges::new(&lottery, &EnvConfig::default());
        let mut a = FunctionApproxAgent::new(lottery, cfg, ranges, 23).unwrap();

        let rows = vec![state(7.0).to_features(&a.ranges)];
        let online_max = |a: &FunctionApproxAgent| {
            a.network
                .predict(&rows[0])
                .unwrap()
                .q
                .into_iter()
                .fold(f32::NEG_INFINITY, f32::max)
        };
        let target_max = |a: &FunctionApproxAgent| a.network.target_max_q(&rows).unwrap()[0];

        for i in 0..3 {
            let e = experience(&mut a, i as f64, 4.0);
            assert!(a.observe(e).is_none());
        }
        let initial = target_max(&a);

        for step in 1..=2u64 {
            let e = experience(&mut a, 10.0 + step as f64, 4.0);
            assert!(a.observe(e).is_some());
            assert_eq!(a.learn_steps(), step);
            assert_eq!(target_max(&a), initial, "target moved at step {}", step);
        }
        assert_ne!(online_max(&a), initial);

        let e = experience(&mut a, 13.0, 4.0);
        assert!(a.observe(e).is_some());
        assert_eq!(a.learn_steps(), 3);
        let synced = target_max(&a);
        assert!((synced - online_max(&a)).abs() < 1e-6);

        for step in 4..=5u64 {
            let e = experience(&mut a, 10.0 + step as f64, 4.0);
            assert!(a.observe(e).is_some());
            assert_eq!(target_max(&a), synced, "target moved at step {}", step);
        }
        let e = experience(&mut a, 16.0, 4.0);
        assert!(a.observe(e).is_some());
        assert_eq!(a.learn_steps(), 6);
        assert!((target_max(&a) - online_max(&a)).abs() < 1e-6);
    }

    #[test]
    fn snapshot_round_trip_preserves_greedy_choice() {
        let mut a = agent();
        for i in 0..40 {
            let e = experience(&mut a, i as f64, if i % 7 == 0 { 3.0 } else { -2.0 });
            a.observe(e);
        }
        a.end_episode();

        let restored = FunctionApproxAgent::from_payload(&a.to_payload().unwrap(), a.lottery()).unwrap();
        assert_eq!(restored.buffer_len(), 0);
        assert_eq!(restored.learn_steps(), a.learn_steps());
        let s = state(500.0);
        let mut r1 = ChaCha8Rng::seed_from_u64(5);
        let mut r2 = ChaCha8Rng::seed_from_u64(5);
        assert_eq!(a.greedy(&s, &mut r1).unwrap(), restored.greedy(&s, &mut r2).unwrap());
    }

    #[test]
    fn sampled_actions_are_valid() {
        let a = agent();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for i in 0..20 {
            let (action, value) = a.sample_action(&state(i as f64), &mut rng).unwrap();
            assert!(action.is_valid(a.lottery()));
            assert!(value.is_finite());
        }
    }

    #[test]
    fn payload_for_other_lottery_is_rejected() {
        let a = agent();
        let payload = a.to_payload().unwrap();
        assert!(FunctionApproxAgent::from_payload(&payload, &LotteryConfig::euro_style()).is_err());
    }
}
