// src/rl/tabular.rs
//
// Tabular epsilon-greedy Q-learning over discretized states.
//
//   Q(s, a) <- Q(s, a) + alpha * (target - Q(s, a))
//   target   = r                          (terminal)
//            = r + gamma * max_a' Q(s', a')  (0 when s' is unseen)
//
// The table maps state key -> action key -> value. When it holds more than
// `max_states` state entries, the least-visited fraction is evicted. All
// argmax lookups break ties on the action key so greedy play is reproducible.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{LotteryConfig, TabularConfig};
use crate::error::{EngineError, EngineResult};

use super::action_encoding::Action;
use super::observation::{FeatureRanges, State};

/// Value table plus training counters, RNG and epsilon; serializes as one blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabularAgent {
    lottery: LotteryConfig,
    cfg: TabularConfig,
    ranges: FeatureRanges,
    table: HashMap<String, HashMap<String, f64>>,
    visits: HashMap<String, u64>,
    epsilon: f64,
    episodes: u64,
    updates: u64,
    evicted: u64,
    rng: ChaCha8Rng,
}

impl TabularAgent {
    pub fn new(lottery: LotteryConfig, cfg: TabularConfig, ranges: FeatureRanges, seed: u64) -> Self {
        Self {
            lottery,
            epsilon: cfg.epsilon.start,
            cfg,
            ranges,
            table: HashMap::new(),
            visits: HashMap::new(),
            episodes: 0,
            updates: 0,
            evicted: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn lottery(&self) -> &LotteryConfig {
        &self.lottery
    }

    pub fn state_key(&self, state: &State) -> String {
        state.discretize(&self.ranges, self.cfg.bins)
    }

    /// Epsilon-greedy choice; unseen states fall back to a random action.
    pub fn choose_action(&mut self, state: &State) -> Action {
        if self.rng.gen_bool(self.epsilon.clamp(0.0, 1.0)) {
            return Action::random(&self.lottery, &mut self.rng);
        }
        match self.best_action(state) {
            Some((action, _)) => action,
            None => Action::random(&self.lottery, &mut self.rng),
        }
    }

    /// Highest-valued known action for `state`.
    pub fn best_action(&self, state: &State) -> Option<(Action, f64)> {
        self.ranked_actions(state, 1).into_iter().next()
    }

    /// Top `n` known actions by value (ties broken by key).
    pub fn ranked_actions(&self, state: &State, n: usize) -> Vec<(Action, f64)> {
        let Some(row) = self.table.get(&self.state_key(state)) else {
            return Vec::new();
        };
        let mut entries: Vec<(&String, f64)> = row.iter().map(|(k, v)| (k, *v)).collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .filter_map(|(k, v)| Action::from_key(k, &self.lottery).ok().map(|a| (a, v)))
            .take(n)
            .collect()
    }

    pub fn value_of(&self, state: &State, action: &Action) -> Option<f64> {
        self.table
            .get(&self.state_key(state))
            .and_then(|row| row.get(&action.key()))
            .copied()
    }

    fn max_value(&self, key: &str) -> f64 {
        self.table
            .get(key)
            .and_then(|row| row.values().copied().max_by(f64::total_cmp))
            .unwrap_or(0.0)
    }

    /// Bellman update; returns the TD error.
    pub fn learn(
        &mut self,
        state: &State,
        action: &Action,
        reward: f64,
        next_state: Option<&State>,
        done: bool,
    ) -> EngineResult<f64> {
        if !reward.is_finite() {
            return Err(EngineError::computation("non-finite reward"));
        }
        let key = self.state_key(state);
        let target = match next_state {
            Some(next) if !done => reward + self.cfg.gamma * self.max_value(&self.state_key(next)),
            _ => reward,
        };
        let alpha = self.cfg.learning_rate;
        let q = self
            .table
            .entry(key.clone())
            .or_default()
            .entry(action.key())
            .or_insert(0.0);
        let td = target - *q;
        *q += alpha * td;
        *self.visits.entry(key).or_insert(0) += 1;
        self.updates += 1;

        if self.table.len() > self.cfg.max_states {
            self.evict();
        }
        Ok(td)
    }

    /// Decay epsilon and count the episode.
    pub fn end_episode(&mut self) {
        self.epsilon = self.cfg.epsilon.next(self.epsilon);
        self.episodes += 1;
    }

    /// Drop the least-visited fraction of state entries.
    fn evict(&mut self) {
        let n = ((self.table.len() as f64) * self.cfg.eviction_fraction).ceil() as usize;
        let mut ranked: Vec<(String, u64)> = self
            .table
            .keys()
            .map(|k| (k.clone(), self.visits.get(k).copied().unwrap_or(0)))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        for (key, _) in ranked.into_iter().take(n.max(1)) {
            self.table.remove(&key);
            self.visits.remove(&key);
        }
        self.evicted += n as u64;
        log::debug!(
            "[tabular] evicted {} states, {} remain",
            n,
            self.table.len()
        );
    }

    pub fn state_count(&self) -> usize {
        self.table.len()
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn is_trained(&self) -> bool {
        self.episodes > 0
    }

    /// Serialized blob of the full agent.
    pub fn to_payload(&self) -> EngineResult<String> {
        serde_json::to_string(self).map_err(|e| EngineError::computation(e.to_string()))
    }

    /// Decode a blob produced by `to_payload`; the lottery shape must match.
    pub fn from_payload(payload: &str, lottery: &LotteryConfig) -> EngineResult<Self> {
        let agent: Self =
            serde_json::from_str(payload).map_err(|e| EngineError::computation(e.to_string()))?;
        if agent.lottery != *lottery {
            return Err(EngineError::invalid_config(
                "lottery",
                format!(
                    "blob is for {}, expected {}",
                    agent.lottery.config_id(),
                    lottery.config_id()
                ),
            ));
        }
        Ok(agent)
    }
}
