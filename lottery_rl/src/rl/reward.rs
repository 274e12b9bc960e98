// src/rl/reward.rs
//
// Reward model: prize-table lookup plus optional shaping terms.
//
//   r = prize(m1, m2) - ticket_cost                       (core)
//       + near_miss + partial_credit + hot_alignment
//       - cold_penalty + pattern + diversity
//       + exploration                                     (shaping)
//
// The prize table must encode a negative expected value:
//   Σ P(m1, m2) · prize(m1, m2) < ticket_cost
// Malformed or missing draws never raise; they yield -ticket_cost.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::LotteryConfig;
use crate::error::{EngineError, EngineResult};
use crate::history::DrawRecord;

use super::action_encoding::Action;
use super::hot_cold::HotColdSets;

/// Weights for reward shaping. A zero weight disables the term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    /// Stake per ticket.
    pub ticket_cost: f64,
    /// Fraction of the stake returned on average by the derived prize table (< 1).
    pub return_to_player: f64,
    /// Bonus when field1 matches are exactly one short of a full match.
    pub near_miss: f64,
    /// Bonus per matched fraction of each field.
    pub partial_credit: f64,
    /// Bonus scaled by overlap with the hot sets.
    pub hot_alignment: f64,
    /// Penalty per cold number beyond half the ticket.
    pub cold_penalty: f64,
    /// Bonus per recognized pattern in field1.
    pub pattern: f64,
    /// Bonus for balanced low/high spread and parity.
    pub diversity: f64,
    /// Scale of the 1/sqrt(visits + 1) exploration bonus.
    pub exploration: f64,
    /// One-time bonus for a never-seen (state, action) pair.
    pub novelty: f64,
    /// Upper bound of the total exploration term.
    pub exploration_cap: f64,
    /// Buckets per feature for the exploration signature.
    pub exploration_bins: usize,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            ticket_cost: 2.0,
            return_to_player: 0.5,
            near_miss: 0.5,
            partial_credit: 0.2,
            hot_alignment: 0.05,
            cold_penalty: 0.05,
            pattern: 0.02,
            diversity: 0.05,
            exploration: 0.1,
            novelty: 0.05,
            exploration_cap: 0.2,
            exploration_bins: 5,
        }
    }
}

impl RewardWeights {
    /// Core reward only: every shaping term disabled.
    pub fn unshaped() -> Self {
        Self {
            near_miss: 0.0,
            partial_credit: 0.0,
            hot_alignment: 0.0,
            cold_penalty: 0.0,
            pattern: 0.0,
            diversity: 0.0,
            exploration: 0.0,
            novelty: 0.0,
            exploration_cap: 0.0,
            ..Self::default()
        }
    }
}

/// Payout per (field1 matches, field2 matches) tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrizeTable {
    pub ticket_cost: f64,
    /// `payouts[m1][m2]`, dimensions (k1 + 1) x (k2 + 1).
    pub payouts: Vec<Vec<f64>>,
}

impl PrizeTable {
    /// Derive a table from tier probabilities.
    ///
    /// Winning tiers are those with `m1 + m2 >= ceil((k1 + k2) / 2)`. Each is
    /// paid inversely to its probability, the table is made monotone in both
    /// match counts and then rescaled to `return_to_player * ticket_cost`.
    pub fn for_config(cfg: &LotteryConfig, ticket_cost: f64, return_to_player: f64) -> Self {
        let (k1, k2) = (cfg.field1_size, cfg.field2_size);
        let p1 = hypergeometric(cfg.field1_max, k1);
        let p2 = hypergeometric(cfg.field2_max, k2);
        let threshold = (k1 + k2).div_ceil(2).max(1);

        let tiers = (0..=k1)
            .flat_map(|m1| (0..=k2).map(move |m2| (m1, m2)))
            .filter(|(m1, m2)| m1 + m2 >= threshold && p1[*m1] * p2[*m2] > 0.0)
            .count()
            .max(1) as f64;

        let mut raw = vec![vec![0.0; k2 + 1]; k1 + 1];
        for m1 in 0..=k1 {
            for m2 in 0..=k2 {
                let p = p1[m1] * p2[m2];
                if m1 + m2 >= threshold && p > 0.0 {
                    raw[m1][m2] = 1.0 / (p * tiers);
                }
            }
        }
        for m1 in 0..=k1 {
            for m2 in 0..=k2 {
                let mut v = raw[m1][m2];
                if m1 > 0 {
                    v = v.max(raw[m1 - 1][m2]);
                }
                if m2 > 0 {
                    v = v.max(raw[m1][m2 - 1]);
                }
                raw[m1][m2] = v;
            }
        }

        let ev: f64 = (0..=k1)
            .flat_map(|m1| (0..=k2).map(move |m2| (m1, m2)))
            .map(|(m1, m2)| p1[m1] * p2[m2] * raw[m1][m2])
            .sum();
        let target = ticket_cost * return_to_player.clamp(0.0, 0.99);
        let scale = if ev > 0.0 { target / ev } else { 0.0 };
        for row in &mut raw {
            for v in row.iter_mut() {
                *v *= scale;
            }
        }

        Self {
            ticket_cost,
            payouts: raw,
        }
    }

    /// Explicit table; rejected unless its expected value is below the stake.
    pub fn from_tiers(
        cfg: &LotteryConfig,
        ticket_cost: f64,
        payouts: Vec<Vec<f64>>,
    ) -> EngineResult<Self> {
        if payouts.len() != cfg.field1_size + 1
            || payouts.iter().any(|row| row.len() != cfg.field2_size + 1)
        {
            return Err(EngineError::invalid_config(
                "prize_table",
                "dimensions must be (field1_size + 1) x (field2_size + 1)",
            ));
        }
        if payouts.iter().flatten().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(EngineError::invalid_config(
                "prize_table",
                "payouts must be finite and non-negative",
            ));
        }
        let table = Self {
            ticket_cost,
            payouts,
        };
        let ev = table.expected_value(cfg);
        if ev >= ticket_cost {
            return Err(EngineError::invalid_config(
                "prize_table",
                format!("expected payout {:.4} is not below ticket cost {:.4}", ev, ticket_cost),
            ));
        }
        Ok(table)
    }

    pub fn prize(&self, m1: usize, m2: usize) -> f64 {
        self.payouts
            .get(m1)
            .and_then(|row| row.get(m2))
            .copied()
            .unwrap_or(0.0)
    }

    /// Σ P(m1, m2) · prize(m1, m2) for a uniformly random ticket.
    pub fn expected_value(&self, cfg: &LotteryConfig) -> f64 {
        let p1 = hypergeometric(cfg.field1_max, cfg.field1_size);
        let p2 = hypergeometric(cfg.field2_max, cfg.field2_size);
        let mut ev = 0.0;
        for (m1, pm1) in p1.iter().enumerate() {
            for (m2, pm2) in p2.iter().enumerate() {
                ev += pm1 * pm2 * self.prize(m1, m2);
            }
        }
        ev
    }
}

/// P(m matches) for picking `k` of `n` when `k` of `n` are drawn.
fn hypergeometric(n: usize, k: usize) -> Vec<f64> {
    let total = binomial(n, k);
    (0..=k)
        .map(|m| {
            if k - m > n - k {
                0.0
            } else {
                binomial(k, m) * binomial(n - k, k - m) / total
            }
        })
        .collect()
}

fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// Breakdown of one reward computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardComponents {
    pub matches_field1: usize,
    pub matches_field2: usize,
    pub prize: f64,
    /// prize - ticket_cost.
    pub base: f64,
    pub near_miss: f64,
    pub partial_credit: f64,
    pub hot_alignment: f64,
    /// Stored as a positive magnitude; subtracted from the total.
    pub cold_penalty: f64,
    pub pattern: f64,
    pub diversity: f64,
    pub exploration: f64,
    pub total: f64,
    /// False when the draw was missing or malformed.
    pub valid_draw: bool,
}

impl RewardComponents {
    fn defensive(ticket_cost: f64) -> Self {
        Self {
            base: -ticket_cost,
            total: -ticket_cost,
            ..Default::default()
        }
    }
}

/// Scored outcome of one ticket against one draw (no shaping, no state).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub matches_field1: usize,
    pub matches_field2: usize,
    pub prize: f64,
    /// prize - ticket_cost.
    pub net: f64,
}

/// Computes rewards and tracks exploration visit counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardModel {
    lottery: LotteryConfig,
    weights: RewardWeights,
    table: PrizeTable,
    visits: HashMap<String, u64>,
}

impl RewardModel {
    pub fn new(lottery: LotteryConfig, weights: RewardWeights) -> Self {
        let table = PrizeTable::for_config(&lottery, weights.ticket_cost, weights.return_to_player);
        Self::with_table(lottery, weights, table)
    }

    pub fn with_table(lottery: LotteryConfig, weights: RewardWeights, table: PrizeTable) -> Self {
        Self {
            lottery,
            weights,
            table,
            visits: HashMap::new(),
        }
    }

    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    pub fn prize_table(&self) -> &PrizeTable {
        &self.table
    }

    pub fn ticket_cost(&self) -> f64 {
        self.table.ticket_cost
    }

    /// Number of distinct (state, action) signatures seen.
    pub fn visited_pairs(&self) -> usize {
        self.visits.len()
    }

    /// Resume exploration counting from an earlier run's visits.
    pub fn with_visits(mut self, visits: HashMap<String, u64>) -> Self {
        self.visits = visits;
        self
    }

    /// Hand the visit counts back, leaving this model with none.
    pub fn take_visits(&mut self) -> HashMap<String, u64> {
        std::mem::take(&mut self.visits)
    }

    /// Core outcome: matches, prize and net. None for missing/malformed draws.
    pub fn outcome(&self, action: &Action, draw: Option<&DrawRecord>) -> Option<Outcome> {
        let draw = draw.filter(|d| d.is_valid_for(&self.lottery))?;
        let (m1, m2) = action.matches(&draw.field1_numbers, &draw.field2_numbers);
        let prize = self.table.prize(m1, m2);
        Some(Outcome {
            matches_field1: m1,
            matches_field2: m2,
            prize,
            net: prize - self.table.ticket_cost,
        })
    }

    /// Table-driven reward component for given match counts.
    pub fn table_reward(&self, m1: usize, m2: usize) -> f64 {
        self.table.prize(m1, m2) - self.table.ticket_cost
    }

    /// Full shaped reward. Updates exploration visit counts for `state_key`.
    pub fn compute(
        &mut self,
        action: &Action,
        draw: Option<&DrawRecord>,
        hot_cold: &HotColdSets,
        state_key: &str,
    ) -> RewardComponents {
        let Some(outcome) = self.outcome(action, draw) else {
            return RewardComponents::defensive(self.table.ticket_cost);
        };
        let w = &self.weights;
        let cfg = &self.lottery;
        let (m1, m2) = (outcome.matches_field1, outcome.matches_field2);

        let near_miss = if cfg.field1_size >= 1 && m1 + 1 == cfg.field1_size {
            w.near_miss
        } else {
            0.0
        };
        let partial_credit = w.partial_credit
            * (m1 as f64 / cfg.field1_size as f64 + m2 as f64 / cfg.field2_size as f64);

        let picks = (cfg.field1_size + cfg.field2_size) as f64;
        let hot_overlap = overlap(&action.field1, &hot_cold.hot_field1)
            + overlap(&action.field2, &hot_cold.hot_field2);
        let hot_alignment = w.hot_alignment * hot_overlap as f64 / picks;

        let cold_overlap = overlap(&action.field1, &hot_cold.cold_field1)
            + overlap(&action.field2, &hot_cold.cold_field2);
        let half = (cfg.field1_size + cfg.field2_size) / 2;
        let cold_penalty = w.cold_penalty * cold_overlap.saturating_sub(half) as f64;

        let pattern = w.pattern * pattern_count(&action.field1, cfg.field1_max) as f64;
        let diversity = w.diversity * balance_score(&action.field1, cfg.field1_max);

        let exploration = self.exploration_bonus(state_key, action);

        let total = outcome.net + near_miss + partial_credit + hot_alignment - cold_penalty
            + pattern
            + diversity
            + exploration;

        RewardComponents {
            matches_field1: m1,
            matches_field2: m2,
            prize: outcome.prize,
            base: outcome.net,
            near_miss,
            partial_credit,
            hot_alignment,
            cold_penalty,
            pattern,
            diversity,
            exploration,
            total,
            valid_draw: true,
        }
    }

    /// `exploration / sqrt(visits + 1)` plus a one-time novelty bonus, capped.
    /// Counts the visit.
    pub fn exploration_bonus(&mut self, state_key: &str, action: &Action) -> f64 {
        let w = &self.weights;
        if w.exploration <= 0.0 && w.novelty <= 0.0 {
            return 0.0;
        }
        let signature = format!("{}#{}", state_key, action.key());
        let visits = self.visits.entry(signature).or_insert(0);
        let mut bonus = w.exploration / ((*visits as f64) + 1.0).sqrt();
        if *visits == 0 {
            bonus += w.novelty;
        }
        *visits += 1;
        bonus.min(w.exploration_cap).max(0.0)
    }
}

fn overlap(numbers: &[u32], set: &[u32]) -> usize {
    numbers.iter().filter(|n| set.contains(n)).count()
}

/// Arithmetic progression, run of 3+ consecutive numbers, symmetric spread.
fn pattern_count(sorted: &[u32], max: usize) -> usize {
    let mut count = 0;
    if sorted.len() >= 3 {
        let diff = sorted[1] as i64 - sorted[0] as i64;
        if sorted.windows(2).all(|w| w[1] as i64 - w[0] as i64 == diff) {
            count += 1;
        }
        let mut run = 1;
        let mut best = 1;
        for w in sorted.windows(2) {
            run = if w[1] == w[0] + 1 { run + 1 } else { 1 };
            best = best.max(run);
        }
        if best >= 3 {
            count += 1;
        }
    }
    if sorted.len() >= 2 {
        let mirror = max as u32 + 1;
        if sorted
            .iter()
            .all(|&n| mirror >= n && sorted.contains(&(mirror - n)))
        {
            count += 1;
        }
    }
    count
}

/// 1.0 when low/high and even/odd splits are both balanced, 0.5 for one.
fn balance_score(numbers: &[u32], max: usize) -> f64 {
    if numbers.is_empty() {
        return 0.0;
    }
    let len = numbers.len() as f64;
    let low = numbers.iter().filter(|&&n| (n as usize) * 2 <= max).count() as f64 / len;
    let even = numbers.iter().filter(|&&n| n % 2 == 0).count() as f64 / len;
    let balanced = |f: f64| if (0.3..=0.7).contains(&f) { 0.5 } else { 0.0 };
    balanced(low) + balanced(even)
}
