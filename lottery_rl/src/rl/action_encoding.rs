// src/rl/action_encoding.rs
//
// Action representation and canonical encodings.
//
// - Action: one proposed combination (field1 + field2), always sorted
// - key()/from_key(): canonical string form used by the value table and
//   by persisted blobs
// - slot(): stable index into the network's fixed-size action embedding
// - materialize_top_k(): turn per-number probabilities into a valid action
//
// Invariant: no duplicates within a field, sizes and ranges match the
// LotteryConfig the action was built for.

use std::collections::HashSet;

use rand::seq::index::sample;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::LotteryConfig;
use crate::error::{EngineError, EngineResult};

/// One proposed combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Action {
    pub field1: Vec<u32>,
    pub field2: Vec<u32>,
}

impl Action {
    /// Build a validated action (numbers are sorted).
    pub fn new(field1: Vec<u32>, field2: Vec<u32>, cfg: &LotteryConfig) -> EngineResult<Self> {
        let mut action = Self { field1, field2 };
        action.field1.sort_unstable();
        action.field2.sort_unstable();
        action.validate(cfg)?;
        Ok(action)
    }

    /// Uniformly random valid action.
    pub fn random<R: Rng + ?Sized>(cfg: &LotteryConfig, rng: &mut R) -> Self {
        Self {
            field1: random_field(rng, cfg.field1_max, cfg.field1_size),
            field2: random_field(rng, cfg.field2_max, cfg.field2_size),
        }
    }

    pub fn validate(&self, cfg: &LotteryConfig) -> EngineResult<()> {
        validate_field("field1", &self.field1, cfg.field1_size, cfg.field1_max)?;
        validate_field("field2", &self.field2, cfg.field2_size, cfg.field2_max)
    }

    pub fn is_valid(&self, cfg: &LotteryConfig) -> bool {
        self.validate(cfg).is_ok()
    }

    /// Canonical key: "1,5,9,12|3,7".
    pub fn key(&self) -> String {
        format!("{}|{}", join_numbers(&self.field1), join_numbers(&self.field2))
    }

    /// Parse a canonical key and validate it against `cfg`.
    pub fn from_key(key: &str, cfg: &LotteryConfig) -> EngineResult<Self> {
        let (left, right) = key
            .split_once('|')
            .ok_or_else(|| EngineError::invalid_action(format!("missing separator in {key:?}")))?;
        let field1 = parse_numbers(left)?;
        let field2 = parse_numbers(right)?;
        Self::new(field1, field2, cfg)
    }

    /// Index into a fixed-size action embedding of `slots` entries.
    pub fn slot(&self, slots: usize) -> usize {
        (fnv1a64(&self.key()) % slots.max(1) as u64) as usize
    }

    /// Number of shared numbers per field with a drawn combination.
    pub fn matches(&self, field1: &[u32], field2: &[u32]) -> (usize, usize) {
        let m1 = self.field1.iter().filter(|n| field1.contains(n)).count();
        let m2 = self.field2.iter().filter(|n| field2.contains(n)).count();
        (m1, m2)
    }
}

fn random_field<R: Rng + ?Sized>(rng: &mut R, max: usize, size: usize) -> Vec<u32> {
    let mut nums: Vec<u32> = sample(rng, max, size.min(max))
        .into_iter()
        .map(|i| i as u32 + 1)
        .collect();
    nums.sort_unstable();
    nums
}

fn validate_field(name: &str, numbers: &[u32], size: usize, max: usize) -> EngineResult<()> {
    if numbers.len() != size {
        return Err(EngineError::invalid_action(format!(
            "{} has {} numbers, expected {}",
            name,
            numbers.len(),
            size
        )));
    }
    let mut seen = HashSet::with_capacity(size);
    for &n in numbers {
        if n == 0 || n as usize > max {
            return Err(EngineError::invalid_action(format!(
                "{} number {} outside 1..={}",
                name, n, max
            )));
        }
        if !seen.insert(n) {
            return Err(EngineError::invalid_action(format!(
                "{} repeats number {}",
                name, n
            )));
        }
    }
    Ok(())
}

fn join_numbers(numbers: &[u32]) -> String {
    numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_numbers(s: &str) -> EngineResult<Vec<u32>> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|tok| {
            tok.trim()
                .parse::<u32>()
                .map_err(|_| EngineError::invalid_action(format!("bad number {tok:?}")))
        })
        .collect()
}

/// FNV-1a 64-bit hash; stable across runs and platforms.
pub fn fnv1a64(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut h = FNV_OFFSET;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Pick the `k` highest-probability distinct numbers (1-based) from `probs`,
/// padding with uniformly random unused numbers when fewer than `k` usable
/// entries exist. Ties resolve toward the lower number.
pub fn top_k_numbers<R: Rng + ?Sized>(probs: &[f32], k: usize, max: usize, rng: &mut R) -> Vec<u32> {
    let mut ranked: Vec<(usize, f32)> = probs
        .iter()
        .copied()
        .enumerate()
        .take(max)
        .filter(|(_, p)| p.is_finite())
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut chosen: Vec<u32> = ranked.iter().take(k).map(|(i, _)| *i as u32 + 1).collect();

    if chosen.len() < k {
        let used: HashSet<u32> = chosen.iter().copied().collect();
        let mut unused: Vec<u32> = (1..=max as u32).filter(|n| !used.contains(n)).collect();
        unused.shuffle(rng);
        chosen.extend(unused.into_iter().take(k - chosen.len()));
    }
    chosen.sort_unstable();
    chosen
}

/// Materialize an action from per-field probability vectors.
pub fn materialize_top_k<R: Rng + ?Sized>(
    probs1: &[f32],
    probs2: &[f32],
    cfg: &LotteryConfig,
    rng: &mut R,
) -> Action {
    Action {
        field1: top_k_numbers(probs1, cfg.field1_size, cfg.field1_max, rng),
        field2: top_k_numbers(probs2, cfg.field2_size, cfg.field2_max, rng),
    }
}
