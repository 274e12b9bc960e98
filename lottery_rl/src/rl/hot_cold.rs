// src/rl/hot_cold.rs
//
// Hot/cold number hints.
//
// The trend analyzer that normally produces these hints lives outside this
// crate; the engine only consumes its output through `HotColdProvider`.
// `FrequencyHotCold` is the built-in provider (window frequency ranking) and
// `StaticHotCold` serves fixed, externally supplied sets.

use serde::{Deserialize, Serialize};

use crate::config::LotteryConfig;
use crate::history::DrawRecord;

/// Hot and cold sets per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotColdSets {
    pub hot_field1: Vec<u32>,
    pub hot_field2: Vec<u32>,
    pub cold_field1: Vec<u32>,
    pub cold_field2: Vec<u32>,
}

impl HotColdSets {
    pub fn hot_count(&self) -> usize {
        self.hot_field1.len() + self.hot_field2.len()
    }

    pub fn cold_count(&self) -> usize {
        self.cold_field1.len() + self.cold_field2.len()
    }
}

/// Source of hot/cold hints for a window of draws.
pub trait HotColdProvider: Send + Sync {
    fn hot_cold(&self, window: &[DrawRecord], cfg: &LotteryConfig) -> HotColdSets;
}

/// Ranks numbers by occurrence count inside the window: the top `fraction`
/// of each field is hot, the bottom `fraction` is cold.
#[derive(Debug, Clone)]
pub struct FrequencyHotCold {
    pub fraction: f64,
}

impl FrequencyHotCold {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
        }
    }
}

impl Default for FrequencyHotCold {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl HotColdProvider for FrequencyHotCold {
    fn hot_cold(&self, window: &[DrawRecord], cfg: &LotteryConfig) -> HotColdSets {
        if window.is_empty() {
            return HotColdSets::default();
        }
        let (hot_field1, cold_field1) = rank_field(
            window.iter().map(|d| d.field1_numbers.as_slice()),
            cfg.field1_max,
            self.fraction,
        );
        let (hot_field2, cold_field2) = rank_field(
            window.iter().map(|d| d.field2_numbers.as_slice()),
            cfg.field2_max,
            self.fraction,
        );
        HotColdSets {
            hot_field1,
            hot_field2,
            cold_field1,
            cold_field2,
        }
    }
}

fn rank_field<'a>(
    draws: impl Iterator<Item = &'a [u32]>,
    max: usize,
    fraction: f64,
) -> (Vec<u32>, Vec<u32>) {
    let mut counts = vec![0usize; max + 1];
    for numbers in draws {
        for &n in numbers {
            if let Some(c) = counts.get_mut(n as usize) {
                *c += 1;
            }
        }
    }
    let take = ((max as f64) * fraction).floor() as usize;
    if take == 0 {
        return (Vec::new(), Vec::new());
    }

    // Stable ordering: count, then number.
    let mut ranked: Vec<(u32, usize)> = (1..=max as u32).map(|n| (n, counts[n as usize])).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut hot: Vec<u32> = ranked.iter().take(take).map(|(n, _)| *n).collect();
    let mut cold: Vec<u32> = ranked.iter().rev().take(take).map(|(n, _)| *n).collect();
    hot.sort_unstable();
    cold.sort_unstable();
    (hot, cold)
}

/// Fixed sets supplied by an external analyzer.
#[derive(Debug, Clone, Default)]
pub struct StaticHotCold {
    pub sets: HotColdSets,
}

impl HotColdProvider for StaticHotCold {
    fn hot_cold(&self, _window: &[DrawRecord], _cfg: &LotteryConfig) -> HotColdSets {
        self.sets.clone()
    }
}
