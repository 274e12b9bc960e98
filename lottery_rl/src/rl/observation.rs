// src/rl/observation.rs
//
// State schema and state encoding.
//
// A State is the feature snapshot of the trailing draw window at one
// position of the history. It is encoded two ways:
// - `to_features()`: normalized, fixed-order f32 vector for the network
// - `discretize()`:  composite bucket key for the value table
//
// Both encodings depend only on the LotteryConfig / EnvConfig ranges, never
// on the particular history, so keys learned on one history stay valid when
// generating from another.

use serde::{Deserialize, Serialize};

use crate::config::{EnvConfig, LotteryConfig};

/// Current state schema version.
/// Increment when adding/removing/changing fields.
pub const STATE_VERSION: u32 = 1;

/// Number of features in `State::to_features()`.
pub const STATE_DIM: usize = 10;

/// Horizon used to normalize `position_index`.
pub const POSITION_HORIZON: f64 = 5_000.0;

/// Period of the `days_since_jackpot` placeholder signal.
pub const JACKPOT_PERIOD: usize = 100;

/// Feature snapshot of a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Distinct numbers seen in each field, summed.
    pub universe_length: f64,
    /// Fraction of drawn numbers that are even (0.5 when no data).
    pub parity_ratio: f64,
    /// Mean over appearing numbers of window_len / occurrences.
    pub mean_gap: f64,
    /// Mean occurrence count over appearing numbers.
    pub mean_frequency: f64,
    /// Size of the hot set reported by the hot/cold collaborator.
    pub hot_count: f64,
    /// Size of the cold set reported by the hot/cold collaborator.
    pub cold_count: f64,
    /// (latest sum - earliest sum) / sample_count over recent draws.
    pub sum_trend: f64,
    /// universe_length / (field1_max + field2_max).
    pub diversity_index: f64,
    /// position mod 100 (placeholder signal).
    pub days_since_jackpot: f64,
    /// Absolute position in the history.
    pub position_index: f64,
}

impl State {
    /// Fixed neutral state used for empty or invalid windows.
    pub fn neutral() -> Self {
        Self {
            universe_length: 0.0,
            parity_ratio: 0.5,
            mean_gap: 0.0,
            mean_frequency: 0.0,
            hot_count: 0.0,
            cold_count: 0.0,
            sum_trend: 0.0,
            diversity_index: 0.0,
            days_since_jackpot: 0.0,
            position_index: 0.0,
        }
    }

    /// Raw features in canonical order.
    pub fn raw_features(&self) -> [f64; STATE_DIM] {
        [
            self.universe_length,
            self.parity_ratio,
            self.mean_gap,
            self.mean_frequency,
            self.hot_count,
            self.cold_count,
            self.sum_trend,
            self.diversity_index,
            self.days_since_jackpot,
            self.position_index,
        ]
    }

    /// True when every feature is finite.
    pub fn is_finite(&self) -> bool {
        self.raw_features().iter().all(|v| v.is_finite())
    }

    /// Normalized [0, 1] feature vector for network input.
    pub fn to_features(&self, ranges: &FeatureRanges) -> Vec<f32> {
        self.raw_features()
            .iter()
            .zip(ranges.bounds.iter())
            .map(|(&v, &(lo, hi))| normalize_01(v, lo, hi) as f32)
            .collect()
    }

    /// Composite table key: each feature bucketed into `bins` buckets.
    pub fn discretize(&self, ranges: &FeatureRanges, bins: usize) -> String {
        let bins = bins.max(1);
        let buckets: Vec<String> = self
            .raw_features()
            .iter()
            .zip(ranges.bounds.iter())
            .map(|(&v, &(lo, hi))| {
                let b = (normalize_01(v, lo, hi) * bins as f64).floor() as usize;
                b.min(bins - 1).to_string()
            })
            .collect();
        buckets.join("-")
    }
}

/// Per-feature (min, max) bounds used for normalization and bucketing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRanges {
    pub bounds: [(f64, f64); STATE_DIM],
}

impl FeatureRanges {
    pub fn new(lottery: &LotteryConfig, env: &EnvConfig) -> Self {
        let span = lottery.number_span() as f64;
        let window = env.window.max(1) as f64;
        let picks = (lottery.field1_size + lottery.field2_size) as f64;
        let expected_freq = window * picks / span.max(1.0);
        let trend = (lottery.field1_size * lottery.field1_max) as f64
            / (2.0 * env.trend_samples.max(1) as f64);

        Self {
            bounds: [
                (0.0, span),
                (0.0, 1.0),
                (1.0, window),
                (0.0, (2.0 * expected_freq).max(1.0)),
                (0.0, span),
                (0.0, span),
                (-trend, trend),
                (0.0, 1.0),
                (0.0, JACKPOT_PERIOD as f64),
                (0.0, POSITION_HORIZON),
            ],
        }
    }
}

/// Normalize a value from [min, max] to [0, 1]; non-finite values map to 0.5.
#[inline]
fn normalize_01(val: f64, min: f64, max: f64) -> f64 {
    if max <= min || !val.is_finite() {
        return 0.5;
    }
    ((val - min) / (max - min)).clamp(0.0, 1.0)
}
