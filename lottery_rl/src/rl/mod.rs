// src/rl/mod.rs
//
// Learning core: environment, reward, encoders and the two learners.
//
// Key components:
// - Observation / ActionEncoding: state features and ticket encoding
// - HotCold: seam for the external hot/cold number analyzer
// - SimEnv: Gym-style replay of a draw history (reset, step)
// - Reward: prize table, shaping terms and exploration bonus
// - Tabular: epsilon-greedy Q-learning over discretized states
// - Approx: online + target network with experience replay
// - Policy: frozen decision makers for evaluation and generation
// - Telemetry: optional JSONL training records

pub mod action_encoding;
pub mod approx;
pub mod hot_cold;
pub mod network;
pub mod observation;
pub mod policy;
pub mod replay;
pub mod reward;
pub mod sim_env;
pub mod tabular;
pub mod telemetry;

// Re-exports for convenience
pub use action_encoding::{fnv1a64, Action};
pub use approx::{ApproxSnapshot, FunctionApproxAgent};
pub use hot_cold::{FrequencyHotCold, HotColdProvider, HotColdSets, StaticHotCold};
pub use network::{NetworkDims, QNetwork};
pub use observation::{FeatureRanges, State, STATE_DIM, STATE_VERSION};
pub use policy::{
    ApproxPolicy, Decision, DecisionMethod, EnsemblePolicy, FixedPolicy, Policy, RandomPolicy,
    TabularPolicy,
};
pub use replay::{Experience, ReplayBuffer};
pub use reward::{Outcome, PrizeTable, RewardComponents, RewardModel, RewardWeights};
pub use sim_env::{Environment, StepInfo, StepResult};
pub use tabular::TabularAgent;
pub use telemetry::TrainingTelemetry;
