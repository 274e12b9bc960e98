//! Reinforcement-learning engine for two-field lottery draws.
//!
//! A replayed draw history is the environment; two learners are trained on
//! it per lottery configuration and then used to propose tickets.
//!
//! # Layout
//!
//! - **rl**: environment, reward model, encoders, tabular and
//!   function-approximation learners, frozen policies.
//! - **training**: the shared episode loop and cancellation.
//! - **evaluation**: held-out scoring of frozen policies.
//! - **persistence**: checksummed, atomically written agent blobs.
//! - **manager**: per-configuration registry tying it all together.
//!
//! None of this predicts draws; expected net reward stays negative.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod history;
pub mod logging;
pub mod manager;
pub mod persistence;
pub mod rl;
pub mod training;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::{
    ApproxConfig, EngineConfig, EnsembleConfig, EnvConfig, EpsilonSchedule, LotteryConfig,
    TabularConfig,
};
pub use error::{EngineError, EngineResult};
pub use evaluation::{EvaluationMetrics, EvaluationReport};
pub use history::{DrawRecord, RawDrawRow};
pub use manager::{
    AgentPair, AgentStatus, Manager, Prediction, Strategy, TrainingBudget, TrainingHandle,
    TrainingReport,
};
pub use persistence::{AgentKind, ModelStore};
pub use rl::{
    Action, DecisionMethod, Environment, FunctionApproxAgent, Policy, RewardModel, RewardWeights,
    State, TabularAgent,
};
pub use training::{CancelToken, TrainingStats};
