// src/rl/policy.rs
//
// Policy interface for greedy (frozen) decision making.
//
// Training uses each agent's own epsilon-greedy path; evaluation and
// generation go through `Policy`, which never learns and never touches the
// agent's RNG. Randomness needed for fallbacks comes from the caller.

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{EnsembleConfig, LotteryConfig};
use crate::error::EngineResult;

use super::action_encoding::Action;
use super::approx::FunctionApproxAgent;
use super::observation::State;
use super::tabular::TabularAgent;

/// Which path produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    Tabular,
    FunctionApprox,
    Random,
    Fixed,
}

impl DecisionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMethod::Tabular => "tabular",
            DecisionMethod::FunctionApprox => "function_approx",
            DecisionMethod::Random => "random",
            DecisionMethod::Fixed => "fixed",
        }
    }
}

/// A chosen action plus calibrated confidence in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub method: DecisionMethod,
    /// Raw value estimate, if the method has one.
    pub value: Option<f64>,
    pub confidence: f64,
}

impl Decision {
    pub fn random(lottery: &LotteryConfig, rng: &mut ChaCha8Rng) -> Self {
        Self {
            action: Action::random(lottery, rng),
            method: DecisionMethod::Random,
            value: None,
            confidence: 0.0,
        }
    }
}

/// Frozen decision maker.
pub trait Policy {
    fn name(&self) -> &str;

    fn decide(&mut self, state: &State, rng: &mut ChaCha8Rng) -> EngineResult<Decision>;
}

/// Logistic squash of a raw value into [0, 1].
pub fn calibrate(value: f64, scale: f64, offset: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let scale = if scale.abs() < f64::EPSILON { 1.0 } else { scale };
    (1.0 / (1.0 + (-(value - offset) / scale).exp())).clamp(0.0, 1.0)
}

/// Greedy tabular policy; random when the state is unseen or the agent is untrained.
pub struct TabularPolicy<'a> {
    pub agent: &'a TabularAgent,
    pub calibration: &'a EnsembleConfig,
}

impl Policy for TabularPolicy<'_> {
    fn name(&self) -> &str {
        "tabular"
    }

    fn decide(&mut self, state: &State, rng: &mut ChaCha8Rng) -> EngineResult<Decision> {
        Ok(tabular_decision(self.agent, self.calibration, state, rng))
    }
}

/// Greedy network policy; random when the agent is untrained or inference fails.
pub struct ApproxPolicy<'a> {
    pub agent: &'a FunctionApproxAgent,
    pub calibration: &'a EnsembleConfig,
}

impl Policy for ApproxPolicy<'_> {
    fn name(&self) -> &str {
        "function_approx"
    }

    fn decide(&mut self, state: &State, rng: &mut ChaCha8Rng) -> EngineResult<Decision> {
        Ok(approx_decision(self.agent, self.calibration, state, rng))
    }
}

/// Picks whichever learner reports the higher calibrated confidence.
/// Ties go to the tabular learner.
pub struct EnsemblePolicy<'a> {
    pub tabular: &'a TabularAgent,
    pub approx: &'a FunctionApproxAgent,
    pub calibration: &'a EnsembleConfig,
}

impl Policy for EnsemblePolicy<'_> {
    fn name(&self) -> &str {
        "ensemble"
    }

    fn decide(&mut self, state: &State, rng: &mut ChaCha8Rng) -> EngineResult<Decision> {
        let t = tabular_decision(self.tabular, self.calibration, state, rng);
        let a = approx_decision(self.approx, self.calibration, state, rng);
        Ok(ensemble_pick(t, a))
    }
}

/// Deterministic ensemble selection.
pub fn ensemble_pick(tabular: Decision, approx: Decision) -> Decision {
    if approx.confidence > tabular.confidence {
        approx
    } else {
        tabular
    }
}

pub fn tabular_decision(
    agent: &TabularAgent,
    calibration: &EnsembleConfig,
    state: &State,
    rng: &mut ChaCha8Rng,
) -> Decision {
    if !agent.is_trained() {
        return Decision::random(agent.lottery(), rng);
    }
    match agent.best_action(state) {
        Some((action, value)) => Decision {
            action,
            method: DecisionMethod::Tabular,
            value: Some(value),
            confidence: calibrate(value, calibration.tabular_scale, calibration.tabular_offset),
        },
        None => Decision::random(agent.lottery(), rng),
    }
}

pub fn approx_decision(
    agent: &FunctionApproxAgent,
    calibration: &EnsembleConfig,
    state: &State,
    rng: &mut ChaCha8Rng,
) -> Decision {
    if !agent.is_trained() {
        return Decision::random(agent.lottery(), rng);
    }
    match agent.greedy(state, rng) {
        Ok((action, value)) => Decision {
            action,
            method: DecisionMethod::FunctionApprox,
            value: Some(value),
            confidence: calibrate(value, calibration.approx_scale, calibration.approx_offset),
        },
        Err(e) => {
            log::debug!("[policy] network inference failed, using random: {}", e);
            Decision::random(agent.lottery(), rng)
        }
    }
}

/// Always plays the same action.
#[derive(Debug, Clone)]
pub struct FixedPolicy {
    pub action: Action,
}

impl Policy for FixedPolicy {
    fn name(&self) -> &str {
        "fixed"
    }

    fn decide(&mut self, _state: &State, _rng: &mut ChaCha8Rng) -> EngineResult<Decision> {
        Ok(Decision {
            action: self.action.clone(),
            method: DecisionMethod::Fixed,
            value: None,
            confidence: 1.0,
        })
    }
}

/// Plays uniformly random actions.
#[derive(Debug, Clone)]
pub struct RandomPolicy {
    pub lottery: LotteryConfig,
}

impl Policy for RandomPolicy {
    fn name(&self) -> &str {
        "random"
    }

    fn decide(&mut self, _state: &State, rng: &mut ChaCha8Rng) -> EngineResult<Decision> {
        Ok(Decision::random(&self.lottery, rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(method: DecisionMethod, confidence: f64) -> Decision {
        Decision {
            action: Action {
                field1: vec![1],
                field2: vec![1],
            },
            method,
            value: None,
            confidence,
        }
    }

    #[test]
    fn calibrate_is_bounded_and_monotone() {
        let mut prev = 0.0;
        for v in [-100.0, -2.0, -1.0, 0.0, 1.0, 5.0, 100.0] {
            let c = calibrate(v, 1.0, -1.0);
            assert!((0.0..=1.0).contains(&c));
            assert!(c >= prev);
            prev = c;
        }
        assert!((calibrate(-1.0, 1.0, -1.0) - 0.5).abs() < 1e-12);
        assert_eq!(calibrate(f64::NAN, 1.0, 0.0), 0.0);
    }

    #[test]
    fn ensemble_ties_prefer_tabular() {
        let t = decision(DecisionMethod::Tabular, 0.5);
        let a = decision(DecisionMethod::FunctionApprox, 0.5);
        assert_eq!(ensemble_pick(t.clone(), a.clone()).method, DecisionMethod::Tabular);

        let a = decision(DecisionMethod::FunctionApprox, 0.6);
        assert_eq!(ensemble_pick(t, a).method, DecisionMethod::FunctionApprox);
    }
}
