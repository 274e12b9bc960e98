// src/manager.rs
//
// Registry of agent pairs keyed by lottery configuration id.
//
// Each config id owns one `AgentPair` (tabular + function approximation)
// behind its own mutex. Train / generate / evaluate / save / load on a key
// hold that key's lock for their whole duration; different keys proceed in
// parallel. The registry map itself is only locked long enough to look up or
// create a pair.
//
// Pairs are created lazily. Creation tries the blob store first; missing
// blobs leave the agents untrained. A blob that fails to load leaves them
// untrained too, and the error is kept on the pair and reported by `status`
// until a later load or save succeeds.
//
// Exploration visit counts live on the pair, one map per learner, so the
// novelty bonus is paid once per (state, action) signature across every
// `train` call in this process. They are not persisted.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, EnsembleConfig, EnvConfig, LotteryConfig};
use crate::error::{EngineError, EngineResult};
use crate::evaluation::{evaluate_policy, EvaluationMetrics, EvaluationReport};
use crate::history::{sanitize_records, DrawRecord};
use crate::persistence::{AgentKind, ModelStore};
use crate::rl::action_encoding::{fnv1a64, Action};
use crate::rl::approx::FunctionApproxAgent;
use crate::rl::hot_cold::{FrequencyHotCold, HotColdProvider};
use crate::rl::observation::{FeatureRanges, State};
use crate::rl::policy::{
    calibrate, ApproxPolicy, DecisionMethod, EnsemblePolicy, Policy, TabularPolicy,
};
use crate::rl::reward::RewardModel;
use crate::rl::sim_env::Environment;
use crate::rl::tabular::TabularAgent;
use crate::rl::telemetry::TrainingTelemetry;
use crate::training::{run_training, CancelToken, TrainingStats};

/// Salts separating the RNG streams derived from one config seed.
const SALT_TABULAR: u64 = 0x7461_6275;
const SALT_APPROX: u64 = 0x6170_7078;
const SALT_ENV: u64 = 0x656e_7600;
const SALT_GENERATE: u64 = 0x6765_6e00;
const SALT_EVALUATE: u64 = 0x6576_616c;

/// Random draws attempted per missing ticket before duplicates are allowed.
const UNIQUE_ATTEMPTS: usize = 32;

/// Which learner answers a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Tabular,
    FunctionApprox,
    Ensemble,
}

impl FromStr for Strategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tabular" | "q" | "q_learning" => Ok(Strategy::Tabular),
            "function_approx" | "approx" | "dqn" => Ok(Strategy::FunctionApprox),
            "ensemble" => Ok(Strategy::Ensemble),
            other => Err(EngineError::invalid_config(
                "strategy",
                format!("unknown strategy '{}'", other),
            )),
        }
    }
}

/// One proposed ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub field1: Vec<u32>,
    pub field2: Vec<u32>,
    pub method: DecisionMethod,
    /// Calibrated confidence in [0, 1]; 0 for random tickets.
    pub confidence: f64,
    /// Whether the learner(s) behind the strategy have been trained.
    pub trained: bool,
    pub tabular_trained: bool,
    pub approx_trained: bool,
}

impl Prediction {
    fn from_action(action: Action, method: DecisionMethod, confidence: f64, trained: Trained) -> Self {
        Self {
            field1: action.field1,
            field2: action.field2,
            method,
            confidence: confidence.clamp(0.0, 1.0),
            trained: trained.strategy,
            tabular_trained: trained.tabular,
            approx_trained: trained.approx,
        }
    }

    fn key(&self) -> String {
        format!("{:?}|{:?}", self.field1, self.field2)
    }
}

/// Training flags stamped on every prediction of one request.
#[derive(Debug, Clone, Copy)]
struct Trained {
    strategy: bool,
    tabular: bool,
    approx: bool,
}

/// Episode budgets for one `train` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingBudget {
    pub tabular_episodes: u64,
    pub approx_episodes: u64,
}

impl TrainingBudget {
    pub fn both(episodes: u64) -> Self {
        Self {
            tabular_episodes: episodes,
            approx_episodes: episodes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub config_id: String,
    pub tabular: TrainingStats,
    pub approx: TrainingStats,
    /// False when persisting the trained agents failed.
    pub saved: bool,
}

/// Read-only summary of a registered pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub config_id: String,
    pub tabular_trained: bool,
    pub approx_trained: bool,
    pub tabular_episodes: u64,
    pub approx_episodes: u64,
    pub tabular_epsilon: f64,
    pub approx_epsilon: f64,
    pub table_size: usize,
    pub buffer_size: usize,
    pub tabular_history: Vec<TrainingStats>,
    pub approx_history: Vec<TrainingStats>,
    pub evaluations: Vec<EvaluationReport>,
    /// Why the last automatic or explicit load failed, if it did.
    pub last_load_error: Option<String>,
}

/// Both learners for one lottery configuration plus their run history.
pub struct AgentPair {
    lottery: LotteryConfig,
    tabular: TabularAgent,
    approx: FunctionApproxAgent,
    tabular_history: Vec<TrainingStats>,
    approx_history: Vec<TrainingStats>,
    evaluations: Vec<EvaluationReport>,
    last_load_error: Option<String>,
    tabular_visits: HashMap<String, u64>,
    approx_visits: HashMap<String, u64>,
}

impl AgentPair {
    pub fn lottery(&self) -> &LotteryConfig {
        &self.lottery
    }

    pub fn tabular(&self) -> &TabularAgent {
        &self.tabular
    }

    pub fn approx(&self) -> &FunctionApproxAgent {
        &self.approx
    }

    pub fn last_load_error(&self) -> Option<&str> {
        self.last_load_error.as_deref()
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            config_id: self.lottery.config_id(),
            tabular_trained: self.tabular.is_trained(),
            approx_trained: self.approx.is_trained(),
            tabular_episodes: self.tabular.episodes(),
            approx_episodes: self.approx.episodes(),
            tabular_epsilon: self.tabular.epsilon(),
            approx_epsilon: self.approx.epsilon(),
            table_size: self.tabular.state_count(),
            buffer_size: self.approx.buffer_len(),
            tabular_history: self.tabular_history.clone(),
            approx_history: self.approx_history.clone(),
            evaluations: self.evaluations.clone(),
            last_load_error: self.last_load_error.clone(),
        }
    }
}

/// Handle to a background training run.
pub struct TrainingHandle {
    cancel: CancelToken,
    handle: JoinHandle<EngineResult<TrainingReport>>,
}

impl TrainingHandle {
    /// Request a stop at the next episode boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> EngineResult<TrainingReport> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::computation(format!(
                "training task failed: {}",
                e
            ))),
        }
    }
}

pub struct Manager {
    cfg: EngineConfig,
    store: ModelStore,
    hot_cold: Arc<dyn HotColdProvider>,
    registry: Mutex<HashMap<String, Arc<Mutex<AgentPair>>>>,
    telemetry: Mutex<TrainingTelemetry>,
}

impl Manager {
    /// Manager with the default frequency-based hot/cold provider and
    /// telemetry configured from the environment.
    pub fn new(mut cfg: EngineConfig) -> Self {
        cfg.sanitize();
        let store = ModelStore::new(cfg.model_dir.clone());
        let hot_cold: Arc<dyn HotColdProvider> =
            Arc::new(FrequencyHotCold::new(cfg.env.hot_cold_fraction));
        Self {
            cfg,
            store,
            hot_cold,
            registry: Mutex::new(HashMap::new()),
            telemetry: Mutex::new(TrainingTelemetry::from_env()),
        }
    }

    pub fn with_hot_cold(mut self, provider: Arc<dyn HotColdProvider>) -> Self {
        self.hot_cold = provider;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TrainingTelemetry) -> Self {
        self.telemetry = Mutex::new(telemetry);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Config ids currently held in the registry, sorted.
    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.registry).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Shared handle to the pair for `lottery`, creating it on first use.
    pub fn pair(&self, lottery: &LotteryConfig) -> EngineResult<Arc<Mutex<AgentPair>>> {
        lottery.validate()?;
        let id = lottery.config_id();
        let mut registry = lock(&self.registry);
        if let Some(pair) = registry.get(&id) {
            return Ok(Arc::clone(pair));
        }
        let pair = Arc::new(Mutex::new(self.create_pair(lottery, &id)?));
        registry.insert(id, Arc::clone(&pair));
        Ok(pair)
    }

    fn create_pair(&self, lottery: &LotteryConfig, id: &str) -> EngineResult<AgentPair> {
        let ranges = FeatureRanges::new(lottery, &self.cfg.env);
        let seed = self.seed_for(id);
        let mut pair = AgentPair {
            lottery: *lottery,
            tabular: TabularAgent::new(
                *lottery,
                self.cfg.tabular.clone(),
                ranges.clone(),
                seed ^ SALT_TABULAR,
            ),
            approx: FunctionApproxAgent::new(
                *lottery,
                self.cfg.approx.clone(),
                ranges,
                seed ^ SALT_APPROX,
            )?,
            tabular_history: Vec::new(),
            approx_history: Vec::new(),
            evaluations: Vec::new(),
            last_load_error: None,
            tabular_visits: HashMap::new(),
            approx_visits: HashMap::new(),
        };
        match self.load_into(&mut pair, id) {
            Ok(true) => log::info!("[manager] {} restored from {}", id, self.store.root().display()),
            Ok(false) => log::debug!("[manager] {} starts untrained", id),
            Err(e) => log::warn!("[manager] {} load failed, starting untrained: {}", id, e),
        }
        Ok(pair)
    }

    fn seed_for(&self, config_id: &str) -> u64 {
        self.cfg.seed ^ fnv1a64(config_id)
    }

    fn environment(
        &self,
        lottery: &LotteryConfig,
        env: EnvConfig,
        history: Vec<DrawRecord>,
        visits: HashMap<String, u64>,
        seed: u64,
    ) -> EngineResult<Environment> {
        Environment::new(
            *lottery,
            env,
            history,
            RewardModel::new(*lottery, self.cfg.reward.clone()).with_visits(visits),
            Arc::clone(&self.hot_cold),
            seed,
        )
    }

    /// Train both learners for `lottery` on `history`.
    pub fn train(
        &self,
        lottery: &LotteryConfig,
        history: &[DrawRecord],
        budget: TrainingBudget,
    ) -> EngineResult<TrainingReport> {
        self.train_with_cancel(lottery, history, budget, &CancelToken::new())
    }

    /// `train` with cooperative cancellation. A run cancelled before any
    /// episode completed returns `Cancelled`; otherwise partial stats are
    /// reported with `interrupted` set.
    pub fn train_with_cancel(
        &self,
        lottery: &LotteryConfig,
        history: &[DrawRecord],
        budget: TrainingBudget,
        cancel: &CancelToken,
    ) -> EngineResult<TrainingReport> {
        lottery.validate()?;
        let history = sanitize_records(history, lottery);
        let required = self.cfg.env.window + 1;
        if history.len() < required {
            return Err(EngineError::DataInsufficient {
                required,
                available: history.len(),
            });
        }

        let id = lottery.config_id();
        let pair = self.pair(lottery)?;
        let mut guard = lock(&pair);

        // Fresh episode starts on every run, reproducible for a given run index.
        let run_seed = self.seed_for(&id) ^ SALT_ENV ^ guard.tabular.episodes().rotate_left(17)
            ^ guard.approx.episodes();
        let mut tabular_env = self.environment(
            lottery,
            self.cfg.env.clone(),
            history.clone(),
            mem::take(&mut guard.tabular_visits),
            run_seed,
        )?;
        let mut approx_env = self.environment(
            lottery,
            self.cfg.env.clone(),
            history,
            mem::take(&mut guard.approx_visits),
            run_seed.rotate_left(1),
        )?;

        log::info!(
            "[manager] training {} on {} draws (tabular={} approx={} episodes)",
            id,
            tabular_env.history().len(),
            budget.tabular_episodes,
            budget.approx_episodes
        );

        let telemetry = &self.telemetry;
        let id_ref = id.as_str();
        let AgentPair {
            tabular, approx, ..
        } = &mut *guard;
        let tabular_env_ref = &mut tabular_env;
        let (tabular_stats, approx_stats) = std::thread::scope(|s| {
            let worker = s.spawn(move || {
                run_training(
                    tabular,
                    tabular_env_ref,
                    budget.tabular_episodes,
                    cancel,
                    telemetry,
                    id_ref,
                )
            });
            let approx_stats = run_training(
                approx,
                &mut approx_env,
                budget.approx_episodes,
                cancel,
                telemetry,
                id_ref,
            );
            (worker.join(), approx_stats)
        });
        guard.tabular_visits = tabular_env.reward_model_mut().take_visits();
        guard.approx_visits = approx_env.reward_model_mut().take_visits();
        let tabular_stats = tabular_stats
            .map_err(|_| EngineError::computation("tabular training thread panicked"))?;

        if cancel.is_cancelled() && tabular_stats.episodes == 0 && approx_stats.episodes == 0 {
            log::info!("[manager] training {} cancelled before any episode", id);
            return Err(EngineError::Cancelled);
        }

        guard.tabular_history.push(tabular_stats.clone());
        guard.approx_history.push(approx_stats.clone());

        if let Some(e) = &guard.last_load_error {
            log::warn!("[manager] {} replaces blobs that failed to load: {}", id, e);
        }
        let saved = match self.save_pair(&mut guard, &id) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("[manager] {} trained but not saved: {}", id, e);
                false
            }
        };

        Ok(TrainingReport {
            config_id: id,
            tabular: tabular_stats,
            approx: approx_stats,
            saved,
        })
    }

    /// Run `train` on a blocking tokio worker. Must be called from within a
    /// tokio runtime.
    pub fn spawn_training(
        self: &Arc<Self>,
        lottery: LotteryConfig,
        history: Vec<DrawRecord>,
        budget: TrainingBudget,
    ) -> TrainingHandle {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let manager = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || {
            manager.train_with_cancel(&lottery, &history, budget, &token)
        });
        TrainingHandle { cancel, handle }
    }

    /// Propose `count` tickets for the draw following `history`.
    ///
    /// Fails with `DataInsufficient` when the history is shorter than
    /// `window + 1`; callers may fall back to `generate_from_state` with
    /// `State::neutral()`. Untrained learners yield random tickets with zero
    /// confidence.
    pub fn generate(
        &self,
        lottery: &LotteryConfig,
        history: &[DrawRecord],
        count: usize,
        strategy: Strategy,
    ) -> EngineResult<Vec<Prediction>> {
        lottery.validate()?;
        let history = sanitize_records(history, lottery);
        let last_draw = history.last().map(|d| d.draw_number).unwrap_or(0);
        let salt = last_draw.rotate_left(32) ^ history.len() as u64;
        let mut env = self.environment(lottery, self.cfg.env.clone(), history, HashMap::new(), 0)?;
        let state = env.latest_state();
        self.generate_with_salt(lottery, &state, count, strategy, salt)
    }

    /// Propose `count` tickets for an explicit state.
    pub fn generate_from_state(
        &self,
        lottery: &LotteryConfig,
        state: &State,
        count: usize,
        strategy: Strategy,
    ) -> EngineResult<Vec<Prediction>> {
        lottery.validate()?;
        self.generate_with_salt(lottery, state, count, strategy, 0)
    }

    fn generate_with_salt(
        &self,
        lottery: &LotteryConfig,
        state: &State,
        count: usize,
        strategy: Strategy,
        salt: u64,
    ) -> EngineResult<Vec<Prediction>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let id = lottery.config_id();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed_for(&id) ^ SALT_GENERATE ^ salt);

        let pair = self.pair(lottery)?;
        let guard = lock(&pair);
        let cal = &self.cfg.ensemble;

        let tabular_trained = guard.tabular.is_trained();
        let approx_trained = guard.approx.is_trained();
        let trained = Trained {
            strategy: match strategy {
                Strategy::Tabular => tabular_trained,
                Strategy::FunctionApprox => approx_trained,
                Strategy::Ensemble => tabular_trained || approx_trained,
            },
            tabular: tabular_trained,
            approx: approx_trained,
        };
        let mut candidates = match strategy {
            Strategy::Tabular => tabular_candidates(&guard.tabular, cal, state, count, trained),
            Strategy::FunctionApprox => {
                approx_candidates(&guard.approx, cal, state, count, trained, &mut rng)
            }
            Strategy::Ensemble => {
                // Tabular first so a stable sort keeps it ahead on ties.
                let mut all = tabular_candidates(&guard.tabular, cal, state, count, trained);
                all.extend(approx_candidates(&guard.approx, cal, state, count, trained, &mut rng));
                all.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
                all
            }
        };

        let mut seen = HashSet::new();
        candidates.retain(|p| seen.insert(p.key()));
        candidates.truncate(count);

        let mut attempts = 0usize;
        while candidates.len() < count {
            let action = Action::random(lottery, &mut rng);
            let prediction = Prediction::from_action(action, DecisionMethod::Random, 0.0, trained);
            attempts += 1;
            if seen.insert(prediction.key()) || attempts > count * UNIQUE_ATTEMPTS {
                candidates.push(prediction);
            }
        }
        Ok(candidates)
    }

    /// Score both learners and the ensemble on a held-out history.
    ///
    /// Agents are used frozen; calling this twice gives identical metrics.
    pub fn evaluate(
        &self,
        lottery: &LotteryConfig,
        held_out: &[DrawRecord],
        window: Option<usize>,
    ) -> EngineResult<EvaluationReport> {
        lottery.validate()?;
        let id = lottery.config_id();
        let env_cfg = self.eval_env_config(window);
        let held_out = sanitize_records(held_out, lottery);

        let mut report = EvaluationReport {
            config_id: id.clone(),
            window: env_cfg.window,
            units: 0,
            tabular: EvaluationMetrics::empty("tabular"),
            approx: EvaluationMetrics::empty("function_approx"),
            ensemble: EvaluationMetrics::empty("ensemble"),
        };
        let mut env = match self.environment(lottery, env_cfg, held_out, HashMap::new(), 0) {
            Ok(env) => env,
            Err(EngineError::DataInsufficient { required, available }) => {
                log::info!(
                    "[manager] evaluate {}: {} of {} draws, nothing to score",
                    id,
                    available,
                    required
                );
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let pair = self.pair(lottery)?;
        let mut guard = lock(&pair);
        let seed = self.seed_for(&id) ^ SALT_EVALUATE;
        let cal = &self.cfg.ensemble;
        {
            let pair: &AgentPair = &guard;
            report.tabular = evaluate_policy(
                &mut TabularPolicy {
                    agent: &pair.tabular,
                    calibration: cal,
                },
                &mut env,
                seed,
            )?;
            report.approx = evaluate_policy(
                &mut ApproxPolicy {
                    agent: &pair.approx,
                    calibration: cal,
                },
                &mut env,
                seed,
            )?;
            report.ensemble = evaluate_policy(
                &mut EnsemblePolicy {
                    tabular: &pair.tabular,
                    approx: &pair.approx,
                    calibration: cal,
                },
                &mut env,
                seed,
            )?;
        }
        report.units = report.tabular.units;
        log::info!(
            "[manager] evaluated {} over {} draws: tabular win_rate={:.3} approx win_rate={:.3} ensemble win_rate={:.3}",
            id,
            report.units,
            report.tabular.win_rate,
            report.approx.win_rate,
            report.ensemble.win_rate
        );
        guard.evaluations.push(report.clone());
        Ok(report)
    }

    /// Score an arbitrary policy on a held-out history. Does not touch the
    /// registry.
    pub fn evaluate_policy(
        &self,
        lottery: &LotteryConfig,
        policy: &mut dyn Policy,
        held_out: &[DrawRecord],
        window: Option<usize>,
    ) -> EngineResult<EvaluationMetrics> {
        lottery.validate()?;
        let held_out = sanitize_records(held_out, lottery);
        match self.environment(lottery, self.eval_env_config(window), held_out, HashMap::new(), 0) {
            Ok(mut env) => evaluate_policy(policy, &mut env, self.seed_for(&lottery.config_id()) ^ SALT_EVALUATE),
            Err(EngineError::DataInsufficient { .. }) => Ok(EvaluationMetrics::empty(policy.name())),
            Err(e) => Err(e),
        }
    }

    fn eval_env_config(&self, window: Option<usize>) -> EnvConfig {
        let mut env = self.cfg.env.clone();
        env.window = window.unwrap_or(env.window).max(1);
        env.max_episode_steps = None;
        env
    }

    /// Persist both agents for `lottery`.
    pub fn save(&self, lottery: &LotteryConfig) -> EngineResult<Vec<PathBuf>> {
        let pair = self.pair(lottery)?;
        let mut guard = lock(&pair);
        self.save_pair(&mut guard, &lottery.config_id())
    }

    /// Reload both agents for `lottery` from the store. Returns false when no
    /// blob exists. On error the in-memory agents are left as they were.
    pub fn load(&self, lottery: &LotteryConfig) -> EngineResult<bool> {
        let pair = self.pair(lottery)?;
        let mut guard = lock(&pair);
        self.load_into(&mut guard, &lottery.config_id())
    }

    fn save_pair(&self, pair: &mut AgentPair, id: &str) -> EngineResult<Vec<PathBuf>> {
        let blobs = vec![
            (AgentKind::Tabular, pair.tabular.to_payload()?),
            (AgentKind::FunctionApprox, pair.approx.to_payload()?),
        ];
        let paths = self.store.save_all(id, blobs)?;
        pair.last_load_error = None;
        Ok(paths)
    }

    fn load_into(&self, pair: &mut AgentPair, id: &str) -> EngineResult<bool> {
        let result = self.decode_into(pair, id);
        pair.last_load_error = result.as_ref().err().map(|e| e.to_string());
        result
    }

    fn decode_into(&self, pair: &mut AgentPair, id: &str) -> EngineResult<bool> {
        // Decode both before swapping either in.
        let decode_err = |kind: AgentKind, e: EngineError| {
            EngineError::persistence(self.store.path_for(id, kind), e.to_string())
        };
        let tabular = match self.store.load(id, AgentKind::Tabular)? {
            Some(payload) => Some(
                TabularAgent::from_payload(&payload, &pair.lottery)
                    .map_err(|e| decode_err(AgentKind::Tabular, e))?,
            ),
            None => None,
        };
        let approx = match self.store.load(id, AgentKind::FunctionApprox)? {
            Some(payload) => Some(
                FunctionApproxAgent::from_payload(&payload, &pair.lottery)
                    .map_err(|e| decode_err(AgentKind::FunctionApprox, e))?,
            ),
            None => None,
        };
        let loaded = tabular.is_some() || approx.is_some();
        if let Some(agent) = tabular {
            pair.tabular = agent;
        }
        if let Some(agent) = approx {
            pair.approx = agent;
        }
        Ok(loaded)
    }

    pub fn status(&self, lottery: &LotteryConfig) -> EngineResult<AgentStatus> {
        let pair = self.pair(lottery)?;
        let guard = lock(&pair);
        Ok(guard.status())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn tabular_candidates(
    agent: &TabularAgent,
    cal: &EnsembleConfig,
    state: &State,
    count: usize,
    trained: Trained,
) -> Vec<Prediction> {
    if !agent.is_trained() {
        return Vec::new();
    }
    agent
        .ranked_actions(state, count)
        .into_iter()
        .map(|(action, value)| {
            let confidence = calibrate(value, cal.tabular_scale, cal.tabular_offset);
            Prediction::from_action(action, DecisionMethod::Tabular, confidence, trained)
        })
        .collect()
}

/// Greedy ticket first, then tickets sampled from the field distributions.
fn approx_candidates(
    agent: &FunctionApproxAgent,
    cal: &EnsembleConfig,
    state: &State,
    count: usize,
    trained: Trained,
    rng: &mut ChaCha8Rng,
) -> Vec<Prediction> {
    if !agent.is_trained() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(count);
    let mut seen = HashSet::new();
    let mut push = |action: Action, value: f64, out: &mut Vec<Prediction>| {
        if seen.insert(action.key()) {
            let confidence = calibrate(value, cal.approx_scale, cal.approx_offset);
            out.push(Prediction::from_action(
                action,
                DecisionMethod::FunctionApprox,
                confidence,
                trained,
            ));
        }
    };
    match agent.greedy(state, rng) {
        Ok((action, value)) => push(action, value, &mut out),
        Err(e) => {
            log::debug!("[manager] approx greedy failed: {}", e);
            return out;
        }
    }
    let mut attempts = 0usize;
    while out.len() < count && attempts < count * UNIQUE_ATTEMPTS {
        attempts += 1;
        match agent.sample_action(state, rng) {
            Ok((action, value)) => push(action, value, &mut out),
            Err(e) => {
                log::debug!("[manager] approx sampling failed: {}", e);
                break;
            }
        }
    }
    out
}
