// src/rl/telemetry.rs
//
// JSONL training telemetry.
//
// One line per record:
// - episode start / end markers (agent, start position, totals, epsilon)
// - per-step records with the reward breakdown
//
// Disabled unless LOTTERY_RL_TELEMETRY_MODE=jsonl. Write failures disable the
// sink instead of failing the training run.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::observation::STATE_VERSION;
use super::sim_env::StepInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeMarkerType {
    Start,
    End,
}

/// Episode boundary marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeMarker {
    pub agent: String,
    pub config_id: String,
    pub episode_id: u64,
    pub marker_type: EpisodeMarkerType,
    pub start_position: usize,
    pub state_version: u32,
    /// End markers only.
    pub steps: Option<usize>,
    pub total_reward: Option<f64>,
    pub net_reward: Option<f64>,
    pub epsilon: Option<f64>,
    pub termination_reason: Option<String>,
}

/// One environment step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub agent: String,
    pub episode_id: u64,
    pub action_key: String,
    pub reward: f64,
    pub loss: Option<f32>,
    pub info: StepInfo,
}

/// Training telemetry sink.
///
/// Controlled by environment variables:
/// - LOTTERY_RL_TELEMETRY_MODE: "off" (default) or "jsonl"
/// - LOTTERY_RL_TELEMETRY_PATH: path to JSONL file
pub struct TrainingTelemetry {
    enabled: bool,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    log_steps: bool,
}

impl Default for TrainingTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TrainingTelemetry {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: None,
            writer: None,
            log_steps: false,
        }
    }

    pub fn from_env() -> Self {
        let enabled = env::var("LOTTERY_RL_TELEMETRY_MODE")
            .map(|s| s.eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false);
        let path = env::var("LOTTERY_RL_TELEMETRY_PATH")
            .ok()
            .map(PathBuf::from);
        if enabled && path.is_none() {
            log::warn!("[telemetry] LOTTERY_RL_TELEMETRY_MODE=jsonl without LOTTERY_RL_TELEMETRY_PATH; disabled");
        }
        let log_steps = env::var("LOTTERY_RL_TELEMETRY_STEPS")
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            enabled: enabled && path.is_some(),
            path,
            writer: None,
            log_steps,
        }
    }

    /// Enabled sink writing to `path`.
    pub fn enable(path: PathBuf) -> Self {
        Self {
            enabled: true,
            path: Some(path),
            writer: None,
            log_steps: false,
        }
    }

    pub fn with_steps(mut self, log_steps: bool) -> Self {
        self.log_steps = log_steps;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if !self.enabled {
            return None;
        }
        if self.writer.is_none() {
            let path = self.path.as_ref()?;
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer.as_mut()
    }

    fn write_json(&mut self, value: &JsonValue) {
        let Some(writer) = self.ensure_writer() else {
            return;
        };
        let Ok(line) = serde_json::to_string(value) else {
            return;
        };
        if writeln!(writer, "{}", line).is_err() {
            log::warn!("[telemetry] write failed; disabling sink");
            self.enabled = false;
            self.writer = None;
        }
    }

    pub fn log_episode_start(&mut self, agent: &str, config_id: &str, episode_id: u64, start: usize) {
        if !self.enabled {
            return;
        }
        let marker = EpisodeMarker {
            agent: agent.to_string(),
            config_id: config_id.to_string(),
            episode_id,
            marker_type: EpisodeMarkerType::Start,
            start_position: start,
            state_version: STATE_VERSION,
            steps: None,
            total_reward: None,
            net_reward: None,
            epsilon: None,
            termination_reason: None,
        };
        let value = serde_json::to_value(&marker).unwrap_or_default();
        self.write_json(&value);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_episode_end(
        &mut self,
        agent: &str,
        config_id: &str,
        episode_id: u64,
        start: usize,
        steps: usize,
        total_reward: f64,
        net_reward: f64,
        epsilon: f64,
        termination_reason: Option<String>,
    ) {
        if !self.enabled {
            return;
        }
        let marker = EpisodeMarker {
            agent: agent.to_string(),
            config_id: config_id.to_string(),
            episode_id,
            marker_type: EpisodeMarkerType::End,
            start_position: start,
            state_version: STATE_VERSION,
            steps: Some(steps),
            total_reward: Some(total_reward),
            net_reward: Some(net_reward),
            epsilon: Some(epsilon),
            termination_reason,
        };
        let value = serde_json::to_value(&marker).unwrap_or_default();
        self.write_json(&value);
    }

    pub fn log_step(&mut self, agent: &str, episode_id: u64, action_key: String, loss: Option<f32>, info: &StepInfo) {
        if !self.enabled || !self.log_steps {
            return;
        }
        let record = StepRecord {
            agent: agent.to_string(),
            episode_id,
            action_key,
            reward: info.reward_components.total,
            loss,
            info: info.clone(),
        };
        let value = serde_json::to_value(&record).unwrap_or_default();
        self.write_json(&value);
    }

    pub fn flush(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.flush();
        }
    }
}

impl Drop for TrainingTelemetry {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_writes_nothing() {
        let mut t = TrainingTelemetry::disabled();
        t.log_episode_start("tabular", "cfg", 0, 10);
        assert!(!t.is_enabled());
        assert!(t.writer.is_none());
    }

    #[test]
    fn episode_markers_are_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("telemetry.jsonl");
        {
            let mut t = TrainingTelemetry::enable(path.clone()).with_steps(true);
            t.log_episode_start("tabular", "f1-4of20_f2-4of20", 1, 25);
            t.log_step("tabular", 1, "1,2,3,4|1,2,3,4".to_string(), None, &StepInfo::default());
            t.log_episode_end("tabular", "f1-4of20_f2-4of20", 1, 25, 3, -6.0, -6.0, 0.9, Some("end_of_data".into()));
        }
        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<JsonValue> = contents
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["marker_type"], "start");
        assert_eq!(lines[2]["marker_type"], "end");
        assert_eq!(lines[2]["steps"], 3);
        assert_eq!(lines[1]["action_key"], "1,2,3,4|1,2,3,4");
    }
}
