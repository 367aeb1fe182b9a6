use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::evaluator::EvaluatorPolicy;
use crate::prompts::PromptBinding;
use crate::rbac::RbacConfig;

/// Escalation daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier of this daemon instance; used in MQTT topics
    pub daemon_id: String,

    /// Trading agents whose levels this daemon manages
    #[serde(default)]
    pub agents: Vec<String>,

    /// MQTT broker configuration
    pub mqtt: MqttConfig,

    /// Orchestrator API configuration
    pub orchestrator: OrchestratorConfig,

    /// Evaluation tunables
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Operator roles and user bindings
    #[serde(default)]
    pub rbac: RbacConfig,

    /// Per-level prompt template ids
    #[serde(default)]
    pub prompts: Vec<PromptBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Seconds between evaluation cycles
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,
    /// Minimum seconds between a transition and the next promotion.
    /// Deliberately has no default.
    pub promotion_cooldown_secs: u64,
    #[serde(default = "default_max_demotion_steps")]
    pub max_demotion_steps: u32,
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `transitions.jsonl`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// JSON level catalog; the standard ladder is used when absent
    #[serde(default)]
    pub levels_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Orchestrator REST API
    Http,
    /// In-process trackers fed through the `record_trade` command
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_mode")]
    pub mode: TelemetryMode,
    /// Equity baseline for drawdown in local mode
    #[serde(default = "default_starting_equity")]
    pub starting_equity: f64,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            levels_path: None,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            mode: default_telemetry_mode(),
            starting_equity: default_starting_equity(),
            max_history: default_max_history(),
        }
    }
}

fn default_keep_alive() -> u64 {
    30
}

fn default_evaluation_interval() -> u64 {
    300
}

fn default_max_demotion_steps() -> u32 {
    1
}

fn default_snapshot_timeout() -> u64 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_telemetry_mode() -> TelemetryMode {
    TelemetryMode::Http
}

fn default_starting_equity() -> f64 {
    10_000.0
}

fn default_max_history() -> usize {
    5_000
}

impl EscalationConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs.max(1))
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs.max(1))
    }

    pub fn evaluator_policy(&self) -> EvaluatorPolicy {
        EvaluatorPolicy {
            promotion_cooldown: Duration::from_secs(self.promotion_cooldown_secs),
            max_demotion_steps: self.max_demotion_steps.max(1),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            daemon_id = %config.daemon_id,
            agents = config.agents.len(),
            cooldown_secs = config.escalation.promotion_cooldown_secs,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Configuration for a daemon managing a single agent. The cooldown has
    /// no default and must be supplied.
    pub fn default_for_agent(agent_id: String, promotion_cooldown_secs: u64) -> Self {
        Self {
            daemon_id: format!("escalation-{}", agent_id),
            agents: vec![agent_id],
            mqtt: MqttConfig {
                broker: "localhost".to_string(),
                port: 1883,
                keep_alive_secs: 30,
            },
            orchestrator: OrchestratorConfig {
                url: "http://localhost:8420".to_string(),
            },
            escalation: EscalationConfig {
                evaluation_interval_secs: default_evaluation_interval(),
                promotion_cooldown_secs,
                max_demotion_steps: default_max_demotion_steps(),
                snapshot_timeout_secs: default_snapshot_timeout(),
            },
            storage: StorageConfig::default(),
            telemetry: TelemetryConfig::default(),
            rbac: RbacConfig::default(),
            prompts: Vec::new(),
        }
    }
}
