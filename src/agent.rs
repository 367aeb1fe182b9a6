use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::catalog::LevelCatalog;
use crate::config::{Config, TelemetryMode};
use crate::engine::EscalationEngine;
use crate::evaluator::Decision;
use crate::metrics::Metrics;
use crate::mqtt::{parse_command, MqttClient};
use crate::performance::LocalTelemetry;
use crate::prompts::PromptBindings;
use crate::rbac::RoleResolver;
use crate::telemetry::{HttpTelemetry, TelemetrySource};
use crate::transition_log::JsonlTransitionLog;

const HEARTBEAT_SECS: u64 = 30;

/// Daemon that evaluates its agents on a timer and serves operator commands
/// over MQTT.
pub struct EscalationAgent {
    pub config: Config,
    pub mqtt: MqttClient,
    pub metrics: Metrics,
    pub engine: Arc<EscalationEngine>,
    pub telemetry: Arc<dyn TelemetrySource>,
    /// Set when telemetry runs in-process; fed by `record_trade`
    pub local_telemetry: Option<Arc<LocalTelemetry>>,
    pub prompts: PromptBindings,
    pub(crate) shutdown_requested: bool,
}

/// Build the engine described by `config`: JSONL log under the data dir,
/// catalog from `levels_path` (standard ladder if the file does not exist
/// yet) and RBAC from the role table.
pub fn build_engine(config: &Config) -> Result<EscalationEngine, Box<dyn std::error::Error>> {
    let log = JsonlTransitionLog::open(&config.storage.data_dir)?;

    let catalog = match &config.storage.levels_path {
        Some(path) if path.exists() => LevelCatalog::load(path)?,
        Some(path) => {
            info!(path = %path.display(), "no level catalog on disk, seeding standard ladder");
            let catalog = LevelCatalog::standard();
            catalog.save(path)?;
            catalog
        }
        None => LevelCatalog::standard(),
    };

    if config.rbac.roles.is_empty() {
        warn!("no RBAC roles configured, privileged commands will be denied");
    }
    let permissions = Arc::new(RoleResolver::new(config.rbac.clone()));

    let mut engine = EscalationEngine::new(
        catalog,
        config.escalation.evaluator_policy(),
        Arc::new(log),
        permissions,
    );
    if let Some(path) = &config.storage.levels_path {
        engine = engine.with_catalog_path(path.clone());
    }
    Ok(engine)
}

impl EscalationAgent {
    pub async fn new(config: Config) -> Result<(Self, rumqttc::EventLoop), Box<dyn std::error::Error>> {
        let engine = Arc::new(build_engine(&config)?);

        let (telemetry, local_telemetry): (Arc<dyn TelemetrySource>, Option<Arc<LocalTelemetry>>) =
            match config.telemetry.mode {
                TelemetryMode::Http => {
                    let http = HttpTelemetry::new(&config.orchestrator.url, config.escalation.snapshot_timeout())?;
                    (Arc::new(http) as Arc<dyn TelemetrySource>, None)
                }
                TelemetryMode::Local => {
                    let local = Arc::new(LocalTelemetry::new(
                        config.telemetry.starting_equity,
                        config.telemetry.max_history,
                    ));
                    (local.clone() as Arc<dyn TelemetrySource>, Some(local))
                }
            };

        Self::with_parts(config, engine, telemetry, local_telemetry)
    }

    /// Assemble from prebuilt parts and bootstrap every configured agent.
    pub fn with_parts(
        config: Config,
        engine: Arc<EscalationEngine>,
        telemetry: Arc<dyn TelemetrySource>,
        local_telemetry: Option<Arc<LocalTelemetry>>,
    ) -> Result<(Self, rumqttc::EventLoop), Box<dyn std::error::Error>> {
        let (mqtt, eventloop) = MqttClient::new(&config.mqtt, config.daemon_id.clone())?;

        for agent_id in &config.agents {
            let state = engine.bootstrap_agent(agent_id)?;
            info!(agent_id = %agent_id, level = %state.code, "managing agent");
        }

        let prompts = PromptBindings::new(config.prompts.clone());
        let agent = Self {
            config,
            mqtt,
            metrics: Metrics::new(),
            engine,
            telemetry,
            local_telemetry,
            prompts,
            shutdown_requested: false,
        };
        Ok((agent, eventloop))
    }

    pub async fn subscribe(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.mqtt.subscribe().await
    }

    /// Send heartbeat with metrics
    pub async fn heartbeat(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.metrics.increment_uptime(HEARTBEAT_SECS);
        self.metrics.update_memory();
        self.metrics.engine = self.engine.counters().snapshot();

        let metrics_json = serde_json::to_value(&self.metrics)?;
        self.mqtt.report("heartbeat", metrics_json).await?;

        Ok(())
    }

    /// One evaluation cycle over every managed agent. Transitions are
    /// published as `transition` reports.
    pub async fn evaluate_all(&mut self) -> Vec<(String, Decision)> {
        let timeout = self.config.escalation.snapshot_timeout();
        let mut outcomes = Vec::new();

        for agent_id in self.engine.agents() {
            let decision = self
                .engine
                .run_cycle(&agent_id, self.telemetry.as_ref(), timeout)
                .await;

            if let Some(level) = decision.target() {
                let payload = serde_json::json!({
                    "agent_id": agent_id,
                    "decision": decision,
                    "level": level,
                });
                if let Err(e) = self.mqtt.report("transition", payload).await {
                    warn!(agent_id = %agent_id, error = %e, "failed to publish transition");
                }
            }
            outcomes.push((agent_id, decision));
        }
        outcomes
    }

    /// Main event loop; returns after a `shutdown` command.
    pub async fn run(mut self, mut eventloop: rumqttc::EventLoop) -> Result<(), Box<dyn std::error::Error>> {
        self.subscribe().await?;
        info!(
            daemon_id = %self.config.daemon_id,
            agents = self.engine.agents().len(),
            "escalation daemon ready, entering main loop"
        );

        let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
        let mut evaluation_interval = tokio::time::interval(self.config.escalation.evaluation_interval());

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                            let topic = publish.topic.clone();
                            match parse_command(&publish.payload) {
                                Ok(cmd) => self.handle_command(cmd).await,
                                Err(e) => warn!(topic = %topic, error = %e, "failed to parse command"),
                            }
                        }
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker");
                        }
                        Err(e) => {
                            error!(error = %e, "MQTT error, reconnecting...");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        _ => {}
                    }
                }
                _ = evaluation_interval.tick() => {
                    self.evaluate_all().await;
                }
                _ = heartbeat_interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "failed to send heartbeat");
                    }
                }
            }

            if self.shutdown_requested {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
