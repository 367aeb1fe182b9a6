use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::config::MqttConfig;

/// Broadcast topic every escalation daemon listens on
pub const BROADCAST_TOPIC: &str = "evoclaw/escalation/broadcast";

pub fn command_topic(daemon_id: &str) -> String {
    format!("evoclaw/escalation/{}/commands", daemon_id)
}

pub fn report_topic(daemon_id: &str) -> String {
    format!("evoclaw/escalation/{}/reports", daemon_id)
}

/// Message from an operator console or the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorCommand {
    pub command: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub request_id: String,
}

/// Message published by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationReport {
    pub daemon_id: String,
    /// "result", "error", "transition", "heartbeat"
    pub report_type: String,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

pub struct MqttClient {
    client: AsyncClient,
    daemon_id: String,
}

impl MqttClient {
    pub fn new(config: &MqttConfig, daemon_id: String) -> Result<(Self, EventLoop), Box<dyn std::error::Error>> {
        let mut mqttoptions = MqttOptions::new(format!("evoclaw-{}", daemon_id), &config.broker, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        Ok((Self { client, daemon_id }, eventloop))
    }

    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    pub async fn subscribe(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.client
            .subscribe(command_topic(&self.daemon_id), QoS::AtLeastOnce)
            .await?;
        self.client
            .subscribe(BROADCAST_TOPIC.to_string(), QoS::AtLeastOnce)
            .await?;

        info!(daemon_id = %self.daemon_id, "subscribed to MQTT topics");
        Ok(())
    }

    /// Publish a report on this daemon's report topic
    pub async fn report(&self, report_type: &str, payload: serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
        let report = EscalationReport {
            daemon_id: self.daemon_id.clone(),
            report_type: report_type.to_string(),
            payload,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)?
                .as_secs(),
        };

        let payload = serde_json::to_vec(&report)?;
        self.client
            .publish(report_topic(&self.daemon_id), QoS::AtLeastOnce, false, payload)
            .await?;

        Ok(())
    }
}

/// Parse an incoming MQTT message as an OperatorCommand
pub fn parse_command(payload: &[u8]) -> Result<OperatorCommand, serde_json::Error> {
    serde_json::from_slice(payload)
}
