//! Telemetry collaborators: where snapshots and daily trade counts come from.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::EscalationError;
use crate::level::PerformanceSnapshot;

/// Source of rolling performance data for an agent.
///
/// Failures are expected (feed down, timeout) and are mapped to
/// `SnapshotUnavailable`; the engine treats them as "skip this cycle".
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch_snapshot(&self, agent_id: &str) -> Result<PerformanceSnapshot, EscalationError>;

    /// Trades placed today; the counter resets at the UTC day boundary.
    async fn fetch_daily_trade_count(&self, agent_id: &str) -> Result<u32, EscalationError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DailyCountResponse {
    count: u32,
}

/// Pulls telemetry from the orchestrator REST API
pub struct HttpTelemetry {
    client: Client,
    base_url: String,
}

impl HttpTelemetry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EscalationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EscalationError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn snapshot_url(&self, agent_id: &str) -> String {
        format!("{}/api/agents/{}/performance", self.base_url, agent_id)
    }

    pub fn daily_count_url(&self, agent_id: &str) -> String {
        format!("{}/api/agents/{}/trades/daily-count", self.base_url, agent_id)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, EscalationError> {
        debug!(url = %url, "fetching telemetry");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EscalationError::SnapshotUnavailable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EscalationError::SnapshotUnavailable(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| EscalationError::SnapshotUnavailable(format!("decode: {}", e)))
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetry {
    async fn fetch_snapshot(&self, agent_id: &str) -> Result<PerformanceSnapshot, EscalationError> {
        self.get_json(&self.snapshot_url(agent_id)).await
    }

    async fn fetch_daily_trade_count(&self, agent_id: &str) -> Result<u32, EscalationError> {
        let body: DailyCountResponse = self.get_json(&self.daily_count_url(agent_id)).await?;
        Ok(body.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_strip_trailing_slash() {
        let t = HttpTelemetry::new("http://localhost:8420/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            t.snapshot_url("agent-7"),
            "http://localhost:8420/api/agents/agent-7/performance"
        );
        assert_eq!(
            t.daily_count_url("agent-7"),
            "http://localhost:8420/api/agents/agent-7/trades/daily-count"
        );
    }

    #[tokio::test]
    async fn test_unreachable_orchestrator_is_snapshot_unavailable() {
        // port 9 (discard) is closed on test hosts
        let t = HttpTelemetry::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        match t.fetch_snapshot("a1").await {
            Err(EscalationError::SnapshotUnavailable(_)) => {}
            other => panic!("expected SnapshotUnavailable, got {:?}", other),
        }
    }
}
