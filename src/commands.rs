use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::agent::EscalationAgent;
use crate::gate::ProposedAction;
use crate::level::{LevelCode, PerformanceSnapshot, PermissionLevel};
use crate::mqtt::OperatorCommand;
use crate::performance::ClosedTrade;

/// Command handler result
pub type CommandResult = Result<Value, Box<dyn std::error::Error>>;

fn str_field<'a>(payload: &'a Value, key: &str) -> Result<&'a str, Box<dyn std::error::Error>> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing '{}' parameter", key).into())
}

fn level_field(payload: &Value, key: &str) -> Result<LevelCode, Box<dyn std::error::Error>> {
    Ok(str_field(payload, key)?.parse()?)
}

fn typed_field<T: serde::de::DeserializeOwned>(payload: &Value, key: &str) -> Result<T, Box<dyn std::error::Error>> {
    let raw = payload
        .get(key)
        .cloned()
        .ok_or_else(|| format!("missing '{}' parameter", key))?;
    Ok(serde_json::from_value(raw)?)
}

impl EscalationAgent {
    /// Handle an incoming operator command
    pub async fn handle_command(&mut self, cmd: OperatorCommand) {
        info!(
            command = %cmd.command,
            request_id = %cmd.request_id,
            "received command"
        );

        let result = self.dispatch(&cmd).await;

        match result {
            Ok(response) => {
                self.metrics.record_success();
                let payload = serde_json::json!({
                    "request_id": cmd.request_id,
                    "result": response,
                });
                let _ = self.mqtt.report("result", payload).await;
            }
            Err(e) => {
                self.metrics.record_failure();
                warn!(command = %cmd.command, error = %e, "command failed");
                let error_payload = serde_json::json!({
                    "error": e.to_string(),
                    "request_id": cmd.request_id
                });
                let _ = self.mqtt.report("error", error_payload).await;
            }
        }
    }

    /// Route a command to its handler without reporting.
    pub async fn dispatch(&mut self, cmd: &OperatorCommand) -> CommandResult {
        match cmd.command.as_str() {
            "ping" => Ok(serde_json::json!({"pong": true})),
            "status" => self.handle_status(cmd),
            "levels" => self.handle_levels(),
            "history" => self.handle_history(cmd),
            "set_level" => self.handle_set_level(cmd),
            "reset_level" => self.handle_reset_level(cmd),
            "upsert_level" => self.handle_upsert_level(cmd),
            "set_default" => self.handle_set_default(cmd),
            "authorize" => self.handle_authorize(cmd).await,
            "evaluate" => self.handle_evaluate(cmd).await,
            "prompts" => self.handle_prompts(cmd),
            "record_trade" => self.handle_record_trade(cmd),
            "get_metrics" => self.handle_get_metrics(),
            "shutdown" => self.handle_shutdown(),
            _ => {
                warn!(command = %cmd.command, "unknown command");
                Err(format!("unknown command: {}", cmd.command).into())
            }
        }
    }

    fn agent_status(&self, agent_id: &str) -> CommandResult {
        let state = self.engine.current_state(agent_id)?;
        let level = self.engine.current_level(agent_id)?;
        Ok(serde_json::json!({
            "agent_id": agent_id,
            "level": state.code,
            "name": level.name,
            "version": state.version,
            "entered_at": state.entered_at,
            "days_at_level": state.days_at_level(Utc::now()),
            "trading_params": level.trading_params,
        }))
    }

    /// Status of one agent (`agent_id`) or of all managed agents
    fn handle_status(&self, cmd: &OperatorCommand) -> CommandResult {
        if let Some(agent_id) = cmd.payload.get("agent_id").and_then(|v| v.as_str()) {
            return self.agent_status(agent_id);
        }
        let agents = self
            .engine
            .agents()
            .iter()
            .map(|id| self.agent_status(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(serde_json::json!({
            "daemon_id": self.config.daemon_id,
            "agents": agents,
        }))
    }

    fn handle_levels(&self) -> CommandResult {
        Ok(serde_json::json!({ "levels": self.engine.levels() }))
    }

    fn handle_history(&self, cmd: &OperatorCommand) -> CommandResult {
        let agent_id = str_field(&cmd.payload, "agent_id")?;
        let since = match cmd.payload.get("since").and_then(|v| v.as_str()) {
            Some(s) => Some(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)),
            None => None,
        };
        let records = self.engine.transition_history(agent_id, since)?;
        Ok(serde_json::json!({
            "agent_id": agent_id,
            "count": records.len(),
            "transitions": records,
        }))
    }

    fn handle_set_level(&self, cmd: &OperatorCommand) -> CommandResult {
        let user_id = str_field(&cmd.payload, "user_id")?;
        let agent_id = str_field(&cmd.payload, "agent_id")?;
        let code = level_field(&cmd.payload, "level")?;

        let state = self.engine.set_level(user_id, agent_id, code)?;
        Ok(serde_json::json!({
            "agent_id": agent_id,
            "level": state.code,
            "version": state.version,
        }))
    }

    fn handle_reset_level(&self, cmd: &OperatorCommand) -> CommandResult {
        let user_id = str_field(&cmd.payload, "user_id")?;
        let agent_id = str_field(&cmd.payload, "agent_id")?;

        let state = self.engine.reset_level(user_id, agent_id)?;
        Ok(serde_json::json!({
            "agent_id": agent_id,
            "level": state.code,
            "version": state.version,
        }))
    }

    fn handle_upsert_level(&self, cmd: &OperatorCommand) -> CommandResult {
        let user_id = str_field(&cmd.payload, "user_id")?;
        let level: PermissionLevel = typed_field(&cmd.payload, "level")?;
        let code = level.code;

        let previous = self.engine.upsert_level(user_id, level)?;
        Ok(serde_json::json!({
            "level": code,
            "created": previous.is_none(),
        }))
    }

    fn handle_set_default(&self, cmd: &OperatorCommand) -> CommandResult {
        let user_id = str_field(&cmd.payload, "user_id")?;
        let code = level_field(&cmd.payload, "level")?;
        self.engine.set_default_level(user_id, code)?;
        Ok(serde_json::json!({ "default": code }))
    }

    /// Gate a proposed trade. Uses `daily_trade_count` when given, otherwise
    /// asks telemetry for it.
    async fn handle_authorize(&self, cmd: &OperatorCommand) -> CommandResult {
        let agent_id = str_field(&cmd.payload, "agent_id")?;
        let action: ProposedAction = typed_field(&cmd.payload, "action")?;

        let result = match cmd.payload.get("daily_trade_count").and_then(|v| v.as_u64()) {
            Some(count) => {
                let count = u32::try_from(count).unwrap_or(u32::MAX);
                self.engine.authorize(agent_id, &action, count)
            }
            None => {
                self.engine
                    .authorize_with(agent_id, &action, self.telemetry.as_ref())
                    .await
            }
        };

        Ok(serde_json::json!({
            "agent_id": agent_id,
            "allowed": result.is_allowed(),
            "authorization": result,
        }))
    }

    /// Evaluate one agent now, against a supplied `snapshot` or a fresh fetch.
    async fn handle_evaluate(&self, cmd: &OperatorCommand) -> CommandResult {
        let agent_id = str_field(&cmd.payload, "agent_id")?;
        // surface unknown agents as errors rather than a silent Hold
        self.engine.current_state(agent_id)?;

        let decision = match cmd.payload.get("snapshot") {
            Some(raw) => {
                let snapshot: PerformanceSnapshot = serde_json::from_value(raw.clone())?;
                self.engine.evaluate(agent_id, &snapshot)
            }
            None => {
                self.engine
                    .run_cycle(
                        agent_id,
                        self.telemetry.as_ref(),
                        self.config.escalation.snapshot_timeout(),
                    )
                    .await
            }
        };

        let state = self.engine.current_state(agent_id)?;
        Ok(serde_json::json!({
            "agent_id": agent_id,
            "outcome": decision,
            "level": state.code,
        }))
    }

    /// Prompt templates for an explicit `level`, or for the agent's current one
    fn handle_prompts(&self, cmd: &OperatorCommand) -> CommandResult {
        let code = match cmd.payload.get("level") {
            Some(_) => level_field(&cmd.payload, "level")?,
            None => {
                let agent_id = str_field(&cmd.payload, "agent_id")?;
                self.engine.current_state(agent_id)?.code
            }
        };
        Ok(serde_json::json!({
            "level": code,
            "binding": self.prompts.for_level(code),
        }))
    }

    fn handle_record_trade(&self, cmd: &OperatorCommand) -> CommandResult {
        let local = self
            .local_telemetry
            .as_ref()
            .ok_or("record_trade requires local telemetry mode")?;
        let agent_id = str_field(&cmd.payload, "agent_id")?;
        let trade: ClosedTrade = typed_field(&cmd.payload, "trade")?;

        local.record_trade(agent_id, trade);
        Ok(serde_json::json!({ "agent_id": agent_id, "recorded": true }))
    }

    fn handle_get_metrics(&mut self) -> CommandResult {
        self.metrics.update_memory();
        self.metrics.engine = self.engine.counters().snapshot();
        Ok(serde_json::to_value(&self.metrics)?)
    }

    fn handle_shutdown(&mut self) -> CommandResult {
        warn!("shutdown command received");
        self.shutdown_requested = true;
        Ok(serde_json::json!({ "shutting_down": true }))
    }
}
