//! Escalation engine: owns the catalog, the per-agent level pointers and the
//! transition log, and exposes the operations the trading pipeline and the
//! admin console call.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::catalog::LevelCatalog;
use crate::error::EscalationError;
use crate::evaluator::{Decision, EscalationEvaluator, EvaluatorPolicy};
use crate::gate::{self, AuthorizationResult, ProposedAction, RejectReason};
use crate::level::{LevelCode, PerformanceSnapshot, PermissionLevel};
use crate::metrics::EngineCounters;
use crate::pointer::{LevelCell, LevelState};
use crate::rbac::{PermissionChecker, PERM_LEVELS_OVERRIDE, PERM_LEVELS_WRITE};
use crate::telemetry::TelemetrySource;
use crate::transition_log::{TransitionLog, TransitionReason, TransitionRecord};

pub struct EscalationEngine {
    catalog: RwLock<LevelCatalog>,
    catalog_path: Option<PathBuf>,
    agents: RwLock<HashMap<String, Arc<LevelCell>>>,
    log: Arc<dyn TransitionLog>,
    evaluator: EscalationEvaluator,
    permissions: Arc<dyn PermissionChecker>,
    counters: EngineCounters,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl EscalationEngine {
    pub fn new(
        catalog: LevelCatalog,
        policy: EvaluatorPolicy,
        log: Arc<dyn TransitionLog>,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            catalog_path: None,
            agents: RwLock::new(HashMap::new()),
            log,
            evaluator: EscalationEvaluator::new(policy),
            permissions,
            counters: EngineCounters::new(),
        }
    }

    /// Persist catalog edits to `path` as they are committed.
    pub fn with_catalog_path(mut self, path: PathBuf) -> Self {
        self.catalog_path = Some(path);
        self
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn policy(&self) -> &EvaluatorPolicy {
        self.evaluator.policy()
    }

    pub fn levels(&self) -> Vec<PermissionLevel> {
        read(&self.catalog).list_ordered().into_iter().cloned().collect()
    }

    pub fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.agents).keys().cloned().collect();
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Agent lifecycle
    // -----------------------------------------------------------------------

    /// Create the agent's level pointer if it does not exist yet.
    ///
    /// A brand-new agent is placed at the default level and the assignment is
    /// logged, so its entry time survives restarts. A restarted agent resumes
    /// at the level of its last logged transition; if that level has since
    /// been deactivated it is reset to the default.
    pub fn bootstrap_agent(&self, agent_id: &str) -> Result<Arc<LevelState>, EscalationError> {
        if let Some(cell) = read(&self.agents).get(agent_id) {
            return Ok(cell.load());
        }

        let mut agents = write(&self.agents);
        if let Some(cell) = agents.get(agent_id) {
            return Ok(cell.load());
        }

        let (default_code, resume) = {
            let catalog = read(&self.catalog);
            let default_code = catalog.default_level()?.code;
            let resume = match self.log.latest(agent_id)? {
                Some(last) => match catalog.get(last.to_level) {
                    Ok(level) if level.is_active => Some(Ok((last.to_level, last.timestamp))),
                    _ => Some(Err(last.to_level)),
                },
                None => None,
            };
            (default_code, resume)
        };

        let cell = match resume {
            Some(Ok((code, entered_at))) => {
                info!(agent_id = %agent_id, level = %code, "agent resumed from transition log");
                LevelCell::new(agent_id, code, entered_at)
            }
            Some(Err(stale)) => {
                let now = Utc::now();
                self.log.append(
                    TransitionRecord::new(agent_id, stale, default_code, TransitionReason::DefaultReset).at(now),
                )?;
                warn!(
                    agent_id = %agent_id,
                    stale = %stale,
                    level = %default_code,
                    "logged level no longer active, reset to default"
                );
                LevelCell::new(agent_id, default_code, now)
            }
            None => {
                let now = Utc::now();
                self.log.append(
                    TransitionRecord::new(agent_id, default_code, default_code, TransitionReason::DefaultReset)
                        .at(now),
                )?;
                info!(agent_id = %agent_id, level = %default_code, "agent bootstrapped at default level");
                LevelCell::new(agent_id, default_code, now)
            }
        };

        let cell = Arc::new(cell);
        let state = cell.load();
        agents.insert(agent_id.to_string(), cell);
        Ok(state)
    }

    fn cell(&self, agent_id: &str) -> Result<Arc<LevelCell>, EscalationError> {
        read(&self.agents)
            .get(agent_id)
            .cloned()
            .ok_or_else(|| EscalationError::UnknownAgent(agent_id.to_string()))
    }

    pub fn current_state(&self, agent_id: &str) -> Result<Arc<LevelState>, EscalationError> {
        Ok(self.cell(agent_id)?.load())
    }

    pub fn current_level(&self, agent_id: &str) -> Result<PermissionLevel, EscalationError> {
        let state = self.current_state(agent_id)?;
        read(&self.catalog).get(state.code).cloned()
    }

    pub fn transition_history(
        &self,
        agent_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransitionRecord>, EscalationError> {
        self.log.history(agent_id, since)
    }

    /// Time since the agent's most recent transition; `Duration::MAX` when
    /// it has never moved off its initial assignment.
    pub fn cooldown_elapsed(&self, agent_id: &str, now: DateTime<Utc>) -> Result<Duration, EscalationError> {
        Ok(match self.log.latest(agent_id)? {
            Some(last) if !last.is_initial_assignment() => (now - last.timestamp).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::MAX,
        })
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Persist a transition and swap the pointer, provided nobody moved the
    /// agent since `expected` was read.
    fn commit(
        &self,
        cell: &LevelCell,
        expected: &LevelState,
        to: LevelCode,
        reason: TransitionReason,
        snapshot: Option<PerformanceSnapshot>,
        actor: Option<&str>,
    ) -> Result<Arc<LevelState>, EscalationError> {
        let _writer = cell.lock_writer();
        cell.check_version(expected.version)?;

        let now = Utc::now();
        let mut record = TransitionRecord::new(cell.agent_id(), expected.code, to, reason).at(now);
        if let Some(s) = snapshot {
            record = record.with_snapshot(s);
        }
        if let Some(a) = actor {
            record = record.with_actor(a);
        }
        self.log.append(record)?;
        cell.swap(expected.version, to, now)
    }

    /// Run one evaluation for `agent_id` against `snapshot` and apply the
    /// outcome. Never fails: problems are logged and reported as `Hold`.
    pub fn evaluate(&self, agent_id: &str, snapshot: &PerformanceSnapshot) -> Decision {
        let decision = self.evaluate_inner(agent_id, snapshot);
        self.counters.record_decision(&decision);
        decision
    }

    fn evaluate_inner(&self, agent_id: &str, snapshot: &PerformanceSnapshot) -> Decision {
        let cell = match self.cell(agent_id) {
            Ok(c) => c,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "evaluation skipped");
                return Decision::Hold;
            }
        };

        for attempt in 0..2 {
            let state = cell.load();
            let now = Utc::now();

            let mut snap = snapshot.clone();
            if snap.days_since_level_entry.is_none() {
                snap.days_since_level_entry = Some(state.days_at_level(now));
            }

            let elapsed = match self.cooldown_elapsed(agent_id, now) {
                Ok(d) => d,
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "transition log unreadable, holding");
                    return Decision::Hold;
                }
            };

            let decision = {
                let catalog = read(&self.catalog);
                self.evaluator.evaluate(&catalog, state.code, &snap, elapsed)
            };

            let (target, reason) = match decision {
                Decision::Hold => {
                    debug!(agent_id = %agent_id, level = %state.code, "hold");
                    return Decision::Hold;
                }
                Decision::Promote(t) => (t, TransitionReason::ConditionsMetPromote),
                Decision::Demote(t) => (t, TransitionReason::ConditionsBreachedDemote),
            };

            match self.commit(&cell, &state, target, reason, Some(snap), None) {
                Ok(next) => {
                    info!(
                        agent_id = %agent_id,
                        from = %state.code,
                        to = %next.code,
                        reason = ?reason,
                        "level transition applied"
                    );
                    return decision;
                }
                Err(EscalationError::ConcurrentModification { .. }) if attempt == 0 => {
                    debug!(agent_id = %agent_id, "level changed during evaluation, re-evaluating");
                    continue;
                }
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "failed to apply transition, holding");
                    return Decision::Hold;
                }
            }
        }
        Decision::Hold
    }

    /// Fetch a snapshot (bounded by `timeout`) and evaluate. A failed or
    /// timed-out fetch skips the cycle.
    pub async fn run_cycle(
        &self,
        agent_id: &str,
        telemetry: &dyn TelemetrySource,
        timeout: Duration,
    ) -> Decision {
        let fetched = match tokio::time::timeout(timeout, telemetry.fetch_snapshot(agent_id)).await {
            Ok(result) => result,
            Err(_) => Err(EscalationError::SnapshotUnavailable(format!(
                "timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        match fetched {
            Ok(snapshot) => self.evaluate(agent_id, &snapshot),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "snapshot unavailable, skipping evaluation");
                self.counters.record_snapshot_failure();
                self.counters.record_decision(&Decision::Hold);
                Decision::Hold
            }
        }
    }

    fn require(&self, user_id: &str, permission: &str) -> Result<(), EscalationError> {
        if self.permissions.has_permission(user_id, permission) {
            Ok(())
        } else {
            warn!(user_id = %user_id, permission = %permission, "permission denied");
            Err(EscalationError::PermissionDenied {
                user_id: user_id.to_string(),
                permission: permission.to_string(),
            })
        }
    }

    fn manual_transition(
        &self,
        user_id: &str,
        agent_id: &str,
        target: LevelCode,
        reason: TransitionReason,
    ) -> Result<Arc<LevelState>, EscalationError> {
        let cell = self.cell(agent_id)?;
        let mut last_err = None;
        for _ in 0..2 {
            let state = cell.load();
            if state.code == target {
                return Ok(state);
            }
            match self.commit(&cell, &state, target, reason, None, Some(user_id)) {
                Ok(next) => {
                    self.counters.record_manual_transition();
                    info!(
                        agent_id = %agent_id,
                        user_id = %user_id,
                        from = %state.code,
                        to = %next.code,
                        reason = ?reason,
                        "manual level transition"
                    );
                    return Ok(next);
                }
                Err(e @ EscalationError::ConcurrentModification { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| EscalationError::UnknownAgent(agent_id.to_string())))
    }

    /// Operator override: put the agent on `code`. Audited as `ManualOverride`.
    pub fn set_level(&self, user_id: &str, agent_id: &str, code: LevelCode) -> Result<Arc<LevelState>, EscalationError> {
        self.require(user_id, PERM_LEVELS_OVERRIDE)?;
        {
            let catalog = read(&self.catalog);
            let level = catalog.get(code)?;
            if !level.is_active {
                return Err(EscalationError::InvalidLevel(format!("{} is inactive", code)));
            }
        }
        self.manual_transition(user_id, agent_id, code, TransitionReason::ManualOverride)
    }

    /// Operator reset to the catalog default. Audited as `DefaultReset`.
    pub fn reset_level(&self, user_id: &str, agent_id: &str) -> Result<Arc<LevelState>, EscalationError> {
        self.require(user_id, PERM_LEVELS_OVERRIDE)?;
        let default_code = read(&self.catalog).default_level()?.code;
        self.manual_transition(user_id, agent_id, default_code, TransitionReason::DefaultReset)
    }

    // -----------------------------------------------------------------------
    // Catalog maintenance
    // -----------------------------------------------------------------------

    fn edit_catalog<T>(
        &self,
        edit: impl FnOnce(&mut LevelCatalog) -> Result<T, EscalationError>,
    ) -> Result<T, EscalationError> {
        let mut guard = write(&self.catalog);
        let mut candidate = guard.clone();
        let out = edit(&mut candidate)?;
        if let Some(path) = &self.catalog_path {
            candidate.save(path)?;
        }
        *guard = candidate;
        Ok(out)
    }

    /// Insert or replace a level. Agents left on a level that is no longer
    /// active are reset to the default.
    pub fn upsert_level(&self, user_id: &str, level: PermissionLevel) -> Result<Option<PermissionLevel>, EscalationError> {
        self.require(user_id, PERM_LEVELS_WRITE)?;
        let code = level.code;
        let previous = self.edit_catalog(|c| c.upsert(level))?;
        info!(user_id = %user_id, level = %code, "catalog level upserted");
        self.reset_stranded_agents(user_id)?;
        Ok(previous)
    }

    fn reset_stranded_agents(&self, user_id: &str) -> Result<(), EscalationError> {
        let (default_code, stranded) = {
            let catalog = read(&self.catalog);
            let stranded: Vec<(String, LevelCode)> = read(&self.agents)
                .iter()
                .filter_map(|(id, cell)| {
                    let code = cell.load().code;
                    match catalog.get(code) {
                        Ok(level) if level.is_active => None,
                        _ => Some((id.clone(), code)),
                    }
                })
                .collect();
            (catalog.default_level()?.code, stranded)
        };

        for (agent_id, stale) in stranded {
            warn!(
                agent_id = %agent_id,
                stale = %stale,
                level = %default_code,
                "agent level deactivated, reset to default"
            );
            self.manual_transition(user_id, &agent_id, default_code, TransitionReason::DefaultReset)?;
        }
        Ok(())
    }

    pub fn set_default_level(&self, user_id: &str, code: LevelCode) -> Result<(), EscalationError> {
        self.require(user_id, PERM_LEVELS_WRITE)?;
        self.edit_catalog(|c| c.set_default(code))?;
        info!(user_id = %user_id, level = %code, "catalog default changed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Hot path
    // -----------------------------------------------------------------------

    /// Gate a proposed trade against the agent's current level.
    pub fn authorize(&self, agent_id: &str, action: &ProposedAction, daily_trade_count: u32) -> AuthorizationResult {
        let result = self.authorize_inner(agent_id, action, daily_trade_count);
        self.counters.record_authorization(&result);
        if let AuthorizationResult::Rejected { reason } = &result {
            debug!(agent_id = %agent_id, symbol = %action.symbol, reason = %reason, "trade rejected");
        }
        result
    }

    fn authorize_inner(&self, agent_id: &str, action: &ProposedAction, daily_trade_count: u32) -> AuthorizationResult {
        let state = match self.cell(agent_id) {
            Ok(cell) => cell.load(),
            Err(_) => {
                return AuthorizationResult::Rejected {
                    reason: RejectReason::UnknownAgent {
                        agent_id: agent_id.to_string(),
                    },
                }
            }
        };
        let catalog = read(&self.catalog);
        match catalog.get(state.code) {
            Ok(level) if level.is_active => gate::authorize(&level.trading_params, action, daily_trade_count),
            _ => AuthorizationResult::Rejected {
                reason: RejectReason::LevelUnavailable {
                    level: state.code.to_string(),
                },
            },
        }
    }

    /// Like [`authorize`](Self::authorize) but fetches the daily trade count
    /// first. Fails closed when the counter is unavailable.
    pub async fn authorize_with(
        &self,
        agent_id: &str,
        action: &ProposedAction,
        telemetry: &dyn TelemetrySource,
    ) -> AuthorizationResult {
        match telemetry.fetch_daily_trade_count(agent_id).await {
            Ok(count) => self.authorize(agent_id, action, count),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "daily trade count unavailable, rejecting");
                let result = AuthorizationResult::Rejected {
                    reason: RejectReason::TradeCountUnavailable { detail: e.to_string() },
                };
                self.counters.record_authorization(&result);
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{DowngradeConditions, UpgradeConditions};
    use crate::rbac::AllowAll;
    use crate::transition_log::{JsonlTransitionLog, MemoryTransitionLog};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    fn engine_with(catalog: LevelCatalog, log: Arc<MemoryTransitionLog>) -> EscalationEngine {
        EscalationEngine::new(catalog, EvaluatorPolicy::new(HOUR), log, Arc::new(AllowAll))
    }

    fn engine() -> (EscalationEngine, Arc<MemoryTransitionLog>) {
        let log = Arc::new(MemoryTransitionLog::new());
        (engine_with(LevelCatalog::standard(), Arc::clone(&log)), log)
    }

    fn action(size: f64, confidence: f64, leverage: u32) -> ProposedAction {
        ProposedAction {
            symbol: "ETH".to_string(),
            position_size_pct: size,
            leverage,
            confidence,
        }
    }

    #[test]
    fn test_bootstrap_at_default() {
        let (engine, log) = engine();
        let state = engine.bootstrap_agent("a1").unwrap();
        assert_eq!(state.code, LevelCode::L0);
        assert_eq!(engine.current_level("a1").unwrap().name, "Probation");
        let initial = log.latest("a1").unwrap().unwrap();
        assert_eq!(initial.reason, TransitionReason::DefaultReset);
        assert!(initial.is_initial_assignment());
        assert_eq!(initial.timestamp, state.entered_at);
        assert_eq!(engine.agents(), vec!["a1".to_string()]);
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let (engine, _) = engine();
        engine.bootstrap_agent("a1").unwrap();
        engine.set_level("ops", "a1", LevelCode::L2).unwrap();
        let again = engine.bootstrap_agent("a1").unwrap();
        assert_eq!(again.code, LevelCode::L2);
    }

    #[test]
    fn test_bootstrap_resumes_from_log() {
        let log = Arc::new(MemoryTransitionLog::new());
        let entered = Utc::now() - ChronoDuration::days(4);
        log.append(
            TransitionRecord::new("a1", LevelCode::L1, LevelCode::L2, TransitionReason::ConditionsMetPromote)
                .at(entered),
        )
        .unwrap();

        let engine = engine_with(LevelCatalog::standard(), Arc::clone(&log));
        let state = engine.bootstrap_agent("a1").unwrap();
        assert_eq!(state.code, LevelCode::L2);
        assert_eq!(state.entered_at, entered);
    }

    #[test]
    fn test_bootstrap_resets_when_logged_level_inactive() {
        let log = Arc::new(MemoryTransitionLog::new());
        log.append(TransitionRecord::new(
            "a1",
            LevelCode::L2,
            LevelCode::L3,
            TransitionReason::ManualOverride,
        ))
        .unwrap();

        let mut catalog = LevelCatalog::standard();
        let mut l3 = catalog.get(LevelCode::L3).unwrap().clone();
        l3.is_active = false;
        catalog.upsert(l3).unwrap();

        let engine = engine_with(catalog, Arc::clone(&log));
        assert_eq!(engine.bootstrap_agent("a1").unwrap().code, LevelCode::L0);
        let latest = log.latest("a1").unwrap().unwrap();
        assert_eq!(latest.reason, TransitionReason::DefaultReset);
        assert_eq!(latest.from_level, LevelCode::L3);
    }

    #[test]
    fn test_unknown_agent() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.current_level("ghost"),
            Err(EscalationError::UnknownAgent(_))
        ));
        assert!(matches!(
            engine.authorize("ghost", &action(0.01, 0.99, 1), 0),
            AuthorizationResult::Rejected {
                reason: RejectReason::UnknownAgent { .. }
            }
        ));
        assert_eq!(
            engine.evaluate("ghost", &PerformanceSnapshot::default()),
            Decision::Hold
        );
    }

    #[test]
    fn test_demotion_applied_and_logged() {
        let (engine, log) = engine();
        engine.bootstrap_agent("a1").unwrap();
        engine.set_level("ops", "a1", LevelCode::L1).unwrap();

        let snap = PerformanceSnapshot {
            max_drawdown: Some(0.15),
            ..Default::default()
        };
        assert_eq!(engine.evaluate("a1", &snap), Decision::Demote(LevelCode::L0));
        assert_eq!(engine.current_state("a1").unwrap().code, LevelCode::L0);

        let latest = log.latest("a1").unwrap().unwrap();
        assert_eq!(latest.reason, TransitionReason::ConditionsBreachedDemote);
        assert_eq!(latest.snapshot_used.unwrap().max_drawdown, Some(0.15));
        assert_eq!(engine.counters().snapshot().demotions, 1);
    }

    #[test]
    fn test_promotion_respects_cooldown_from_log() {
        let log = Arc::new(MemoryTransitionLog::new());
        let mut catalog = LevelCatalog::standard();
        let mut l1 = catalog.get(LevelCode::L1).unwrap().clone();
        l1.upgrade_conditions = Some(UpgradeConditions {
            win_rate_7d: Some(0.6),
            ..Default::default()
        });
        catalog.upsert(l1).unwrap();

        // most recent transition 10 minutes ago, cooldown is one hour
        log.append(
            TransitionRecord::new("a1", LevelCode::L1, LevelCode::L0, TransitionReason::ConditionsBreachedDemote)
                .at(Utc::now() - ChronoDuration::minutes(10)),
        )
        .unwrap();
        let engine = engine_with(catalog, Arc::clone(&log));
        engine.bootstrap_agent("a1").unwrap();

        let snap = PerformanceSnapshot {
            win_rate_7d: Some(0.7),
            ..Default::default()
        };
        assert_eq!(engine.evaluate("a1", &snap), Decision::Hold);
        assert_eq!(engine.evaluate("a1", &snap), Decision::Hold);
        assert_eq!(engine.current_state("a1").unwrap().code, LevelCode::L0);
    }

    #[test]
    fn test_promotion_then_no_flap() {
        let log = Arc::new(MemoryTransitionLog::new());
        let mut catalog = LevelCatalog::standard();
        for code in [LevelCode::L1, LevelCode::L2] {
            let mut l = catalog.get(code).unwrap().clone();
            l.upgrade_conditions = Some(UpgradeConditions {
                win_rate_7d: Some(0.6),
                ..Default::default()
            });
            l.downgrade_conditions = Some(DowngradeConditions::default());
            catalog.upsert(l).unwrap();
        }
        let engine = engine_with(catalog, log);
        engine.bootstrap_agent("a1").unwrap();

        let snap = PerformanceSnapshot {
            win_rate_7d: Some(0.7),
            ..Default::default()
        };
        // no prior transition: cooldown considered elapsed
        assert_eq!(engine.evaluate("a1", &snap), Decision::Promote(LevelCode::L1));
        // the promotion itself restarts the cooldown
        assert_eq!(engine.evaluate("a1", &snap), Decision::Hold);
        assert_eq!(engine.current_state("a1").unwrap().code, LevelCode::L1);
    }

    #[test]
    fn test_days_since_entry_filled_from_pointer() {
        let log = Arc::new(MemoryTransitionLog::new());
        log.append(
            TransitionRecord::new("a1", LevelCode::L0, LevelCode::L1, TransitionReason::ManualOverride)
                .at(Utc::now() - ChronoDuration::days(5)),
        )
        .unwrap();

        let mut catalog = LevelCatalog::standard();
        let mut l2 = catalog.get(LevelCode::L2).unwrap().clone();
        l2.upgrade_conditions = Some(UpgradeConditions {
            min_days: Some(4),
            ..Default::default()
        });
        catalog.upsert(l2).unwrap();

        let engine = engine_with(catalog, log);
        engine.bootstrap_agent("a1").unwrap();
        assert_eq!(
            engine.evaluate("a1", &PerformanceSnapshot::default()),
            Decision::Promote(LevelCode::L2)
        );
    }

    #[test]
    fn test_set_level_rejects_inactive_and_unknown() {
        let mut catalog = LevelCatalog::standard();
        let mut l4 = catalog.get(LevelCode::L4).unwrap().clone();
        l4.is_active = false;
        catalog.upsert(l4).unwrap();
        let engine = engine_with(catalog, Arc::new(MemoryTransitionLog::new()));
        engine.bootstrap_agent("a1").unwrap();

        assert!(matches!(
            engine.set_level("ops", "a1", LevelCode::L4),
            Err(EscalationError::InvalidLevel(_))
        ));
        assert!(matches!(
            engine.set_level("ops", "ghost", LevelCode::L1),
            Err(EscalationError::UnknownAgent(_))
        ));
    }

    #[test]
    fn test_manual_override_and_reset_audited() {
        let (engine, log) = engine();
        engine.bootstrap_agent("a1").unwrap();
        engine.set_level("ops-1", "a1", LevelCode::L3).unwrap();
        engine.reset_level("ops-1", "a1").unwrap();

        let history = engine.transition_history("a1", None).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].reason, TransitionReason::ManualOverride);
        assert_eq!(history[1].actor.as_deref(), Some("ops-1"));
        assert_eq!(history[2].reason, TransitionReason::DefaultReset);
        assert_eq!(history[2].to_level, LevelCode::L0);
        assert_eq!(log.len(), 3);
        assert_eq!(engine.current_state("a1").unwrap().version, 2);
    }

    #[test]
    fn test_set_level_same_level_is_noop() {
        let (engine, log) = engine();
        engine.bootstrap_agent("a1").unwrap();
        engine.set_level("ops", "a1", LevelCode::L0).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_authorize_uses_current_level() {
        let (engine, _) = engine();
        engine.bootstrap_agent("a1").unwrap();

        // L0: max 5% position, 1x leverage
        match engine.authorize("a1", &action(0.2, 0.9, 1), 0) {
            AuthorizationResult::Clamped { adjusted } => assert_eq!(adjusted.position_size_pct, 0.05),
            other => panic!("expected Clamped, got {:?}", other),
        }
        assert!(!engine.authorize("a1", &action(0.05, 0.9, 3), 0).is_allowed());

        engine.set_level("ops", "a1", LevelCode::L3).unwrap();
        assert_eq!(
            engine.authorize("a1", &action(0.2, 0.9, 3), 0),
            AuthorizationResult::Accepted
        );
        let c = engine.counters().snapshot();
        assert_eq!(c.authorizations_clamped, 1);
        assert_eq!(c.authorizations_rejected, 1);
        assert_eq!(c.authorizations_accepted, 1);
    }

    #[test]
    fn test_upsert_level_through_engine() {
        let (engine, _) = engine();
        let mut l3 = engine.levels()[3].clone();
        l3.trading_params.max_position_pct = 0.15;
        assert!(matches!(
            engine.upsert_level("admin", l3.clone()),
            Err(EscalationError::InvariantViolation(_))
        ));

        l3.trading_params.max_position_pct = 0.35;
        let previous = engine.upsert_level("admin", l3).unwrap().unwrap();
        assert_eq!(previous.trading_params.max_position_pct, 0.30);
        assert_eq!(engine.levels()[3].trading_params.max_position_pct, 0.35);
    }

    #[test]
    fn test_catalog_edits_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("levels.json");
        let engine = EscalationEngine::new(
            LevelCatalog::standard(),
            EvaluatorPolicy::new(HOUR),
            Arc::new(MemoryTransitionLog::new()),
            Arc::new(AllowAll),
        )
        .with_catalog_path(path.clone());

        engine.set_default_level("admin", LevelCode::L1).unwrap();
        let reloaded = LevelCatalog::load(&path).unwrap();
        assert_eq!(reloaded.default_level().unwrap().code, LevelCode::L1);
    }

    #[test]
    fn test_permission_denied() {
        struct DenyAll;
        impl PermissionChecker for DenyAll {
            fn has_permission(&self, _: &str, _: &str) -> bool {
                false
            }
        }

        let engine = EscalationEngine::new(
            LevelCatalog::standard(),
            EvaluatorPolicy::new(HOUR),
            Arc::new(MemoryTransitionLog::new()),
            Arc::new(DenyAll),
        );
        engine.bootstrap_agent("a1").unwrap();

        assert!(matches!(
            engine.set_level("eve", "a1", LevelCode::L5),
            Err(EscalationError::PermissionDenied { .. })
        ));
        assert!(matches!(
            engine.set_default_level("eve", LevelCode::L1),
            Err(EscalationError::PermissionDenied { .. })
        ));
        assert_eq!(engine.current_state("a1").unwrap().code, LevelCode::L0);
    }

    #[test]
    fn test_bootstrap_entry_time_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let log = Arc::new(JsonlTransitionLog::open(dir.path()).unwrap());
            let engine = EscalationEngine::new(LevelCatalog::standard(), EvaluatorPolicy::new(HOUR), log, Arc::new(AllowAll));
            engine.bootstrap_agent("a1").unwrap()
        };

        let log = Arc::new(JsonlTransitionLog::open(dir.path()).unwrap());
        let engine = EscalationEngine::new(LevelCatalog::standard(), EvaluatorPolicy::new(HOUR), log, Arc::new(AllowAll));
        let second = engine.bootstrap_agent("a1").unwrap();
        assert_eq!(second.code, LevelCode::L0);
        assert_eq!(second.entered_at, first.entered_at);
        // the initial assignment does not start a promotion cooldown
        assert_eq!(engine.cooldown_elapsed("a1", Utc::now()).unwrap(), Duration::MAX);
        assert_eq!(engine.transition_history("a1", None).unwrap().len(), 1);
    }

    #[test]
    fn test_deactivating_current_level_resets_agent() {
        let (engine, log) = engine();
        engine.bootstrap_agent("a1").unwrap();
        engine.bootstrap_agent("a2").unwrap();
        engine.set_level("ops", "a1", LevelCode::L5).unwrap();
        engine.set_level("ops", "a2", LevelCode::L2).unwrap();

        let mut l5 = engine.levels()[5].clone();
        l5.is_active = false;
        engine.upsert_level("admin", l5).unwrap();

        assert_eq!(engine.current_state("a1").unwrap().code, LevelCode::L0);
        assert_eq!(engine.current_state("a2").unwrap().code, LevelCode::L2);
        let latest = log.latest("a1").unwrap().unwrap();
        assert_eq!(latest.reason, TransitionReason::DefaultReset);
        assert_eq!(latest.from_level, LevelCode::L5);
        assert_eq!(latest.actor.as_deref(), Some("admin"));

        // L0 envelope now applies: 1x leverage, 5% position
        assert!(matches!(
            engine.authorize("a1", &action(0.5, 0.9, 10), 0),
            AuthorizationResult::Rejected {
                reason: RejectReason::LeverageExceeded { .. }
            }
        ));
    }

    #[test]
    fn test_authorize_rejects_inactive_level() {
        let (engine, _) = engine();
        engine.bootstrap_agent("a1").unwrap();
        engine.set_level("ops", "a1", LevelCode::L3).unwrap();

        // deactivate behind the engine's back
        {
            let mut catalog = write(&engine.catalog);
            let mut l3 = catalog.get(LevelCode::L3).unwrap().clone();
            l3.is_active = false;
            catalog.upsert(l3).unwrap();
        }
        assert!(matches!(
            engine.authorize("a1", &action(0.1, 0.9, 1), 0),
            AuthorizationResult::Rejected {
                reason: RejectReason::LevelUnavailable { .. }
            }
        ));
    }

    /// Log that moves the agent's pointer underneath the engine, as a
    /// competing writer would. `read_bumps` fire on `latest`, `append_bumps`
    /// fire on `append` and make it lose the race.
    #[derive(Default)]
    struct ContendedLog {
        inner: MemoryTransitionLog,
        cell: std::sync::Mutex<Option<Arc<LevelCell>>>,
        read_bumps: AtomicUsize,
        append_bumps: AtomicUsize,
    }

    impl ContendedLog {
        fn contend(&self, counter: &AtomicUsize) -> Option<EscalationError> {
            let cell = self.cell.lock().unwrap().clone()?;
            if counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return None;
            }
            let state = cell.load();
            cell.swap(state.version, state.code, state.entered_at).unwrap();
            Some(EscalationError::ConcurrentModification {
                agent_id: cell.agent_id().to_string(),
                expected: state.version,
                found: state.version + 1,
            })
        }
    }

    impl TransitionLog for ContendedLog {
        fn append(&self, record: TransitionRecord) -> Result<(), EscalationError> {
            if let Some(e) = self.contend(&self.append_bumps) {
                return Err(e);
            }
            self.inner.append(record)
        }

        fn history(
            &self,
            agent_id: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<TransitionRecord>, EscalationError> {
            self.inner.history(agent_id, since)
        }

        fn latest(&self, agent_id: &str) -> Result<Option<TransitionRecord>, EscalationError> {
            self.contend(&self.read_bumps);
            self.inner.latest(agent_id)
        }
    }

    fn contended_engine() -> (EscalationEngine, Arc<ContendedLog>) {
        let log = Arc::new(ContendedLog::default());
        let engine = EscalationEngine::new(
            LevelCatalog::standard(),
            EvaluatorPolicy::new(HOUR),
            Arc::clone(&log) as Arc<dyn TransitionLog>,
            Arc::new(AllowAll),
        );
        engine.bootstrap_agent("a1").unwrap();
        engine.set_level("ops", "a1", LevelCode::L1).unwrap();
        *log.cell.lock().unwrap() = Some(engine.cell("a1").unwrap());
        (engine, log)
    }

    fn drawdown_breach() -> PerformanceSnapshot {
        PerformanceSnapshot {
            max_drawdown: Some(0.5),
            ..Default::default()
        }
    }

    #[test]
    fn test_evaluate_retries_once_after_conflict() {
        let (engine, log) = contended_engine();
        log.read_bumps.store(1, Ordering::SeqCst);

        assert_eq!(engine.evaluate("a1", &drawdown_breach()), Decision::Demote(LevelCode::L0));
        let state = engine.current_state("a1").unwrap();
        assert_eq!(state.code, LevelCode::L0);
        assert_eq!(state.version, 3);
    }

    #[test]
    fn test_evaluate_holds_after_second_conflict() {
        let (engine, log) = contended_engine();
        log.read_bumps.store(2, Ordering::SeqCst);

        assert_eq!(engine.evaluate("a1", &drawdown_breach()), Decision::Hold);
        assert_eq!(engine.current_state("a1").unwrap().code, LevelCode::L1);
        assert_eq!(
            log.inner.latest("a1").unwrap().unwrap().reason,
            TransitionReason::ManualOverride
        );
    }

    #[test]
    fn test_manual_transition_retries_once_after_conflict() {
        let (engine, log) = contended_engine();
        log.append_bumps.store(1, Ordering::SeqCst);

        let state = engine.set_level("ops", "a1", LevelCode::L2).unwrap();
        assert_eq!(state.code, LevelCode::L2);
        assert_eq!(state.version, 3);
    }

    #[test]
    fn test_manual_transition_surfaces_second_conflict() {
        let (engine, log) = contended_engine();
        log.append_bumps.store(2, Ordering::SeqCst);

        assert!(matches!(
            engine.set_level("ops", "a1", LevelCode::L2),
            Err(EscalationError::ConcurrentModification { .. })
        ));
        assert_eq!(engine.current_state("a1").unwrap().code, LevelCode::L1);
        assert_eq!(engine.counters().snapshot().manual_transitions, 1);
    }
}
