//! Promotion / demotion decisions.
//!
//! Asymmetric hysteresis: demotion is checked first and ignores the cooldown,
//! promotion needs the cooldown to have elapsed and moves a single step.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::LevelCatalog;
use crate::level::{Breach, LevelCode, PerformanceSnapshot};

/// Outcome of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "level", rename_all = "snake_case")]
pub enum Decision {
    Promote(LevelCode),
    Demote(LevelCode),
    Hold,
}

impl Decision {
    pub fn target(&self) -> Option<LevelCode> {
        match self {
            Decision::Promote(c) | Decision::Demote(c) => Some(*c),
            Decision::Hold => None,
        }
    }
}

/// Tunables with no product-mandated defaults: the cooldown must be
/// configured explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorPolicy {
    /// Minimum time since the last transition before a promotion is allowed
    pub promotion_cooldown: Duration,
    /// Upper bound on levels dropped in one evaluation
    pub max_demotion_steps: u32,
}

impl EvaluatorPolicy {
    pub fn new(promotion_cooldown: Duration) -> Self {
        Self {
            promotion_cooldown,
            max_demotion_steps: 1,
        }
    }
}

pub struct EscalationEvaluator {
    policy: EvaluatorPolicy,
}

impl EscalationEvaluator {
    pub fn new(policy: EvaluatorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EvaluatorPolicy {
        &self.policy
    }

    /// Downgrade conditions of `current` breached by `snapshot`.
    pub fn breaches(
        &self,
        catalog: &LevelCatalog,
        current: LevelCode,
        snapshot: &PerformanceSnapshot,
    ) -> Vec<Breach> {
        catalog
            .get(current)
            .ok()
            .and_then(|l| l.downgrade_conditions.as_ref())
            .map(|c| c.breaches(snapshot))
            .unwrap_or_default()
    }

    /// Decide whether the agent at `current` should move.
    ///
    /// Never fails: an unknown level or a malformed snapshot yields `Hold`.
    pub fn evaluate(
        &self,
        catalog: &LevelCatalog,
        current: LevelCode,
        snapshot: &PerformanceSnapshot,
        cooldown_elapsed: Duration,
    ) -> Decision {
        if let Err(e) = catalog.get(current) {
            warn!(level = %current, error = %e, "current level missing from catalog, holding");
            return Decision::Hold;
        }

        let defects = snapshot.defects();
        if !defects.is_empty() {
            warn!(level = %current, defects = ?defects, "malformed performance snapshot, holding");
            return Decision::Hold;
        }

        let breaches = self.breaches(catalog, current, snapshot);
        if !breaches.is_empty() {
            let steps = self
                .policy
                .max_demotion_steps
                .max(1)
                .min(breaches.len() as u32);
            let mut target = current;
            for _ in 0..steps {
                match catalog.next_lower_active(target) {
                    Some(lower) => target = lower.code,
                    None => break,
                }
            }
            if target == current {
                debug!(level = %current, breaches = breaches.len(), "downgrade breached at floor level");
                return Decision::Hold;
            }
            let reasons: Vec<String> = breaches.iter().map(|b| b.to_string()).collect();
            info!(from = %current, to = %target, reasons = ?reasons, "downgrade conditions breached");
            return Decision::Demote(target);
        }

        // the cooldown must be strictly exceeded
        if cooldown_elapsed <= self.policy.promotion_cooldown {
            debug!(
                level = %current,
                elapsed_secs = cooldown_elapsed.as_secs(),
                cooldown_secs = self.policy.promotion_cooldown.as_secs(),
                "promotion cooldown active"
            );
            return Decision::Hold;
        }

        let candidate = match catalog.next_higher_active(current) {
            Some(c) => c,
            None => return Decision::Hold,
        };

        // A level without upgrade conditions is only reachable by manual override.
        let conditions = match candidate.upgrade_conditions.as_ref() {
            Some(c) if !c.is_empty() => c,
            _ => return Decision::Hold,
        };

        if conditions.satisfied_by(snapshot) {
            info!(from = %current, to = %candidate.code, "upgrade conditions met");
            Decision::Promote(candidate.code)
        } else {
            Decision::Hold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{DowngradeConditions, UpgradeConditions};

    const DAY: Duration = Duration::from_secs(86_400);

    fn evaluator() -> EscalationEvaluator {
        EscalationEvaluator::new(EvaluatorPolicy::new(DAY))
    }

    fn strong_snapshot() -> PerformanceSnapshot {
        PerformanceSnapshot {
            win_rate_7d: Some(0.9),
            win_rate_30d: Some(0.9),
            sharpe_ratio: Some(5.0),
            max_drawdown: Some(0.01),
            consecutive_losses: Some(0),
            total_trades: Some(10_000),
            days_since_level_entry: Some(365),
            as_of: None,
        }
    }

    fn catalog_with(
        code: LevelCode,
        up: Option<UpgradeConditions>,
        down: Option<DowngradeConditions>,
    ) -> LevelCatalog {
        let mut catalog = LevelCatalog::standard();
        let mut level = catalog.get(code).unwrap().clone();
        level.upgrade_conditions = up;
        level.downgrade_conditions = down;
        catalog.upsert(level).unwrap();
        catalog
    }

    #[test]
    fn test_drawdown_breach_demotes_one_step() {
        let catalog = catalog_with(
            LevelCode::L1,
            None,
            Some(DowngradeConditions {
                max_drawdown: Some(0.1),
                ..Default::default()
            }),
        );
        let snap = PerformanceSnapshot {
            max_drawdown: Some(0.15),
            ..Default::default()
        };
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L1, &snap, Duration::ZERO),
            Decision::Demote(LevelCode::L0)
        );
    }

    #[test]
    fn test_demotion_ignores_cooldown() {
        let catalog = LevelCatalog::standard();
        let snap = PerformanceSnapshot {
            consecutive_losses: Some(20),
            ..Default::default()
        };
        for elapsed in [Duration::ZERO, DAY * 30] {
            assert_eq!(
                evaluator().evaluate(&catalog, LevelCode::L3, &snap, elapsed),
                Decision::Demote(LevelCode::L2)
            );
        }
    }

    #[test]
    fn test_multiple_breaches_single_step_by_default() {
        let catalog = LevelCatalog::standard();
        let snap = PerformanceSnapshot {
            max_drawdown: Some(0.9),
            consecutive_losses: Some(50),
            win_rate_7d: Some(0.0),
            ..Default::default()
        };
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L4, &snap, Duration::ZERO),
            Decision::Demote(LevelCode::L3)
        );
    }

    #[test]
    fn test_multi_step_demotion_when_configured() {
        let catalog = LevelCatalog::standard();
        let mut policy = EvaluatorPolicy::new(DAY);
        policy.max_demotion_steps = 3;
        let evaluator = EscalationEvaluator::new(policy);

        let two_breaches = PerformanceSnapshot {
            max_drawdown: Some(0.9),
            consecutive_losses: Some(50),
            ..Default::default()
        };
        assert_eq!(
            evaluator.evaluate(&catalog, LevelCode::L4, &two_breaches, Duration::ZERO),
            Decision::Demote(LevelCode::L2)
        );
    }

    #[test]
    fn test_demotion_skips_inactive_levels() {
        let mut catalog = LevelCatalog::standard();
        let mut l2 = catalog.get(LevelCode::L2).unwrap().clone();
        l2.is_active = false;
        catalog.upsert(l2).unwrap();

        let snap = PerformanceSnapshot {
            max_drawdown: Some(0.5),
            ..Default::default()
        };
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L3, &snap, Duration::ZERO),
            Decision::Demote(LevelCode::L1)
        );
    }

    #[test]
    fn test_promotion_when_conditions_met() {
        let catalog = catalog_with(
            LevelCode::L3,
            Some(UpgradeConditions {
                win_rate_7d: Some(0.6),
                min_trades: Some(20),
                ..Default::default()
            }),
            None,
        );
        let snap = PerformanceSnapshot {
            win_rate_7d: Some(0.65),
            total_trades: Some(25),
            ..Default::default()
        };
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L2, &snap, DAY * 2),
            Decision::Promote(LevelCode::L3)
        );
    }

    #[test]
    fn test_promotion_blocked_by_cooldown() {
        let catalog = LevelCatalog::standard();
        let snap = strong_snapshot();
        let ev = evaluator();
        let elapsed = Duration::from_secs(60);
        assert_eq!(ev.evaluate(&catalog, LevelCode::L1, &snap, elapsed), Decision::Hold);
        assert_eq!(ev.evaluate(&catalog, LevelCode::L1, &snap, elapsed), Decision::Hold);
        assert_eq!(ev.evaluate(&catalog, LevelCode::L1, &snap, DAY), Decision::Hold);
        assert_eq!(
            ev.evaluate(&catalog, LevelCode::L1, &snap, DAY + Duration::from_secs(1)),
            Decision::Promote(LevelCode::L2)
        );
    }

    #[test]
    fn test_promotion_requires_every_present_condition() {
        let catalog = LevelCatalog::standard();
        let mut snap = strong_snapshot();
        snap.sharpe_ratio = None;
        // L2 requires a Sharpe ratio; a missing value must not pass
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L1, &snap, DAY * 30),
            Decision::Hold
        );
    }

    #[test]
    fn test_ceiling_never_promotes() {
        let catalog = LevelCatalog::standard();
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L5, &strong_snapshot(), DAY * 365),
            Decision::Hold
        );
    }

    #[test]
    fn test_floor_never_demotes() {
        let catalog = catalog_with(
            LevelCode::L0,
            None,
            Some(DowngradeConditions {
                max_drawdown: Some(0.01),
                consecutive_losses: Some(0),
                win_rate_7d: Some(0.99),
            }),
        );
        let awful = PerformanceSnapshot {
            win_rate_7d: Some(0.0),
            max_drawdown: Some(1.0),
            consecutive_losses: Some(100),
            ..Default::default()
        };
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L0, &awful, DAY),
            Decision::Hold
        );
    }

    #[test]
    fn test_level_without_upgrade_conditions_is_manual_only() {
        let catalog = catalog_with(LevelCode::L4, None, None);
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L3, &strong_snapshot(), DAY * 365),
            Decision::Hold
        );
    }

    #[test]
    fn test_level_without_downgrade_conditions_never_demotes() {
        let catalog = catalog_with(LevelCode::L3, None, None);
        let awful = PerformanceSnapshot {
            max_drawdown: Some(0.99),
            consecutive_losses: Some(99),
            ..Default::default()
        };
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L3, &awful, Duration::ZERO),
            Decision::Hold
        );
    }

    #[test]
    fn test_empty_snapshot_never_promotes() {
        let catalog = LevelCatalog::standard();
        for code in LevelCode::ALL {
            assert_eq!(
                evaluator().evaluate(&catalog, code, &PerformanceSnapshot::default(), DAY * 365),
                Decision::Hold
            );
        }
    }

    #[test]
    fn test_malformed_snapshot_holds() {
        let catalog = LevelCatalog::standard();
        let mut snap = strong_snapshot();
        snap.win_rate_7d = Some(f64::NAN);
        assert_eq!(
            evaluator().evaluate(&catalog, LevelCode::L1, &snap, DAY * 365),
            Decision::Hold
        );
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_string(&Decision::Promote(LevelCode::L3)).unwrap();
        assert_eq!(json, r#"{"decision":"promote","level":"L3"}"#);
        let hold = serde_json::to_string(&Decision::Hold).unwrap();
        assert_eq!(hold, r#"{"decision":"hold"}"#);
    }
}
