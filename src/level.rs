//! Permission level definitions and the performance snapshot they are judged against.
//!
//! Field names serialize in camelCase so level blobs edited in the admin
//! dashboard deserialize without a translation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EscalationError;

/// Ordered permission tier. `L0` is the least privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LevelCode {
    L0,
    L1,
    L2,
    L3,
    L4,
    L5,
}

impl LevelCode {
    pub const ALL: [LevelCode; 6] = [
        LevelCode::L0,
        LevelCode::L1,
        LevelCode::L2,
        LevelCode::L3,
        LevelCode::L4,
        LevelCode::L5,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LevelCode::L0 => "L0",
            LevelCode::L1 => "L1",
            LevelCode::L2 => "L2",
            LevelCode::L3 => "L3",
            LevelCode::L4 => "L4",
            LevelCode::L5 => "L5",
        }
    }
}

impl fmt::Display for LevelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LevelCode {
    type Err = EscalationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        LevelCode::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| EscalationError::InvalidLevel(format!("unknown level code: {}", s)))
    }
}

/// Numeric envelope enforced while the agent sits at a level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingParams {
    /// Fraction of equity a single position may use, in (0, 1]
    pub max_position_pct: f64,
    pub max_leverage: u32,
    /// Minimum decision confidence, in (0, 1]
    pub confidence_threshold: f64,
    /// 0 means unlimited
    #[serde(default)]
    pub max_daily_trades: u32,
}

impl TradingParams {
    /// Daily trade cap, `None` when unlimited.
    pub fn daily_trade_cap(&self) -> Option<u32> {
        if self.max_daily_trades == 0 {
            None
        } else {
            Some(self.max_daily_trades)
        }
    }
}

/// Thresholds that must ALL hold to enter a level automatically.
/// An absent field imposes no requirement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_rate_7d: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_rate_30d: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpe_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trades: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_days: Option<u32>,
}

impl UpgradeConditions {
    pub fn is_empty(&self) -> bool {
        self.win_rate_7d.is_none()
            && self.win_rate_30d.is_none()
            && self.sharpe_ratio.is_none()
            && self.min_trades.is_none()
            && self.min_days.is_none()
    }

    /// Every present condition is met. A snapshot field that is missing never
    /// satisfies the condition that reads it.
    pub fn satisfied_by(&self, s: &PerformanceSnapshot) -> bool {
        at_least(self.win_rate_7d, s.win_rate_7d)
            && at_least(self.win_rate_30d, s.win_rate_30d)
            && at_least(self.sharpe_ratio, s.sharpe_ratio)
            && at_least(self.min_trades, s.total_trades)
            && at_least(self.min_days, s.days_since_level_entry)
    }
}

/// Thresholds of which ANY breach forces a demotion off the level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_drawdown: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_losses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_rate_7d: Option<f64>,
}

/// A single breached downgrade condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Breach {
    MaxDrawdown { observed: f64, limit: f64 },
    ConsecutiveLosses { observed: u32, limit: u32 },
    WinRate7d { observed: f64, floor: f64 },
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breach::MaxDrawdown { observed, limit } => {
                write!(f, "drawdown {:.4} > {:.4}", observed, limit)
            }
            Breach::ConsecutiveLosses { observed, limit } => {
                write!(f, "{} consecutive losses > {}", observed, limit)
            }
            Breach::WinRate7d { observed, floor } => {
                write!(f, "7d win rate {:.4} < {:.4}", observed, floor)
            }
        }
    }
}

impl DowngradeConditions {
    pub fn is_empty(&self) -> bool {
        self.max_drawdown.is_none() && self.consecutive_losses.is_none() && self.win_rate_7d.is_none()
    }

    /// Every present condition the snapshot breaches. Missing snapshot fields
    /// never count as a breach.
    pub fn breaches(&self, s: &PerformanceSnapshot) -> Vec<Breach> {
        let mut out = Vec::new();
        if let (Some(limit), Some(observed)) = (self.max_drawdown, s.max_drawdown) {
            if observed > limit {
                out.push(Breach::MaxDrawdown { observed, limit });
            }
        }
        if let (Some(limit), Some(observed)) = (self.consecutive_losses, s.consecutive_losses) {
            if observed > limit {
                out.push(Breach::ConsecutiveLosses { observed, limit });
            }
        }
        if let (Some(floor), Some(observed)) = (self.win_rate_7d, s.win_rate_7d) {
            if observed < floor {
                out.push(Breach::WinRate7d { observed, floor });
            }
        }
        out
    }
}

fn at_least<T: PartialOrd>(threshold: Option<T>, observed: Option<T>) -> bool {
    match (threshold, observed) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(t), Some(o)) => o >= t,
    }
}

/// One rung of the permission ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionLevel {
    pub code: LevelCode,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trading_params: TradingParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_conditions: Option<UpgradeConditions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downgrade_conditions: Option<DowngradeConditions>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
}

fn default_true() -> bool {
    true
}

impl PermissionLevel {
    /// True when the level can be entered by automatic promotion at all.
    pub fn has_upgrade_conditions(&self) -> bool {
        self.upgrade_conditions
            .as_ref()
            .map_or(false, |c| !c.is_empty())
    }

    pub fn has_downgrade_conditions(&self) -> bool {
        self.downgrade_conditions
            .as_ref()
            .map_or(false, |c| !c.is_empty())
    }
}

/// Rolling performance rollup produced by the trade-history aggregator.
///
/// Win rates and drawdown are fractions in `[0, 1]`. Every field is optional:
/// a missing telemetry value must never help the agent get promoted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    #[serde(default)]
    pub win_rate_7d: Option<f64>,
    #[serde(default)]
    pub win_rate_30d: Option<f64>,
    #[serde(default)]
    pub sharpe_ratio: Option<f64>,
    #[serde(default)]
    pub max_drawdown: Option<f64>,
    #[serde(default)]
    pub consecutive_losses: Option<u32>,
    #[serde(default)]
    pub total_trades: Option<u64>,
    #[serde(default)]
    pub days_since_level_entry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

impl PerformanceSnapshot {
    /// Reasons the snapshot cannot be trusted, empty when it is well formed.
    pub fn defects(&self) -> Vec<String> {
        let mut defects = Vec::new();
        for (field, value) in [
            ("winRate7d", self.win_rate_7d),
            ("winRate30d", self.win_rate_30d),
            ("maxDrawdown", self.max_drawdown),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                    defects.push(format!("{} out of range: {}", field, v));
                }
            }
        }
        if let Some(v) = self.sharpe_ratio {
            if !v.is_finite() {
                defects.push(format!("sharpeRatio not finite: {}", v));
            }
        }
        defects
    }
}
