//! The permission ladder.
//!
//! Every edit is validated against the whole would-be catalog before it is
//! committed, so a `LevelCatalog` value is always internally consistent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::EscalationError;
use crate::level::{DowngradeConditions, LevelCode, PermissionLevel, TradingParams, UpgradeConditions};

/// A catalog invariant broken by an edit
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogViolation {
    #[error("catalog has no levels")]
    Empty,
    #[error("level {0} defined more than once")]
    DuplicateCode(LevelCode),
    #[error("level codes must be dense: {missing} is missing")]
    SparseCodes { missing: LevelCode },
    #[error("no default level")]
    NoDefault,
    #[error("more than one default level: {codes:?}")]
    MultipleDefaults { codes: Vec<LevelCode> },
    #[error("default level {0} is inactive")]
    DefaultInactive(LevelCode),
    #[error("{code} {field} out of range: {value}")]
    ParamOutOfRange {
        code: LevelCode,
        field: &'static str,
        value: f64,
    },
    #[error("monotonic privilege violated: {higher} maxPositionPct {higher_pct} < {lower} maxPositionPct {lower_pct}")]
    NonMonotonic {
        lower: LevelCode,
        lower_pct: f64,
        higher: LevelCode,
        higher_pct: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    levels: Vec<PermissionLevel>,
}

/// Ordered ladder of permission levels
#[derive(Debug, Clone)]
pub struct LevelCatalog {
    levels: BTreeMap<LevelCode, PermissionLevel>,
}

impl LevelCatalog {
    /// Build a catalog, rejecting it if any invariant fails.
    pub fn from_levels(levels: Vec<PermissionLevel>) -> Result<Self, EscalationError> {
        let mut map = BTreeMap::new();
        for level in levels {
            let code = level.code;
            if map.insert(code, level).is_some() {
                return Err(CatalogViolation::DuplicateCode(code).into());
            }
        }
        validate(&map)?;
        Ok(Self { levels: map })
    }

    /// Seed ladder shipped with the dashboard: L0 (default) through L5.
    pub fn standard() -> Self {
        let levels = vec![
            level(
                LevelCode::L0,
                "Probation",
                "Paper-sized positions, no leverage",
                params(0.05, 1, 0.80, 5),
                None,
                None,
            ),
            level(
                LevelCode::L1,
                "Restricted",
                "Small positions with light leverage",
                params(0.10, 2, 0.75, 10),
                Some(UpgradeConditions {
                    win_rate_7d: Some(0.55),
                    min_trades: Some(10),
                    min_days: Some(3),
                    ..Default::default()
                }),
                Some(DowngradeConditions {
                    max_drawdown: Some(0.10),
                    consecutive_losses: Some(4),
                    win_rate_7d: Some(0.40),
                }),
            ),
            level(
                LevelCode::L2,
                "Standard",
                "Regular trading envelope",
                params(0.20, 3, 0.70, 20),
                Some(upgrade(0.58, 0.55, 1.0, 30, 7)),
                Some(DowngradeConditions {
                    max_drawdown: Some(0.12),
                    consecutive_losses: Some(5),
                    win_rate_7d: Some(0.42),
                }),
            ),
            level(
                LevelCode::L3,
                "Advanced",
                "Larger positions, moderate leverage",
                params(0.30, 5, 0.65, 40),
                Some(upgrade(0.60, 0.58, 1.5, 60, 14)),
                Some(DowngradeConditions {
                    max_drawdown: Some(0.15),
                    consecutive_losses: Some(6),
                    win_rate_7d: Some(0.45),
                }),
            ),
            level(
                LevelCode::L4,
                "Expert",
                "High conviction sizing",
                params(0.40, 8, 0.60, 80),
                Some(upgrade(0.62, 0.60, 2.0, 120, 30)),
                Some(DowngradeConditions {
                    max_drawdown: Some(0.18),
                    consecutive_losses: Some(6),
                    win_rate_7d: Some(0.45),
                }),
            ),
            level(
                LevelCode::L5,
                "Autonomous",
                "Full envelope, no daily trade cap",
                params(0.50, 10, 0.55, 0),
                Some(upgrade(0.65, 0.62, 2.5, 250, 60)),
                Some(DowngradeConditions {
                    max_drawdown: Some(0.20),
                    consecutive_losses: Some(5),
                    win_rate_7d: Some(0.48),
                }),
            ),
        ];

        let mut map = BTreeMap::new();
        for l in levels {
            map.insert(l.code, l);
        }
        let mut catalog = Self { levels: map };
        if let Some(l0) = catalog.levels.get_mut(&LevelCode::L0) {
            l0.is_default = true;
        }
        catalog
    }

    /// Load a catalog from a JSON file (`{"levels": [...]}`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EscalationError> {
        let data = fs::read_to_string(path.as_ref())?;
        let file: CatalogFile = serde_json::from_str(&data)?;
        let catalog = Self::from_levels(file.levels)?;
        info!(
            path = %path.as_ref().display(),
            levels = catalog.len(),
            "level catalog loaded"
        );
        Ok(catalog)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), EscalationError> {
        let file = CatalogFile {
            levels: self.list_ordered().into_iter().cloned().collect(),
        };
        let data = serde_json::to_string_pretty(&file)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn get(&self, code: LevelCode) -> Result<&PermissionLevel, EscalationError> {
        self.levels
            .get(&code)
            .ok_or_else(|| EscalationError::InvalidLevel(format!("{} not in catalog", code)))
    }

    /// All levels ascending by code; inactive levels included.
    pub fn list_ordered(&self) -> Vec<&PermissionLevel> {
        self.levels.values().collect()
    }

    /// Move the default flag to `code`.
    pub fn set_default(&mut self, code: LevelCode) -> Result<(), EscalationError> {
        let target = self.get(code)?;
        if !target.is_active {
            return Err(EscalationError::InvalidLevel(format!(
                "{} is inactive and cannot be the default",
                code
            )));
        }
        for level in self.levels.values_mut() {
            level.is_default = level.code == code;
        }
        info!(level = %code, "default level changed");
        Ok(())
    }

    /// Insert or replace a level. Nothing changes if the result would break
    /// an invariant. Returns the replaced level, if any.
    pub fn upsert(&mut self, level: PermissionLevel) -> Result<Option<PermissionLevel>, EscalationError> {
        let mut candidate = self.levels.clone();
        let code = level.code;
        let previous = candidate.insert(code, level);
        validate(&candidate)?;
        self.levels = candidate;
        info!(level = %code, replaced = previous.is_some(), "level upserted");
        Ok(previous)
    }

    pub fn default_level(&self) -> Result<&PermissionLevel, EscalationError> {
        self.levels
            .values()
            .find(|l| l.is_default)
            .ok_or_else(|| EscalationError::InvalidLevel("catalog has no default level".into()))
    }

    pub fn next_higher_active(&self, code: LevelCode) -> Option<&PermissionLevel> {
        self.levels
            .range((std::ops::Bound::Excluded(code), std::ops::Bound::Unbounded))
            .map(|(_, l)| l)
            .find(|l| l.is_active)
    }

    pub fn next_lower_active(&self, code: LevelCode) -> Option<&PermissionLevel> {
        self.levels
            .range(..code)
            .rev()
            .map(|(_, l)| l)
            .find(|l| l.is_active)
    }

    pub fn top_active(&self) -> Option<&PermissionLevel> {
        self.levels.values().rev().find(|l| l.is_active)
    }

    pub fn bottom_active(&self) -> Option<&PermissionLevel> {
        self.levels.values().find(|l| l.is_active)
    }
}

impl Default for LevelCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

fn validate(levels: &BTreeMap<LevelCode, PermissionLevel>) -> Result<(), CatalogViolation> {
    if levels.is_empty() {
        return Err(CatalogViolation::Empty);
    }

    for (i, code) in levels.keys().enumerate() {
        if code.index() != i {
            let missing = LevelCode::from_index(i).unwrap_or(*code);
            return Err(CatalogViolation::SparseCodes { missing });
        }
    }

    let defaults: Vec<LevelCode> = levels.values().filter(|l| l.is_default).map(|l| l.code).collect();
    match defaults.as_slice() {
        [] => return Err(CatalogViolation::NoDefault),
        [code] => {
            if !levels[code].is_active {
                return Err(CatalogViolation::DefaultInactive(*code));
            }
        }
        _ => return Err(CatalogViolation::MultipleDefaults { codes: defaults }),
    }

    for level in levels.values() {
        let p = &level.trading_params;
        if !in_unit_interval(p.max_position_pct) {
            return Err(CatalogViolation::ParamOutOfRange {
                code: level.code,
                field: "maxPositionPct",
                value: p.max_position_pct,
            });
        }
        if !in_unit_interval(p.confidence_threshold) {
            return Err(CatalogViolation::ParamOutOfRange {
                code: level.code,
                field: "confidenceThreshold",
                value: p.confidence_threshold,
            });
        }
        if p.max_leverage < 1 {
            return Err(CatalogViolation::ParamOutOfRange {
                code: level.code,
                field: "maxLeverage",
                value: p.max_leverage as f64,
            });
        }
    }

    let ordered: Vec<&PermissionLevel> = levels.values().collect();
    for pair in ordered.windows(2) {
        let (lower, higher) = (pair[0], pair[1]);
        let lower_pct = lower.trading_params.max_position_pct;
        let higher_pct = higher.trading_params.max_position_pct;
        if higher_pct < lower_pct {
            return Err(CatalogViolation::NonMonotonic {
                lower: lower.code,
                lower_pct,
                higher: higher.code,
                higher_pct,
            });
        }
    }

    Ok(())
}

fn in_unit_interval(v: f64) -> bool {
    v.is_finite() && v > 0.0 && v <= 1.0
}

fn params(max_position_pct: f64, max_leverage: u32, confidence_threshold: f64, max_daily_trades: u32) -> TradingParams {
    TradingParams {
        max_position_pct,
        max_leverage,
        confidence_threshold,
        max_daily_trades,
    }
}

fn upgrade(win_rate_7d: f64, win_rate_30d: f64, sharpe_ratio: f64, min_trades: u64, min_days: u32) -> UpgradeConditions {
    UpgradeConditions {
        win_rate_7d: Some(win_rate_7d),
        win_rate_30d: Some(win_rate_30d),
        sharpe_ratio: Some(sharpe_ratio),
        min_trades: Some(min_trades),
        min_days: Some(min_days),
    }
}

fn level(
    code: LevelCode,
    name: &str,
    description: &str,
    trading_params: TradingParams,
    upgrade_conditions: Option<UpgradeConditions>,
    downgrade_conditions: Option<DowngradeConditions>,
) -> PermissionLevel {
    PermissionLevel {
        code,
        name: name.to_string(),
        description: description.to_string(),
        trading_params,
        upgrade_conditions,
        downgrade_conditions,
        is_active: true,
        is_default: false,
    }
}
