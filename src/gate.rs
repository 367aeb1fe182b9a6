//! Trade authorization against the current level's trading envelope.
//!
//! The gate keeps nothing between calls: the daily trade count is supplied
//! by the caller.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::level::TradingParams;

/// A trade the decision pipeline wants to place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub symbol: String,
    /// Fraction of equity, e.g. 0.1 for 10%
    pub position_size_pct: f64,
    pub leverage: u32,
    /// Decision confidence in [0, 1]
    pub confidence: f64,
}

/// Why a trade was denied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    LowConfidence { confidence: f64, threshold: f64 },
    DailyTradeLimit { count: u32, limit: u32 },
    LeverageExceeded { requested: u32, max: u32 },
    InvalidAction { detail: String },
    UnknownAgent { agent_id: String },
    LevelUnavailable { level: String },
    TradeCountUnavailable { detail: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::LowConfidence { confidence, threshold } => {
                write!(f, "confidence {:.3} below threshold {:.3}", confidence, threshold)
            }
            RejectReason::DailyTradeLimit { count, limit } => {
                write!(f, "daily trade limit reached ({}/{})", count, limit)
            }
            RejectReason::LeverageExceeded { requested, max } => {
                write!(f, "leverage {}x exceeds max {}x", requested, max)
            }
            RejectReason::InvalidAction { detail } => write!(f, "invalid action: {}", detail),
            RejectReason::UnknownAgent { agent_id } => write!(f, "unknown agent {}", agent_id),
            RejectReason::LevelUnavailable { level } => write!(f, "level {} unavailable", level),
            RejectReason::TradeCountUnavailable { detail } => {
                write!(f, "daily trade count unavailable: {}", detail)
            }
        }
    }
}

/// Gate verdict. Rejection is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuthorizationResult {
    Accepted,
    Clamped { adjusted: ProposedAction },
    Rejected { reason: RejectReason },
}

impl AuthorizationResult {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, AuthorizationResult::Rejected { .. })
    }

    /// The action to execute, if any.
    pub fn effective_action(&self, original: &ProposedAction) -> Option<ProposedAction> {
        match self {
            AuthorizationResult::Accepted => Some(original.clone()),
            AuthorizationResult::Clamped { adjusted } => Some(adjusted.clone()),
            AuthorizationResult::Rejected { .. } => None,
        }
    }

    pub(crate) fn rejected(reason: RejectReason) -> Self {
        AuthorizationResult::Rejected { reason }
    }
}

/// Check `action` against `params`. Oversized positions are clamped, never
/// rejected on size alone.
pub fn authorize(params: &TradingParams, action: &ProposedAction, daily_trade_count: u32) -> AuthorizationResult {
    if !action.position_size_pct.is_finite() || action.position_size_pct <= 0.0 {
        return AuthorizationResult::rejected(RejectReason::InvalidAction {
            detail: format!("position size {} must be positive", action.position_size_pct),
        });
    }
    if action.leverage == 0 {
        return AuthorizationResult::rejected(RejectReason::InvalidAction {
            detail: "leverage must be at least 1x".to_string(),
        });
    }
    if !action.confidence.is_finite() {
        return AuthorizationResult::rejected(RejectReason::InvalidAction {
            detail: format!("confidence {} is not a number", action.confidence),
        });
    }

    if action.confidence < params.confidence_threshold {
        return AuthorizationResult::rejected(RejectReason::LowConfidence {
            confidence: action.confidence,
            threshold: params.confidence_threshold,
        });
    }

    if let Some(limit) = params.daily_trade_cap() {
        if daily_trade_count >= limit {
            return AuthorizationResult::rejected(RejectReason::DailyTradeLimit {
                count: daily_trade_count,
                limit,
            });
        }
    }

    if action.leverage > params.max_leverage {
        return AuthorizationResult::rejected(RejectReason::LeverageExceeded {
            requested: action.leverage,
            max: params.max_leverage,
        });
    }

    if action.position_size_pct > params.max_position_pct {
        let mut adjusted = action.clone();
        adjusted.position_size_pct = params.max_position_pct;
        return AuthorizationResult::Clamped { adjusted };
    }

    AuthorizationResult::Accepted
}
