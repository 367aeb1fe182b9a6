//! Local trade-history aggregation.
//!
//! Rolls closed trades into a [`PerformanceSnapshot`] for deployments that
//! have no orchestrator-side aggregator (paper sessions, offline replays).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::EscalationError;
use crate::level::PerformanceSnapshot;
use crate::telemetry::TelemetrySource;

/// A completed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub closed_at: DateTime<Utc>,
    pub symbol: String,
    pub pnl: f64,
    /// Return on the capital committed, e.g. 0.02 for +2%
    pub return_pct: f64,
}

/// Rolling performance tracker for one agent
pub struct PerformanceTracker {
    trades: VecDeque<ClosedTrade>,
    max_history: usize,
    starting_equity: f64,
}

impl PerformanceTracker {
    pub fn new(starting_equity: f64, max_history: usize) -> Self {
        Self {
            trades: VecDeque::new(),
            max_history,
            starting_equity,
        }
    }

    pub fn record(&mut self, trade: ClosedTrade) {
        debug!(symbol = %trade.symbol, pnl = trade.pnl, "recording closed trade");
        self.trades.push_back(trade);
        if self.trades.len() > self.max_history {
            self.trades.pop_front();
        }
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    /// Win fraction of trades closed within `window` before `now`, `None`
    /// when there were none.
    pub fn win_rate(&self, now: DateTime<Utc>, window: Duration) -> Option<f64> {
        let cutoff = now - window;
        let (wins, total) = self
            .trades
            .iter()
            .filter(|t| t.closed_at > cutoff && t.closed_at <= now)
            .fold((0usize, 0usize), |(w, n), t| (w + (t.pnl > 0.0) as usize, n + 1));
        if total == 0 {
            None
        } else {
            Some(wins as f64 / total as f64)
        }
    }

    /// Per-trade Sharpe ratio (risk-free rate 0).
    pub fn sharpe_ratio(&self) -> Option<f64> {
        if self.trades.len() < 2 {
            return None;
        }
        let n = self.trades.len() as f64;
        let mean = self.trades.iter().map(|t| t.return_pct).sum::<f64>() / n;
        let variance = self
            .trades
            .iter()
            .map(|t| (t.return_pct - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return None;
        }
        Some(mean / std_dev)
    }

    /// Largest peak-to-trough equity decline as a fraction of the peak.
    pub fn max_drawdown(&self) -> Option<f64> {
        if self.trades.is_empty() || self.starting_equity <= 0.0 {
            return None;
        }
        let mut equity = self.starting_equity;
        let mut peak = equity;
        let mut worst: f64 = 0.0;
        for t in &self.trades {
            equity += t.pnl;
            if equity > peak {
                peak = equity;
            } else {
                worst = worst.max((peak - equity) / peak);
            }
        }
        Some(worst.clamp(0.0, 1.0))
    }

    /// Losses since the most recent winning trade.
    pub fn consecutive_losses(&self) -> u32 {
        self.trades.iter().rev().take_while(|t| t.pnl < 0.0).count() as u32
    }

    pub fn trades_on_day(&self, now: DateTime<Utc>) -> u32 {
        let today = now.date_naive();
        self.trades
            .iter()
            .filter(|t| t.closed_at.date_naive() == today)
            .count() as u32
    }

    /// Snapshot as of `now`. `daysSinceLevelEntry` is left for the engine,
    /// which owns the level pointer.
    pub fn snapshot(&self, now: DateTime<Utc>) -> PerformanceSnapshot {
        PerformanceSnapshot {
            win_rate_7d: self.win_rate(now, Duration::days(7)),
            win_rate_30d: self.win_rate(now, Duration::days(30)),
            sharpe_ratio: self.sharpe_ratio(),
            max_drawdown: self.max_drawdown(),
            consecutive_losses: Some(self.consecutive_losses()),
            total_trades: Some(self.trades.len() as u64),
            days_since_level_entry: None,
            as_of: Some(now),
        }
    }

    pub fn reset(&mut self) {
        info!(trades = self.trades.len(), "resetting performance tracker");
        self.trades.clear();
    }
}

/// In-process [`TelemetrySource`] backed by per-agent trackers
pub struct LocalTelemetry {
    starting_equity: f64,
    max_history: usize,
    trackers: Mutex<HashMap<String, PerformanceTracker>>,
}

impl LocalTelemetry {
    pub fn new(starting_equity: f64, max_history: usize) -> Self {
        Self {
            starting_equity,
            max_history,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_trade(&self, agent_id: &str, trade: ClosedTrade) {
        let mut trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
        trackers
            .entry(agent_id.to_string())
            .or_insert_with(|| PerformanceTracker::new(self.starting_equity, self.max_history))
            .record(trade);
    }
}

#[async_trait]
impl TelemetrySource for LocalTelemetry {
    async fn fetch_snapshot(&self, agent_id: &str) -> Result<PerformanceSnapshot, EscalationError> {
        let trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
        trackers
            .get(agent_id)
            .map(|t| t.snapshot(Utc::now()))
            .ok_or_else(|| EscalationError::SnapshotUnavailable(format!("no trades recorded for {}", agent_id)))
    }

    async fn fetch_daily_trade_count(&self, agent_id: &str) -> Result<u32, EscalationError> {
        let trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
        Ok(trackers
            .get(agent_id)
            .map_or(0, |t| t.trades_on_day(Utc::now())))
    }
}
