use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::evaluator::Decision;
use crate::gate::AuthorizationResult;

/// Engine counters, bumped from the hot path without locking
#[derive(Debug, Default)]
pub struct EngineCounters {
    evaluations: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    holds: AtomicU64,
    snapshot_failures: AtomicU64,
    manual_transitions: AtomicU64,
    authorizations_accepted: AtomicU64,
    authorizations_clamped: AtomicU64,
    authorizations_rejected: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&self, decision: &Decision) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let counter = match decision {
            Decision::Promote(_) => &self.promotions,
            Decision::Demote(_) => &self.demotions,
            Decision::Hold => &self.holds,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manual_transition(&self) {
        self.manual_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authorization(&self, result: &AuthorizationResult) {
        let counter = match result {
            AuthorizationResult::Accepted => &self.authorizations_accepted,
            AuthorizationResult::Clamped { .. } => &self.authorizations_clamped,
            AuthorizationResult::Rejected { .. } => &self.authorizations_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            holds: self.holds.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            manual_transitions: self.manual_transitions.load(Ordering::Relaxed),
            authorizations_accepted: self.authorizations_accepted.load(Ordering::Relaxed),
            authorizations_clamped: self.authorizations_clamped.load(Ordering::Relaxed),
            authorizations_rejected: self.authorizations_rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub evaluations: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub holds: u64,
    pub snapshot_failures: u64,
    pub manual_transitions: u64,
    pub authorizations_accepted: u64,
    pub authorizations_clamped: u64,
    pub authorizations_rejected: u64,
}

/// Heartbeat payload of the escalation daemon
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub uptime_sec: u64,
    pub commands_total: u64,
    pub commands_success: u64,
    pub commands_failed: u64,
    pub memory_bytes: u64,
    #[serde(default)]
    pub engine: CounterSnapshot,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update memory usage from system
    pub fn update_memory(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb) = line.split_whitespace().nth(1) {
                            if let Ok(kb) = kb.parse::<u64>() {
                                self.memory_bytes = kb * 1024;
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.commands_total += 1;
        self.commands_success += 1;
    }

    pub fn record_failure(&mut self) {
        self.commands_total += 1;
        self.commands_failed += 1;
    }

    pub fn increment_uptime(&mut self, seconds: u64) {
        self.uptime_sec += seconds;
    }
}
