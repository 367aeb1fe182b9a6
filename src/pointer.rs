//! Per-agent current-level cell.
//!
//! Readers take a cheap `Arc` clone of the whole state, so a concurrent
//! transition is observed either entirely or not at all. Writers go through
//! [`LevelCell::swap`], which compares versions under the write lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::EscalationError;
use crate::level::LevelCode;

/// Immutable view of an agent's level at one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelState {
    pub code: LevelCode,
    pub entered_at: DateTime<Utc>,
    pub version: u64,
}

impl LevelState {
    /// Whole days spent at the current level as of `now`.
    pub fn days_at_level(&self, now: DateTime<Utc>) -> u32 {
        let days = (now - self.entered_at).num_days();
        days.clamp(0, u32::MAX as i64) as u32
    }
}

pub struct LevelCell {
    agent_id: String,
    state: RwLock<Arc<LevelState>>,
    writer: Mutex<()>,
}

impl LevelCell {
    pub fn new(agent_id: impl Into<String>, code: LevelCode, entered_at: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: RwLock::new(Arc::new(LevelState {
                code,
                entered_at,
                version: 0,
            })),
            writer: Mutex::new(()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn load(&self) -> Arc<LevelState> {
        let guard = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Serializes writers for one agent. Hold it across "check version,
    /// persist, swap" so the persisted record and the pointer agree.
    pub fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail with `ConcurrentModification` unless the cell is still at `expected`.
    pub fn check_version(&self, expected: u64) -> Result<(), EscalationError> {
        let found = self.load().version;
        if found != expected {
            return Err(EscalationError::ConcurrentModification {
                agent_id: self.agent_id.clone(),
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Compare-and-swap: install `code` if the version is still `expected`.
    pub fn swap(
        &self,
        expected: u64,
        code: LevelCode,
        entered_at: DateTime<Utc>,
    ) -> Result<Arc<LevelState>, EscalationError> {
        let mut guard = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.version != expected {
            return Err(EscalationError::ConcurrentModification {
                agent_id: self.agent_id.clone(),
                expected,
                found: guard.version,
            });
        }
        let next = Arc::new(LevelState {
            code,
            entered_at,
            version: expected + 1,
        });
        *guard = Arc::clone(&next);
        Ok(next)
    }
}
