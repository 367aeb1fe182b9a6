//! Append-only audit trail of level transitions.
//!
//! The JSONL store writes one record per line and never rewrites earlier
//! lines; on open it replays the file into memory for `history` queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EscalationError;
use crate::level::{LevelCode, PerformanceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ConditionsMetPromote,
    ConditionsBreachedDemote,
    ManualOverride,
    DefaultReset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub from_level: LevelCode,
    pub to_level: LevelCode,
    pub reason: TransitionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_used: Option<PerformanceSnapshot>,
    /// Operator who requested a manual transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl TransitionRecord {
    pub fn new(
        agent_id: impl Into<String>,
        from_level: LevelCode,
        to_level: LevelCode,
        reason: TransitionReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            from_level,
            to_level,
            reason,
            snapshot_used: None,
            actor: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: PerformanceSnapshot) -> Self {
        self.snapshot_used = Some(snapshot);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// First record of a brand-new agent: placed at the default level
    /// without moving from anywhere.
    pub fn is_initial_assignment(&self) -> bool {
        self.from_level == self.to_level
    }
}

/// Write-once transition store
pub trait TransitionLog: Send + Sync {
    fn append(&self, record: TransitionRecord) -> Result<(), EscalationError>;

    /// Records for `agent_id` with `timestamp >= since`, oldest first.
    fn history(
        &self,
        agent_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransitionRecord>, EscalationError>;

    /// Most recent record for `agent_id` by timestamp.
    fn latest(&self, agent_id: &str) -> Result<Option<TransitionRecord>, EscalationError>;
}

fn select(records: &[TransitionRecord], agent_id: &str, since: Option<DateTime<Utc>>) -> Vec<TransitionRecord> {
    let mut out: Vec<TransitionRecord> = records
        .iter()
        .filter(|r| r.agent_id == agent_id && since.map_or(true, |s| r.timestamp >= s))
        .cloned()
        .collect();
    out.sort_by_key(|r| r.timestamp);
    out
}

/// Keep `record` as the agent's latest unless a newer one is already known.
fn track_latest(latest: &mut HashMap<String, TransitionRecord>, record: &TransitionRecord) {
    match latest.get(&record.agent_id) {
        Some(known) if known.timestamp > record.timestamp => {}
        _ => {
            latest.insert(record.agent_id.clone(), record.clone());
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Volatile log for tests and single-run paper sessions
#[derive(Default)]
pub struct MemoryTransitionLog {
    records: Mutex<Vec<TransitionRecord>>,
}

impl MemoryTransitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransitionLog for MemoryTransitionLog {
    fn append(&self, record: TransitionRecord) -> Result<(), EscalationError> {
        lock(&self.records).push(record);
        Ok(())
    }

    fn history(
        &self,
        agent_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransitionRecord>, EscalationError> {
        Ok(select(&lock(&self.records), agent_id, since))
    }

    fn latest(&self, agent_id: &str) -> Result<Option<TransitionRecord>, EscalationError> {
        Ok(lock(&self.records)
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .max_by_key(|r| r.timestamp)
            .cloned())
    }
}

/// JSONL file-backed log. Only the latest record per agent is kept in
/// memory; `history` reads the file.
pub struct JsonlTransitionLog {
    path: PathBuf,
    latest: Mutex<HashMap<String, TransitionRecord>>,
}

impl JsonlTransitionLog {
    /// Open (or create) `transitions.jsonl` under `dir`.
    pub fn open(dir: &Path) -> Result<Self, EscalationError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("transitions.jsonl");
        Self::truncate_torn_tail(&path)?;

        let records = Self::read_records(&path)?;
        let mut latest = HashMap::new();
        for record in &records {
            track_latest(&mut latest, record);
        }
        info!(
            path = %path.display(),
            records = records.len(),
            agents = latest.len(),
            "transition log opened"
        );
        Ok(Self {
            path,
            latest: Mutex::new(latest),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cut a final line left without its newline by a crash mid-write, so
    /// the next append starts on a fresh line.
    fn truncate_torn_tail(path: &Path) -> Result<(), EscalationError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if bytes.last().map_or(true, |b| *b == b'\n') {
            return Ok(());
        }
        let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - keep,
            "truncating torn transition record"
        );
        OpenOptions::new().write(true).open(path)?.set_len(keep as u64)?;
        Ok(())
    }

    fn read_records(path: &Path) -> Result<Vec<TransitionRecord>, EscalationError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<TransitionRecord>(trimmed) {
                Ok(r) => records.push(r),
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping unreadable transition record"),
            }
        }
        Ok(records)
    }
}

impl TransitionLog for JsonlTransitionLog {
    fn append(&self, record: TransitionRecord) -> Result<(), EscalationError> {
        let mut latest = lock(&self.latest);
        let line = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        track_latest(&mut latest, &record);
        Ok(())
    }

    fn history(
        &self,
        agent_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransitionRecord>, EscalationError> {
        // serialized with append
        let _latest = lock(&self.latest);
        let records = Self::read_records(&self.path)?;
        Ok(select(&records, agent_id, since))
    }

    fn latest(&self, agent_id: &str) -> Result<Option<TransitionRecord>, EscalationError> {
        Ok(lock(&self.latest).get(agent_id).cloned())
    }
}
