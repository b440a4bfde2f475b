//! Observability side effects of the scheduler: an overwritten snapshot file
//! and an append-only JSONL event log. Nothing here is ever read back to
//! rebuild scheduler state.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vramgate_types::{
    LeaseId, ModelSwapAction, ResidencyTier, ResourceSchedulerSnapshot, TaskKind,
};

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Journal directory for a project: `<project>/.vramgate/scheduler`.
pub fn journal_dir(project_dir: impl AsRef<Path>) -> PathBuf {
    project_dir.as_ref().join(".vramgate").join("scheduler")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SchedulerEvent {
    pub fn now(kind: EventKind) -> Self {
        Self { at: Utc::now(), kind }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Queued {
        lease_id: LeaseId,
        kind: TaskKind,
        priority: i32,
        requested_vram_mb: u64,
        model_id: Option<String>,
    },
    Granted {
        lease_id: LeaseId,
        kind: TaskKind,
        requested_vram_mb: u64,
        model_id: Option<String>,
    },
    Released {
        lease_id: LeaseId,
        kind: TaskKind,
        released_vram_mb: u64,
        model_id: Option<String>,
    },
    Timeout {
        lease_id: LeaseId,
        kind: TaskKind,
    },
    ModelLoaded {
        model_id: String,
        vram_mb: u64,
    },
    ModelUnloaded {
        model_id: String,
        vram_mb: u64,
        reason: String,
    },
    ModelSwap {
        kind: TaskKind,
        action: ModelSwapAction,
        model_id: String,
        vram_mb: u64,
    },
    ModelRestoredFromWarmPool {
        model_id: String,
        vram_mb: u64,
        reason: String,
        evicted_at: DateTime<Utc>,
    },
    ModelResidency {
        model_id: String,
        residency: ResidencyTier,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Queued { .. } => "queued",
            EventKind::Granted { .. } => "granted",
            EventKind::Released { .. } => "released",
            EventKind::Timeout { .. } => "timeout",
            EventKind::ModelLoaded { .. } => "model_loaded",
            EventKind::ModelUnloaded { .. } => "model_unloaded",
            EventKind::ModelSwap { .. } => "model_swap",
            EventKind::ModelRestoredFromWarmPool { .. } => "model_restored_from_warm_pool",
            EventKind::ModelResidency { .. } => "model_residency",
        }
    }
}

pub struct Journal {
    snapshot_path: PathBuf,
    events_path: PathBuf,
    /// Event log, held open in append mode for the journal's lifetime.
    events: Mutex<File>,
}

impl Journal {
    /// Open (creating if needed) a journal rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| JournalError::Io(e.to_string()))?;
        let events_path = dir.join(EVENTS_FILE);
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .map_err(|e| JournalError::Io(e.to_string()))?;
        Ok(Self {
            snapshot_path: dir.join(SNAPSHOT_FILE),
            events_path,
            events: Mutex::new(events),
        })
    }

    pub fn for_project(project_dir: impl AsRef<Path>) -> Result<Self, JournalError> {
        Self::open(journal_dir(project_dir))
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn append(&self, event: &SchedulerEvent) -> Result<(), JournalError> {
        let mut line =
            serde_json::to_string(event).map_err(|e| JournalError::Parse(e.to_string()))?;
        line.push('\n');
        let mut file = self.events.lock().map_err(|_| JournalError::Io("lock".into()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| JournalError::Io(e.to_string()))?;
        Ok(())
    }

    /// Overwrite the snapshot file. Written to a sibling temp file first so readers
    /// never see a torn document.
    pub fn write_snapshot(&self, snapshot: &ResourceSchedulerSnapshot) -> Result<(), JournalError> {
        // Same lock as the event log: one writer at a time per journal.
        let _guard = self.events.lock().map_err(|_| JournalError::Io("lock".into()))?;
        let body =
            serde_json::to_vec_pretty(snapshot).map_err(|e| JournalError::Parse(e.to_string()))?;
        let tmp = self.snapshot_path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|e| JournalError::Io(e.to_string()))?;
        fs::rename(&tmp, &self.snapshot_path).map_err(|e| JournalError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Read every event in a log (diagnostics only).
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<SchedulerEvent>, JournalError> {
    let file = File::open(path.as_ref()).map_err(|e| JournalError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| JournalError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: SchedulerEvent =
            serde_json::from_str(&line).map_err(|e| JournalError::Parse(e.to_string()))?;
        events.push(event);
    }
    Ok(events)
}

pub fn read_snapshot(path: impl AsRef<Path>) -> Result<ResourceSchedulerSnapshot, JournalError> {
    let text = fs::read_to_string(path.as_ref()).map_err(|e| JournalError::Io(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| JournalError::Parse(e.to_string()))
}
