use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Absolute ceiling for a single request (task + model), regardless of node size.
pub const HARD_VRAM_LIMIT_MB: u64 = 8192;

/// Kind of work asking for the GPU.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "image.generate")]
    ImageGenerate,
    #[serde(rename = "vision.analyze")]
    VisionAnalyze,
    #[serde(rename = "voice.tts")]
    VoiceTts,
    #[serde(rename = "voice.asr")]
    VoiceAsr,
    #[serde(rename = "training.image")]
    TrainingImage,
    #[serde(rename = "training.voice")]
    TrainingVoice,
    #[serde(rename = "shell.exec")]
    ShellExec,
    #[serde(rename = "generic")]
    Generic,
}

impl TaskKind {
    pub const ALL: [TaskKind; 8] = [
        TaskKind::ImageGenerate,
        TaskKind::VisionAnalyze,
        TaskKind::VoiceTts,
        TaskKind::VoiceAsr,
        TaskKind::TrainingImage,
        TaskKind::TrainingVoice,
        TaskKind::ShellExec,
        TaskKind::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ImageGenerate => "image.generate",
            TaskKind::VisionAnalyze => "vision.analyze",
            TaskKind::VoiceTts => "voice.tts",
            TaskKind::VoiceAsr => "voice.asr",
            TaskKind::TrainingImage => "training.image",
            TaskKind::TrainingVoice => "training.voice",
            TaskKind::ShellExec => "shell.exec",
            TaskKind::Generic => "generic",
        }
    }

    pub fn is_training(&self) -> bool {
        matches!(self, TaskKind::TrainingImage | TaskKind::TrainingVoice)
    }

    /// Preemption lane for this kind.
    pub fn lane(&self) -> TrafficLane {
        match self {
            TaskKind::VisionAnalyze | TaskKind::ShellExec => TrafficLane::Critical,
            TaskKind::ImageGenerate | TaskKind::VoiceTts | TaskKind::VoiceAsr => TrafficLane::High,
            TaskKind::TrainingImage | TaskKind::TrainingVoice => TrafficLane::Low,
            TaskKind::Generic => TrafficLane::Normal,
        }
    }

    /// Queue priority used when the caller does not pick one.
    pub fn default_priority(&self) -> i32 {
        match self {
            TaskKind::TrainingImage | TaskKind::TrainingVoice => 10,
            TaskKind::VoiceTts | TaskKind::ImageGenerate | TaskKind::VisionAnalyze => 100,
            _ => 50,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown task kind: {0}")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}

/// Priority class used for preemption, distinct from the numeric queue priority.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficLane {
    Critical,
    High,
    Normal,
    Low,
}

impl TrafficLane {
    pub fn should_preempt_low_lane(&self) -> bool {
        matches!(self, TrafficLane::Critical | TrafficLane::High)
    }
}

/// Identifier of a queued or granted lease (`lease_<uuid>`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub String);

impl LeaseId {
    pub fn new() -> Self {
        Self(format!("lease_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit of demand handed to the scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: i32,
    /// Task-local VRAM, independent of any model weights.
    #[serde(default)]
    pub vram_mb: u64,
    #[serde(default)]
    pub model_id: Option<String>,
    /// VRAM the model occupies once resident. Falls back to `vram_mb` when absent.
    #[serde(default)]
    pub model_vram_mb: Option<u64>,
    /// How long the request may wait in the queue.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ResourceRequest {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            priority: 0,
            vram_mb: 0,
            model_id: None,
            model_vram_mb: None,
            timeout_ms: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_vram_mb(mut self, vram_mb: u64) -> Self {
        self.vram_mb = vram_mb;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>, model_vram_mb: u64) -> Self {
        self.model_id = Some(model_id.into());
        self.model_vram_mb = Some(model_vram_mb);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Model id, ignoring blank strings.
    pub fn model(&self) -> Option<&str> {
        self.model_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// VRAM of the named model, zero when no model is named.
    pub fn model_footprint_mb(&self) -> u64 {
        match self.model() {
            Some(_) => self.model_vram_mb.unwrap_or(self.vram_mb),
            None => 0,
        }
    }

    /// Declared task + model VRAM, the figure checked against the hard ceiling.
    pub fn declared_vram_mb(&self) -> u64 {
        self.vram_mb.saturating_add(self.model_footprint_mb())
    }

    /// Queue timeout, if any. Zero means "no timeout".
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(std::time::Duration::from_millis)
    }
}

/// Hydraulics tier of a resident model.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidencyTier {
    #[default]
    Hot,
    Warm,
}

/// Residency record as exposed in snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadedModelView {
    pub model_id: String,
    pub vram_mb: u64,
    pub pins: u32,
    pub last_used_at: DateTime<Utc>,
    /// Monotonic use counter; the LRU order key.
    pub last_used_seq: u64,
    pub hotset: bool,
    #[serde(default)]
    pub residency: ResidencyTier,
}

/// Metadata-only record of a recently evicted model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmPoolEntry {
    pub model_id: String,
    #[serde(default)]
    pub vram_mb: u64,
    /// Why the model left VRAM (`lru_evict`, `hotset_evict`, `hydraulics_offload`).
    #[serde(default)]
    pub reason: String,
    pub evicted_at: DateTime<Utc>,
}

/// Tier limits and current fill of the resident models.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HydraulicsView {
    pub hot_limit_mb: u64,
    pub warm_limit_mb: u64,
    pub hot_used_mb: u64,
    pub warm_used_mb: u64,
}

/// Point-in-time view of the scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchedulerSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_vram_mb: u64,
    pub safety_margin_mb: u64,
    pub used_vram_mb: u64,
    pub available_vram_mb: u64,
    pub active_tasks: usize,
    pub queue_depth: usize,
    /// Most recently used first.
    pub loaded_models: Vec<LoadedModelView>,
    pub hotset_model_ids: Vec<String>,
    /// Oldest eviction first.
    pub warm_pool: Vec<WarmPoolEntry>,
    #[serde(default)]
    pub hydraulics: HydraulicsView,
}

impl ResourceSchedulerSnapshot {
    pub fn loaded_model_vram_mb(&self) -> u64 {
        self.loaded_models.iter().map(|m| m.vram_mb).sum()
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.loaded_models.iter().any(|m| m.model_id == model_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramBudgetModelInput {
    pub model_id: String,
    pub vram_mb: u64,
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramBudgetTaskInput {
    pub task_id: String,
    pub task_vram_mb: u64,
    pub priority: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPlan {
    pub keep_loaded: Vec<String>,
    /// Eviction candidates, least recently used first.
    pub unload_first: Vec<String>,
}

/// Outcome of a budget calculation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramBudgetPlan {
    pub fit: bool,
    pub available_mb: u64,
    pub required_mb: u64,
    pub overflow_mb: u64,
    pub suggested_task_vram_mb: u64,
    pub can_use_reference_only: bool,
    pub model_plan: ModelPlan,
}

/// What to do with model weights when a task switches models.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSwapAction {
    Reuse,
    HotLoad,
    EvictThenLoad,
    DegradedReference,
}

impl ModelSwapAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSwapAction::Reuse => "reuse",
            ModelSwapAction::HotLoad => "hot_load",
            ModelSwapAction::EvictThenLoad => "evict_then_load",
            ModelSwapAction::DegradedReference => "degraded_reference",
        }
    }
}
