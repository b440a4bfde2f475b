use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use vramgate_types::HARD_VRAM_LIMIT_MB;

use crate::error::ConfigError;

pub const ENV_CONFIG_PATH: &str = "VRAMGATE_CONFIG";
pub const ENV_TOTAL_VRAM_MB: &str = "VRAMGATE_TOTAL_VRAM_MB";
pub const ENV_SAFETY_MARGIN_MB: &str = "VRAMGATE_SAFETY_MARGIN_MB";
pub const ENV_MAX_CONCURRENT: &str = "VRAMGATE_MAX_CONCURRENT";
pub const ENV_WARM_POOL_LIMIT: &str = "VRAMGATE_WARM_POOL_LIMIT";
pub const ENV_ISOLATE_TRAINING: &str = "VRAMGATE_ISOLATE_TRAINING";
pub const ENV_HOTSET: &str = "VRAMGATE_HOTSET";
pub const ENV_HOT_TIER_MB: &str = "VRAMGATE_HOT_TIER_MB";
pub const ENV_WARM_TIER_MB: &str = "VRAMGATE_WARM_TIER_MB";

const MIN_HOT_TIER_MB: u64 = 512;
const MIN_WARM_TIER_MB: u64 = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Node VRAM; capped at the hard limit.
    pub total_vram_mb: u64,
    pub safety_margin_mb: u64,
    pub max_concurrent_tasks: usize,
    /// Number of evicted model ids remembered in the warm pool.
    pub warm_pool_limit: usize,
    /// Never run training next to non-training work.
    pub isolate_training_lane: bool,
    /// Models evicted only as a last resort.
    pub hotset_model_ids: Vec<String>,
    /// MB of resident models kept hot. Derived from the total when unset.
    pub hot_tier_mb: Option<u64>,
    /// MB of resident models kept warm beyond the hot tier. Derived when unset.
    pub warm_tier_mb: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            total_vram_mb: HARD_VRAM_LIMIT_MB,
            safety_margin_mb: 768,
            max_concurrent_tasks: 2,
            warm_pool_limit: 64,
            isolate_training_lane: true,
            hotset_model_ids: Vec::new(),
            hot_tier_mb: None,
            warm_tier_mb: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: SchedulerConfig =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg.normalized())
    }

    /// Defaults, then the YAML file named by `VRAMGATE_CONFIG` if any, then
    /// per-field environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) if !path.trim().is_empty() => Self::from_path(path.trim())?,
            _ => Self::default(),
        };
        Ok(base.apply_env(|key| std::env::var(key).ok()))
    }

    /// Apply overrides from `lookup`. Unparseable values keep the current setting.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        self.total_vram_mb = positive(lookup(ENV_TOTAL_VRAM_MB), self.total_vram_mb);
        self.safety_margin_mb = lookup(ENV_SAFETY_MARGIN_MB)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(self.safety_margin_mb);
        self.max_concurrent_tasks =
            positive(lookup(ENV_MAX_CONCURRENT), self.max_concurrent_tasks as u64) as usize;
        self.warm_pool_limit = lookup(ENV_WARM_POOL_LIMIT)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(self.warm_pool_limit);
        if let Some(flag) = lookup(ENV_ISOLATE_TRAINING).and_then(|v| parse_flag(&v)) {
            self.isolate_training_lane = flag;
        }
        if let Some(list) = lookup(ENV_HOTSET) {
            self.hotset_model_ids = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(mb) = lookup(ENV_HOT_TIER_MB).and_then(|v| positive_opt(&v)) {
            self.hot_tier_mb = Some(mb);
        }
        if let Some(mb) = lookup(ENV_WARM_TIER_MB).and_then(|v| positive_opt(&v)) {
            self.warm_tier_mb = Some(mb);
        }
        self.normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.total_vram_mb = self.total_vram_mb.min(HARD_VRAM_LIMIT_MB);
        self.max_concurrent_tasks = self.max_concurrent_tasks.max(1);
        self.hotset_model_ids.sort();
        self.hotset_model_ids.dedup();
        self
    }

    /// VRAM the scheduler may hand out: total minus safety margin.
    pub fn budget_mb(&self) -> u64 {
        self.total_vram_mb.saturating_sub(self.safety_margin_mb)
    }

    /// `(hot, warm)` tier limits in MB.
    ///
    /// Hot defaults to 55% of the total (at least 1 GB) and never drops below
    /// 512 MB. Warm gets a share of what is left: 25% of the total by default,
    /// at least 256 MB, or the whole remainder when that is smaller.
    pub fn tier_limits_mb(&self) -> (u64, u64) {
        let total = self.total_vram_mb;
        let hot = self
            .hot_tier_mb
            .unwrap_or_else(|| (total * 55 / 100).max(1024))
            .min(total)
            .max(MIN_HOT_TIER_MB);
        let capacity = total.saturating_sub(hot);
        let warm = if capacity <= MIN_WARM_TIER_MB {
            capacity
        } else {
            self.warm_tier_mb
                .unwrap_or_else(|| (total / 4).max(512))
                .min(capacity)
                .max(MIN_WARM_TIER_MB)
        };
        (hot, warm)
    }
}

fn positive(value: Option<String>, fallback: u64) -> u64 {
    match value.and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(v) if v > 0 => v,
        _ => fallback,
    }
}

fn positive_opt(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|v| *v > 0)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
