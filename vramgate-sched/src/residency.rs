//! Model weight bookkeeping: what is resident, who pins it, how recently it was
//! used, which tier it sits in, and which evicted models are remembered in the
//! warm pool.
//!
//! Availability arithmetic lives in the scheduler state; this module only
//! answers "in what order may models go" and records the outcome.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use vramgate_types::{LoadedModelView, ResidencyTier, WarmPoolEntry};

pub(crate) const LRU_EVICT: &str = "lru_evict";
pub(crate) const HOTSET_EVICT: &str = "hotset_evict";
pub(crate) const HYDRAULICS_OFFLOAD: &str = "hydraulics_offload";

#[derive(Clone, Debug)]
pub(crate) struct LoadedModel {
    pub model_id: String,
    pub vram_mb: u64,
    pub pins: u32,
    pub last_used_at: DateTime<Utc>,
    pub last_used_seq: u64,
    pub tier: ResidencyTier,
}

/// Outcome of a tier rebalance.
#[derive(Debug, Default)]
pub(crate) struct Rebalance {
    /// Models whose tier changed, with the new tier.
    pub retiered: Vec<(String, ResidencyTier)>,
    /// Models that fit in neither tier and were evicted.
    pub offloaded: Vec<LoadedModel>,
}

pub(crate) struct ModelResidency {
    loaded: HashMap<String, LoadedModel>,
    warm_pool: VecDeque<WarmPoolEntry>,
    warm_pool_limit: usize,
    hotset: HashSet<String>,
    use_seq: u64,
}

impl ModelResidency {
    pub fn new(hotset: impl IntoIterator<Item = String>, warm_pool_limit: usize) -> Self {
        Self {
            loaded: HashMap::new(),
            warm_pool: VecDeque::new(),
            warm_pool_limit,
            hotset: hotset.into_iter().collect(),
            use_seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.use_seq += 1;
        self.use_seq
    }

    pub fn is_hotset(&self, model_id: &str) -> bool {
        self.hotset.contains(model_id)
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.loaded.contains_key(model_id)
    }

    pub fn loaded_vram_mb(&self) -> u64 {
        self.loaded.values().map(|m| m.vram_mb).sum()
    }

    /// Refresh the LRU position. Returns false when the model is not resident.
    pub fn touch(&mut self, model_id: &str) -> bool {
        let seq = self.next_seq();
        match self.loaded.get_mut(model_id) {
            Some(model) => {
                model.last_used_at = Utc::now();
                model.last_used_seq = seq;
                true
            }
            None => false,
        }
    }

    pub fn insert(&mut self, model_id: &str, vram_mb: u64) {
        let seq = self.next_seq();
        self.loaded.insert(
            model_id.to_string(),
            LoadedModel {
                model_id: model_id.to_string(),
                vram_mb,
                pins: 0,
                last_used_at: Utc::now(),
                last_used_seq: seq,
                tier: ResidencyTier::Hot,
            },
        );
    }

    pub fn pin(&mut self, model_id: &str) {
        let seq = self.next_seq();
        if let Some(model) = self.loaded.get_mut(model_id) {
            model.pins += 1;
            model.tier = ResidencyTier::Hot;
            model.last_used_at = Utc::now();
            model.last_used_seq = seq;
        }
    }

    pub fn unpin(&mut self, model_id: &str) {
        if let Some(model) = self.loaded.get_mut(model_id) {
            model.pins = model.pins.saturating_sub(1);
        }
    }

    /// Unpinned models in eviction order: non-hotset before hotset, then least
    /// recently used first. `protect` is never offered.
    pub fn eviction_candidates(&self, protect: Option<&str>) -> Vec<String> {
        let mut candidates: Vec<&LoadedModel> = self
            .loaded
            .values()
            .filter(|m| m.pins == 0 && Some(m.model_id.as_str()) != protect)
            .collect();
        candidates.sort_by_key(|m| (self.hotset.contains(&m.model_id), m.last_used_seq));
        candidates.into_iter().map(|m| m.model_id.clone()).collect()
    }

    /// Drop a resident, unpinned model. Non-hotset models are remembered in the
    /// warm pool. Returns the removed record.
    pub fn evict(&mut self, model_id: &str, reason: &str) -> Option<LoadedModel> {
        if self.loaded.get(model_id).is_some_and(|m| m.pins > 0) {
            return None;
        }
        let model = self.loaded.remove(model_id)?;
        if !self.hotset.contains(model_id) {
            self.remember(&model, reason);
        }
        Some(model)
    }

    fn remember(&mut self, model: &LoadedModel, reason: &str) {
        if self.warm_pool_limit == 0 {
            return;
        }
        self.warm_pool.retain(|e| e.model_id != model.model_id);
        self.warm_pool.push_back(WarmPoolEntry {
            model_id: model.model_id.clone(),
            vram_mb: model.vram_mb,
            reason: reason.to_string(),
            evicted_at: Utc::now(),
        });
        while self.warm_pool.len() > self.warm_pool_limit {
            self.warm_pool.pop_front();
        }
    }

    /// Walk resident models most recently used first and assign tiers. Pinned
    /// and hotset models are always hot. The rest fill the hot tier, then the
    /// warm tier; whatever fits in neither is evicted.
    pub fn rebalance(&mut self, hot_limit_mb: u64, warm_limit_mb: u64) -> Rebalance {
        let order: Vec<(String, u64, bool)> = {
            let mut models: Vec<&LoadedModel> = self.loaded.values().collect();
            models.sort_by(|a, b| b.last_used_seq.cmp(&a.last_used_seq));
            models
                .into_iter()
                .map(|m| {
                    let always_hot = m.pins > 0 || self.hotset.contains(&m.model_id);
                    (m.model_id.clone(), m.vram_mb, always_hot)
                })
                .collect()
        };

        let mut outcome = Rebalance::default();
        let mut overflow = Vec::new();
        let (mut hot_used, mut warm_used) = (0u64, 0u64);
        for (model_id, vram_mb, always_hot) in order {
            let tier = if always_hot || hot_used + vram_mb <= hot_limit_mb {
                hot_used += vram_mb;
                ResidencyTier::Hot
            } else if warm_used + vram_mb <= warm_limit_mb {
                warm_used += vram_mb;
                ResidencyTier::Warm
            } else {
                overflow.push(model_id);
                continue;
            };
            if let Some(model) = self.loaded.get_mut(&model_id) {
                if model.tier != tier {
                    model.tier = tier;
                    outcome.retiered.push((model_id, tier));
                }
            }
        }
        for model_id in overflow {
            if let Some(model) = self.evict(&model_id, HYDRAULICS_OFFLOAD) {
                outcome.offloaded.push(model);
            }
        }
        outcome
    }

    /// `(hot, warm)` MB currently resident.
    pub fn tier_usage_mb(&self) -> (u64, u64) {
        self.loaded
            .values()
            .fold((0, 0), |(hot, warm), m| match m.tier {
                ResidencyTier::Hot => (hot + m.vram_mb, warm),
                ResidencyTier::Warm => (hot, warm + m.vram_mb),
            })
    }

    pub fn take_from_warm_pool(&mut self, model_id: &str) -> Option<WarmPoolEntry> {
        let idx = self.warm_pool.iter().position(|e| e.model_id == model_id)?;
        self.warm_pool.remove(idx)
    }

    pub fn warm_pool(&self) -> Vec<WarmPoolEntry> {
        self.warm_pool.iter().cloned().collect()
    }

    /// Most recently used first.
    pub fn views(&self) -> Vec<LoadedModelView> {
        let mut models: Vec<&LoadedModel> = self.loaded.values().collect();
        models.sort_by(|a, b| b.last_used_seq.cmp(&a.last_used_seq));
        models
            .into_iter()
            .map(|m| LoadedModelView {
                model_id: m.model_id.clone(),
                vram_mb: m.vram_mb,
                pins: m.pins,
                last_used_at: m.last_used_at,
                last_used_seq: m.last_used_seq,
                hotset: self.hotset.contains(&m.model_id),
                residency: m.tier,
            })
            .collect()
    }
}
