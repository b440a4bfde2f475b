//! VRAM budget arithmetic.
//!
//! Everything here is a pure function of its inputs. The scheduler uses it for
//! admission and swap decisions; callers use it to pick an inference tier before
//! committing to a request.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use vramgate_types::{
    ModelPlan, ModelSwapAction, ResourceSchedulerSnapshot, VramBudgetModelInput, VramBudgetPlan,
    VramBudgetTaskInput,
};

/// Lowest task allotment ever suggested when the request does not fit.
pub const MIN_SUGGESTED_TASK_MB: u64 = 256;
/// Below this suggestion only the reference tier is usable.
pub const REFERENCE_ONLY_BELOW_MB: u64 = 512;

pub fn calculate_vram_budget(
    snapshot: &ResourceSchedulerSnapshot,
    task: &VramBudgetTaskInput,
    models: &[VramBudgetModelInput],
) -> VramBudgetPlan {
    let available_mb = snapshot
        .total_vram_mb
        .saturating_sub(snapshot.safety_margin_mb)
        .saturating_sub(snapshot.used_vram_mb);

    let loaded: HashMap<&str, u64> = snapshot
        .loaded_models
        .iter()
        .map(|m| (m.model_id.as_str(), m.vram_mb))
        .collect();

    let mut keep_loaded: Vec<String> = Vec::new();
    let mut models_need_load_mb = 0u64;
    for model in models.iter().filter(|m| m.required) {
        let loaded_mb = loaded.get(model.model_id.as_str()).copied().unwrap_or(0);
        if loaded.contains_key(model.model_id.as_str()) && loaded_mb >= model.vram_mb {
            if !keep_loaded.contains(&model.model_id) {
                keep_loaded.push(model.model_id.clone());
            }
            continue;
        }
        models_need_load_mb = models_need_load_mb.saturating_add(model.vram_mb);
    }

    let required_mb = task.task_vram_mb.saturating_add(models_need_load_mb);
    let overflow_mb = required_mb.saturating_sub(available_mb);
    let fit = overflow_mb == 0;
    let suggested_task_vram_mb = if fit {
        task.task_vram_mb
    } else {
        task.task_vram_mb
            .saturating_sub(overflow_mb)
            .max(MIN_SUGGESTED_TASK_MB)
    };

    let keep: HashSet<&str> = keep_loaded.iter().map(String::as_str).collect();
    let mut candidates: Vec<_> = snapshot
        .loaded_models
        .iter()
        .filter(|m| m.pins == 0 && !keep.contains(m.model_id.as_str()))
        .collect();
    candidates.sort_by_key(|m| (m.last_used_seq, m.last_used_at));
    let unload_first = candidates.into_iter().map(|m| m.model_id.clone()).collect();

    VramBudgetPlan {
        fit,
        available_mb,
        required_mb,
        overflow_mb,
        suggested_task_vram_mb,
        can_use_reference_only: suggested_task_vram_mb < REFERENCE_ONLY_BELOW_MB,
        model_plan: ModelPlan {
            keep_loaded,
            unload_first,
        },
    }
}

pub fn decide_model_swap_action(
    current_model_id: Option<&str>,
    target_model_id: Option<&str>,
    budget: &VramBudgetPlan,
) -> ModelSwapAction {
    let current = current_model_id.map(str::trim).unwrap_or("");
    let target = target_model_id.map(str::trim).unwrap_or("");
    if target.is_empty() {
        return ModelSwapAction::Reuse;
    }
    if !current.is_empty() && current == target {
        return ModelSwapAction::Reuse;
    }
    if budget.fit {
        return if current.is_empty() {
            ModelSwapAction::Reuse
        } else {
            ModelSwapAction::HotLoad
        };
    }
    if !budget.model_plan.unload_first.is_empty() {
        return ModelSwapAction::EvictThenLoad;
    }
    ModelSwapAction::DegradedReference
}

/// Inference quality tier, degrading from the full model down to reference-only.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceTier {
    Lora,
    Embedding,
    Reference,
}

/// Cheapest-first fallback: full tier when it fits, reference when even the
/// suggested allotment is tiny, embedding otherwise.
pub fn select_inference_tier(plan: &VramBudgetPlan) -> InferenceTier {
    if plan.fit {
        InferenceTier::Lora
    } else if plan.can_use_reference_only {
        InferenceTier::Reference
    } else {
        InferenceTier::Embedding
    }
}
