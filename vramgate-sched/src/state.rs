//! Admission engine. Owned by exactly one scheduler task; every method runs to
//! completion before the next command is looked at.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vramgate_budget::{calculate_vram_budget, decide_model_swap_action};
use vramgate_journal::{EventKind, Journal, SchedulerEvent};
use vramgate_types::{
    HydraulicsView, LeaseId, ModelSwapAction, ResourceRequest, ResourceSchedulerSnapshot,
    TaskKind, VramBudgetModelInput, VramBudgetPlan, VramBudgetTaskInput,
};

use crate::config::SchedulerConfig;
use crate::error::SchedError;
use crate::lease::{AcquireReply, Command, ResourceLease};
use crate::queue::{LeaseQueue, PendingRequest};
use crate::residency::{ModelResidency, HOTSET_EVICT, HYDRAULICS_OFFLOAD, LRU_EVICT};

pub(crate) struct ActiveLease {
    pub kind: TaskKind,
    pub request_vram_mb: u64,
    pub model_id: Option<String>,
}

pub(crate) struct SchedulerState {
    config: SchedulerConfig,
    queue: LeaseQueue,
    active: HashMap<LeaseId, ActiveLease>,
    residency: ModelResidency,
    hot_limit_mb: u64,
    warm_limit_mb: u64,
    current_model_by_kind: HashMap<TaskKind, String>,
    used_vram_mb: u64,
    next_seq: u64,
    journal: Option<Arc<Journal>>,
    releaser: mpsc::WeakUnboundedSender<Command>,
    dirty: bool,
}

impl SchedulerState {
    pub fn new(
        config: SchedulerConfig,
        journal: Option<Arc<Journal>>,
        releaser: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let residency =
            ModelResidency::new(config.hotset_model_ids.iter().cloned(), config.warm_pool_limit);
        let (hot_limit_mb, warm_limit_mb) = config.tier_limits_mb();
        let state = Self {
            config,
            queue: LeaseQueue::default(),
            active: HashMap::new(),
            residency,
            hot_limit_mb,
            warm_limit_mb,
            current_model_by_kind: HashMap::new(),
            used_vram_mb: 0,
            next_seq: 0,
            journal,
            releaser,
            dirty: false,
        };
        state.write_snapshot();
        state
    }

    pub fn enqueue(&mut self, request: ResourceRequest, reply: AcquireReply, now: Instant) {
        let id = LeaseId::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(lease = %id, kind = %request.kind, priority = request.priority, "queued");
        self.emit(EventKind::Queued {
            lease_id: id.clone(),
            kind: request.kind,
            priority: request.priority,
            requested_vram_mb: request.vram_mb,
            model_id: request.model().map(str::to_string),
        });
        let deadline = request.timeout().map(|t| now + t);
        self.queue.push(PendingRequest {
            id,
            request,
            seq,
            created_at: now,
            deadline,
            reply,
        });
        self.dirty = true;
    }

    /// Admission pass, run to a fixed point.
    pub fn drain_queue(&mut self, now: Instant) {
        loop {
            self.prune_queue(now);
            if self.active.len() >= self.config.max_concurrent_tasks {
                break;
            }
            let Some(head) = self.queue.peek() else {
                break;
            };
            let request = head.request.clone();
            if !self.can_grant(&request) {
                break;
            }
            let Some(pending) = self.queue.pop() else {
                break;
            };
            self.grant(pending);
        }
    }

    /// Fail requests past their deadline and forget those whose caller stopped
    /// waiting, so neither can hold the head of the queue.
    fn prune_queue(&mut self, now: Instant) {
        for pending in self.queue.take_expired(now) {
            let waited_ms = now.saturating_duration_since(pending.created_at).as_millis() as u64;
            debug!(lease = %pending.id, waited_ms, "acquire timed out");
            self.emit(EventKind::Timeout {
                lease_id: pending.id.clone(),
                kind: pending.request.kind,
            });
            let _ = pending.reply.send(Err(SchedError::AcquireTimeout { waited_ms }));
            self.dirty = true;
        }
        for pending in self.queue.take_abandoned() {
            debug!(lease = %pending.id, kind = %pending.request.kind, "caller gone; dropped from queue");
            self.dirty = true;
        }
    }

    /// Whether `request` may be granted right now.
    ///
    /// Impure: rebalances tiers and, when VRAM is short, evicts unpinned
    /// models to make room, even if the answer ends up being false.
    fn can_grant(&mut self, request: &ResourceRequest) -> bool {
        if self.active.len() >= self.config.max_concurrent_tasks {
            return false;
        }
        if self.violates_lane_isolation(request.kind) {
            return false;
        }
        if request.declared_vram_mb() == 0 {
            return true;
        }
        self.rebalance_tiers();
        let need = self.vram_needed(request);
        if need == 0 {
            return true;
        }
        self.evict_models_if_needed(need, request.model());
        self.available_vram_mb() >= need
    }

    fn violates_lane_isolation(&self, kind: TaskKind) -> bool {
        if !self.config.isolate_training_lane {
            return false;
        }
        let training = kind.is_training();
        self.active.values().any(|l| l.kind.is_training() != training)
    }

    /// Task VRAM plus the model footprint when the model is not yet resident.
    fn vram_needed(&self, request: &ResourceRequest) -> u64 {
        let model_mb = match request.model() {
            Some(id) if !self.residency.is_loaded(id) => request.model_footprint_mb(),
            _ => 0,
        };
        request.vram_mb.saturating_add(model_mb)
    }

    fn grant(&mut self, pending: PendingRequest) {
        let PendingRequest {
            id, request, reply, ..
        } = pending;
        let granted_at = Utc::now();
        let vram_mb = request.vram_mb;
        self.used_vram_mb = self.used_vram_mb.saturating_add(vram_mb);

        let model_id = request.model().map(str::to_string);
        if let Some(model) = &model_id {
            let footprint = request.model_footprint_mb();
            let action = self.select_model_swap_action(&request, model);
            if action == ModelSwapAction::EvictThenLoad {
                self.evict_models_if_needed(footprint, Some(model.as_str()));
            }
            self.ensure_model_loaded(model, footprint);
            self.residency.pin(model);
            // After the pin, so the model just loaded is never the one offloaded.
            self.rebalance_tiers();
            self.current_model_by_kind.insert(request.kind, model.clone());
            self.emit(EventKind::ModelSwap {
                kind: request.kind,
                action,
                model_id: model.clone(),
                vram_mb: footprint,
            });
        }

        self.active.insert(
            id.clone(),
            ActiveLease {
                kind: request.kind,
                request_vram_mb: vram_mb,
                model_id: model_id.clone(),
            },
        );
        debug!(lease = %id, kind = %request.kind, vram_mb, model = ?model_id, "granted");
        self.emit(EventKind::Granted {
            lease_id: id.clone(),
            kind: request.kind,
            requested_vram_mb: vram_mb,
            model_id: model_id.clone(),
        });
        self.dirty = true;

        let lease = ResourceLease::new(
            id.clone(),
            request.kind,
            granted_at,
            vram_mb,
            model_id,
            self.releaser.upgrade(),
        );
        if let Err(Ok(mut lease)) = reply.send(Ok(lease)) {
            // Caller gave up between queueing and the grant.
            lease.disarm();
            debug!(lease = %id, "caller went away before grant; releasing");
            self.release(&id);
        }
    }

    fn select_model_swap_action(&self, request: &ResourceRequest, model: &str) -> ModelSwapAction {
        let budget = self.plan_vram_budget(request);
        let current = self.current_model_by_kind.get(&request.kind).map(String::as_str);
        decide_model_swap_action(current, Some(model), &budget)
    }

    /// Returns false for an unknown id (double release is a no-op).
    pub fn release(&mut self, lease_id: &LeaseId) -> bool {
        let Some(lease) = self.active.remove(lease_id) else {
            debug!(lease = %lease_id, "release of unknown lease ignored");
            return false;
        };
        self.used_vram_mb = self.used_vram_mb.saturating_sub(lease.request_vram_mb);
        if let Some(model) = &lease.model_id {
            self.residency.unpin(model);
            self.residency.touch(model);
        }
        self.rebalance_tiers();
        debug!(lease = %lease_id, kind = %lease.kind, "released");
        self.emit(EventKind::Released {
            lease_id: lease_id.clone(),
            kind: lease.kind,
            released_vram_mb: lease.request_vram_mb,
            model_id: lease.model_id,
        });
        self.dirty = true;
        true
    }

    fn ensure_model_loaded(&mut self, model_id: &str, vram_mb: u64) {
        if vram_mb == 0 {
            return;
        }
        if self.residency.touch(model_id) {
            return;
        }
        if let Some(entry) = self.residency.take_from_warm_pool(model_id) {
            self.emit(EventKind::ModelRestoredFromWarmPool {
                model_id: model_id.to_string(),
                vram_mb,
                reason: entry.reason,
                evicted_at: entry.evicted_at,
            });
        }
        self.evict_models_if_needed(vram_mb, Some(model_id));
        self.residency.insert(model_id, vram_mb);
        info!(model = model_id, vram_mb, "model loaded");
        self.emit(EventKind::ModelLoaded {
            model_id: model_id.to_string(),
            vram_mb,
        });
    }

    /// Evict unpinned models, hotset last and LRU first, until `required_mb`
    /// is available or nothing evictable is left.
    fn evict_models_if_needed(&mut self, required_mb: u64, protect: Option<&str>) {
        if required_mb == 0 || self.available_vram_mb() >= required_mb {
            return;
        }
        for candidate in self.residency.eviction_candidates(protect) {
            let hotset = self.residency.is_hotset(&candidate);
            let reason = if hotset { HOTSET_EVICT } else { LRU_EVICT };
            let Some(model) = self.residency.evict(&candidate, reason) else {
                continue;
            };
            info!(model = %model.model_id, vram_mb = model.vram_mb, reason, "model unloaded");
            self.emit(EventKind::ModelUnloaded {
                model_id: model.model_id,
                vram_mb: model.vram_mb,
                reason: reason.to_string(),
            });
            self.dirty = true;
            if self.available_vram_mb() >= required_mb {
                break;
            }
        }
    }

    /// Re-tier resident models against the hot/warm limits and offload what
    /// fits in neither.
    fn rebalance_tiers(&mut self) {
        let outcome = self.residency.rebalance(self.hot_limit_mb, self.warm_limit_mb);
        for (model_id, residency) in outcome.retiered {
            debug!(model = %model_id, ?residency, "residency changed");
            self.emit(EventKind::ModelResidency {
                model_id,
                residency,
            });
            self.dirty = true;
        }
        for model in outcome.offloaded {
            info!(
                model = %model.model_id,
                vram_mb = model.vram_mb,
                reason = HYDRAULICS_OFFLOAD,
                "model unloaded"
            );
            self.emit(EventKind::ModelUnloaded {
                model_id: model.model_id,
                vram_mb: model.vram_mb,
                reason: HYDRAULICS_OFFLOAD.to_string(),
            });
            self.dirty = true;
        }
    }

    pub fn available_vram_mb(&self) -> u64 {
        self.config
            .budget_mb()
            .saturating_sub(self.used_vram_mb)
            .saturating_sub(self.residency.loaded_vram_mb())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }

    pub fn snapshot(&self) -> ResourceSchedulerSnapshot {
        ResourceSchedulerSnapshot {
            timestamp: Utc::now(),
            total_vram_mb: self.config.total_vram_mb,
            safety_margin_mb: self.config.safety_margin_mb,
            used_vram_mb: self.used_vram_mb,
            available_vram_mb: self.available_vram_mb(),
            active_tasks: self.active.len(),
            queue_depth: self.queue.len(),
            loaded_models: self.residency.views(),
            hotset_model_ids: self.config.hotset_model_ids.clone(),
            warm_pool: self.residency.warm_pool(),
            hydraulics: self.hydraulics(),
        }
    }

    fn hydraulics(&self) -> HydraulicsView {
        let (hot_used_mb, warm_used_mb) = self.residency.tier_usage_mb();
        HydraulicsView {
            hot_limit_mb: self.hot_limit_mb,
            warm_limit_mb: self.warm_limit_mb,
            hot_used_mb,
            warm_used_mb,
        }
    }

    pub fn plan_vram_budget(&self, request: &ResourceRequest) -> VramBudgetPlan {
        let task = VramBudgetTaskInput {
            task_id: request.kind.as_str().to_string(),
            task_vram_mb: request.vram_mb,
            priority: Some(request.priority),
        };
        let models: Vec<VramBudgetModelInput> = request
            .model()
            .map(|id| VramBudgetModelInput {
                model_id: id.to_string(),
                vram_mb: request.model_footprint_mb(),
                required: true,
            })
            .into_iter()
            .collect();
        calculate_vram_budget(&self.snapshot(), &task, &models)
    }

    /// Persist the snapshot if anything changed since the last flush.
    pub fn flush(&mut self) {
        if self.dirty {
            self.dirty = false;
            self.write_snapshot();
        }
    }

    fn write_snapshot(&self) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.write_snapshot(&self.snapshot()) {
                warn!(error = %err, "failed to write scheduler snapshot");
            }
        }
    }

    fn emit(&self, kind: EventKind) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(&SchedulerEvent::now(kind)) {
                warn!(error = %err, "failed to append scheduler event");
            }
        }
    }

    #[cfg(test)]
    pub fn active_kinds(&self) -> Vec<TaskKind> {
        self.active.values().map(|l| l.kind).collect()
    }
}
