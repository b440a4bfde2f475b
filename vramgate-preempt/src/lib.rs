//! Cross-lane preemption.
//!
//! The task runner registers each active lease here. When a critical or high
//! lane request shows up, every low-lane lease is asked to stop (soft), given a
//! bounded grace window to release on its own, then killed (hard). All of this
//! is best effort: admission correctness comes from VRAM accounting alone.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vramgate_types::{LeaseId, TaskKind, TrafficLane};

/// Callback that asks a running task to stop.
pub type Terminator = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// What a registered lease has been told so far.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PreemptSignal {
    #[default]
    None,
    Soft,
    Hard,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlState {
    Active,
    TerminatorAttached,
    SoftSignaled,
    HardSignaled,
}

#[derive(Clone, Default)]
pub struct Terminators {
    pub terminate_soft: Option<Terminator>,
    pub terminate_hard: Option<Terminator>,
}

impl Terminators {
    pub fn new(soft: Terminator, hard: Terminator) -> Self {
        Self {
            terminate_soft: Some(soft),
            terminate_hard: Some(hard),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Registration {
    pub lease_id: LeaseId,
    pub kind: TaskKind,
    pub training_job_id: Option<String>,
}

/// Read-only view of a registered control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlInfo {
    pub lease_id: LeaseId,
    pub kind: TaskKind,
    pub lane: TrafficLane,
    pub training_job_id: Option<String>,
    pub state: ControlState,
    pub has_terminators: bool,
}

#[derive(Clone, Debug)]
pub struct PreemptOptions {
    /// Time low-lane leases get to release after the soft signal.
    pub grace: Duration,
    pub poll_interval: Duration,
}

impl Default for PreemptOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(1200),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreemptionReport {
    pub soft_signaled: Vec<LeaseId>,
    pub hard_signaled: Vec<LeaseId>,
    pub elapsed: Duration,
}

impl PreemptionReport {
    pub fn is_noop(&self) -> bool {
        self.soft_signaled.is_empty()
    }

    /// Every targeted lease released inside the grace window.
    pub fn completed_softly(&self) -> bool {
        self.hard_signaled.is_empty()
    }
}

struct Control {
    kind: TaskKind,
    lane: TrafficLane,
    training_job_id: Option<String>,
    terminators: Terminators,
    state: ControlState,
    signal: watch::Sender<PreemptSignal>,
}

impl Control {
    fn info(&self, lease_id: &LeaseId) -> ControlInfo {
        ControlInfo {
            lease_id: lease_id.clone(),
            kind: self.kind,
            lane: self.lane,
            training_job_id: self.training_job_id.clone(),
            state: self.state,
            has_terminators: self.terminators.terminate_soft.is_some()
                || self.terminators.terminate_hard.is_some(),
        }
    }
}

#[derive(Default)]
struct Inner {
    active: HashMap<LeaseId, Control>,
    cancel_requested: HashSet<String>,
}

#[derive(Default)]
pub struct VramMutex {
    inner: Mutex<Inner>,
    options: PreemptOptions,
}

impl VramMutex {
    pub fn new(options: PreemptOptions) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            options,
        }
    }

    pub fn options(&self) -> &PreemptOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked; keep serving.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track an active lease. The returned receiver observes soft/hard requests.
    pub fn register(&self, registration: Registration) -> watch::Receiver<PreemptSignal> {
        let (tx, rx) = watch::channel(PreemptSignal::None);
        let lane = registration.kind.lane();
        debug!(lease = %registration.lease_id, kind = %registration.kind, ?lane, "vram control registered");
        self.lock().active.insert(
            registration.lease_id,
            Control {
                kind: registration.kind,
                lane,
                training_job_id: registration.training_job_id,
                terminators: Terminators::default(),
                state: ControlState::Active,
                signal: tx,
            },
        );
        rx
    }

    /// Attach or replace terminators. Fields left `None` keep their previous value.
    pub fn update_terminators(&self, lease_id: &LeaseId, terminators: Terminators) -> bool {
        let mut inner = self.lock();
        let Some(control) = inner.active.get_mut(lease_id) else {
            return false;
        };
        if let Some(soft) = terminators.terminate_soft {
            control.terminators.terminate_soft = Some(soft);
        }
        if let Some(hard) = terminators.terminate_hard {
            control.terminators.terminate_hard = Some(hard);
        }
        if control.state == ControlState::Active {
            control.state = ControlState::TerminatorAttached;
        }
        true
    }

    pub fn unregister(&self, lease_id: &LeaseId) -> bool {
        let mut inner = self.lock();
        let Some(control) = inner.active.remove(lease_id) else {
            return false;
        };
        if let Some(job) = &control.training_job_id {
            inner.cancel_requested.remove(job);
        }
        true
    }

    pub fn has_active(&self, lease_id: &LeaseId) -> bool {
        self.lock().active.contains_key(lease_id)
    }

    pub fn state(&self, lease_id: &LeaseId) -> Option<ControlState> {
        self.lock().active.get(lease_id).map(|c| c.state)
    }

    pub fn low_lane_targets(&self) -> Vec<ControlInfo> {
        let inner = self.lock();
        let mut targets: Vec<ControlInfo> = inner
            .active
            .iter()
            .filter(|(_, c)| c.lane == TrafficLane::Low)
            .map(|(id, c)| c.info(id))
            .collect();
        targets.sort_by(|a, b| a.lease_id.cmp(&b.lease_id));
        targets
    }

    /// Whether the training job behind a low-lane lease has been asked to stop.
    pub fn is_cancel_requested(&self, training_job_id: &str) -> bool {
        self.lock().cancel_requested.contains(training_job_id)
    }

    /// Run the soft → grace → hard protocol against every low-lane lease.
    ///
    /// Returns immediately when `incoming` does not outrank the low lane. Never
    /// fails: terminator errors and panics are logged and dropped.
    pub async fn preempt_low_lane(&self, incoming: TrafficLane) -> PreemptionReport {
        let started = Instant::now();
        let mut report = PreemptionReport::default();
        if !incoming.should_preempt_low_lane() {
            return report;
        }

        let soft_targets: Vec<(LeaseId, Option<Terminator>)> = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let mut targets = Vec::new();
            for (id, control) in inner.active.iter_mut() {
                if control.lane != TrafficLane::Low {
                    continue;
                }
                control.state = ControlState::SoftSignaled;
                control.signal.send_replace(PreemptSignal::Soft);
                if let Some(job) = &control.training_job_id {
                    inner.cancel_requested.insert(job.clone());
                }
                targets.push((id.clone(), control.terminators.terminate_soft.clone()));
            }
            targets
        };
        if soft_targets.is_empty() {
            return report;
        }

        info!(?incoming, targets = soft_targets.len(), "preempting low-lane leases");
        for (id, soft) in &soft_targets {
            if let Some(soft) = soft {
                invoke_terminator(id, "soft", soft);
            }
            report.soft_signaled.push(id.clone());
        }

        let deadline = started + self.options.grace;
        loop {
            let pending = soft_targets
                .iter()
                .filter(|(id, _)| self.has_active(id))
                .count();
            if pending == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.options.poll_interval.min(deadline - now)).await;
        }

        let hard_targets: Vec<(LeaseId, Option<Terminator>)> = {
            let mut inner = self.lock();
            soft_targets
                .iter()
                .filter_map(|(id, _)| {
                    let control = inner.active.get_mut(id)?;
                    control.state = ControlState::HardSignaled;
                    control.signal.send_replace(PreemptSignal::Hard);
                    Some((id.clone(), control.terminators.terminate_hard.clone()))
                })
                .collect()
        };
        for (id, hard) in &hard_targets {
            warn!(lease = %id, "low-lane lease outlived grace window; terminating hard");
            if let Some(hard) = hard {
                invoke_terminator(id, "hard", hard);
            }
            report.hard_signaled.push(id.clone());
        }

        report.elapsed = started.elapsed();
        info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            hard = report.hard_signaled.len(),
            "preemption finished"
        );
        report
    }
}

fn invoke_terminator(lease_id: &LeaseId, phase: &str, terminator: &Terminator) {
    match catch_unwind(AssertUnwindSafe(|| terminator())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(lease = %lease_id, phase, error = %err, "terminator failed"),
        Err(_) => warn!(lease = %lease_id, phase, "terminator panicked"),
    }
}
