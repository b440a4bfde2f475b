use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use vramgate_types::{LeaseId, ResourceRequest, ResourceSchedulerSnapshot, TaskKind, VramBudgetPlan};

use crate::error::SchedError;

pub(crate) type AcquireReply = oneshot::Sender<Result<ResourceLease, SchedError>>;

/// Messages handled by the scheduler task.
pub(crate) enum Command {
    Acquire {
        request: ResourceRequest,
        reply: AcquireReply,
    },
    Release {
        lease_id: LeaseId,
    },
    Snapshot {
        reply: oneshot::Sender<ResourceSchedulerSnapshot>,
    },
    Plan {
        request: ResourceRequest,
        reply: oneshot::Sender<VramBudgetPlan>,
    },
}

/// A granted VRAM reservation.
///
/// Released exactly once: explicitly through [`ResourceLease::release`] or
/// implicitly on drop, so early returns, errors and cancelled tasks all give
/// the reservation back.
pub struct ResourceLease {
    id: LeaseId,
    kind: TaskKind,
    granted_at: DateTime<Utc>,
    vram_mb: u64,
    model_id: Option<String>,
    releaser: Option<mpsc::UnboundedSender<Command>>,
}

impl ResourceLease {
    pub(crate) fn new(
        id: LeaseId,
        kind: TaskKind,
        granted_at: DateTime<Utc>,
        vram_mb: u64,
        model_id: Option<String>,
        releaser: Option<mpsc::UnboundedSender<Command>>,
    ) -> Self {
        Self {
            id,
            kind,
            granted_at,
            vram_mb,
            model_id,
            releaser,
        }
    }

    pub fn id(&self) -> &LeaseId {
        &self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }

    pub fn vram_mb(&self) -> u64 {
        self.vram_mb
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    /// Give the reservation back. Never blocks.
    pub fn release(mut self) {
        self.send_release();
    }

    /// Forget the release channel; the scheduler frees the lease itself.
    pub(crate) fn disarm(&mut self) {
        self.releaser = None;
    }

    fn send_release(&mut self) {
        if let Some(tx) = self.releaser.take() {
            // A closed channel means the scheduler is gone and nothing is left to free.
            let _ = tx.send(Command::Release {
                lease_id: self.id.clone(),
            });
        }
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.send_release();
    }
}

impl fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLease")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("granted_at", &self.granted_at)
            .field("vram_mb", &self.vram_mb)
            .field("model_id", &self.model_id)
            .finish()
    }
}
