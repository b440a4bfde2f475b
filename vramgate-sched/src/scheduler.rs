use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;
use vramgate_journal::Journal;
use vramgate_types::{
    LeaseId, ResourceRequest, ResourceSchedulerSnapshot, VramBudgetPlan, HARD_VRAM_LIMIT_MB,
};

use crate::config::SchedulerConfig;
use crate::error::SchedError;
use crate::lease::{Command, ResourceLease};
use crate::state::SchedulerState;

/// Anything that hands out VRAM leases.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    async fn acquire(&self, request: ResourceRequest) -> Result<ResourceLease, SchedError>;
    async fn snapshot(&self) -> Result<ResourceSchedulerSnapshot, SchedError>;
}

/// Handle to a scheduler task.
///
/// Cheap to clone. All state lives in one spawned task; `acquire` and
/// `release` only send it messages, so an admission pass is never observed
/// half done.
#[derive(Clone)]
pub struct ResourceScheduler {
    tx: mpsc::UnboundedSender<Command>,
    config: Arc<SchedulerConfig>,
}

impl ResourceScheduler {
    /// In-memory scheduler without a journal. Must be called inside a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::spawn(config, None)
    }

    pub fn with_journal(config: SchedulerConfig, journal: Journal) -> Self {
        Self::spawn(config, Some(Arc::new(journal)))
    }

    fn spawn(config: SchedulerConfig, journal: Option<Arc<Journal>>) -> Self {
        let config = config.normalized();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = SchedulerState::new(config.clone(), journal, tx.downgrade());
        tokio::spawn(run(state, rx));
        Self {
            tx,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue `request` and wait until it is granted or its timeout passes.
    ///
    /// Requests above the hard ceiling are rejected before queueing.
    pub async fn acquire(&self, request: ResourceRequest) -> Result<ResourceLease, SchedError> {
        let requested_mb = request.declared_vram_mb();
        if requested_mb > HARD_VRAM_LIMIT_MB {
            return Err(SchedError::HardVramLimitExceeded {
                requested_mb,
                limit_mb: HARD_VRAM_LIMIT_MB,
            });
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Acquire { request, reply })
            .map_err(|_| SchedError::SchedulerClosed)?;
        rx.await.map_err(|_| SchedError::SchedulerClosed)?
    }

    /// Acquire, run `work`, release. The lease is returned on every exit path,
    /// including errors, panics and cancellation of the returned future.
    pub async fn with_lease<T, E, F, Fut>(&self, request: ResourceRequest, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SchedError>,
    {
        let lease = self.acquire(request).await?;
        let result = work().await;
        lease.release();
        result
    }

    /// Release by id. Unknown ids are ignored.
    pub fn release(&self, lease_id: &LeaseId) {
        let _ = self.tx.send(Command::Release {
            lease_id: lease_id.clone(),
        });
    }

    pub async fn snapshot(&self) -> Result<ResourceSchedulerSnapshot, SchedError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .map_err(|_| SchedError::SchedulerClosed)?;
        rx.await.map_err(|_| SchedError::SchedulerClosed)
    }

    /// Read-only budget plan against current state; used to pick an inference tier.
    pub async fn plan_vram_budget(
        &self,
        request: &ResourceRequest,
    ) -> Result<VramBudgetPlan, SchedError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Plan {
                request: request.clone(),
                reply,
            })
            .map_err(|_| SchedError::SchedulerClosed)?;
        rx.await.map_err(|_| SchedError::SchedulerClosed)
    }
}

#[async_trait]
impl LeaseProvider for ResourceScheduler {
    async fn acquire(&self, request: ResourceRequest) -> Result<ResourceLease, SchedError> {
        ResourceScheduler::acquire(self, request).await
    }

    async fn snapshot(&self) -> Result<ResourceSchedulerSnapshot, SchedError> {
        ResourceScheduler::snapshot(self).await
    }
}

async fn run(mut state: SchedulerState, mut rx: mpsc::UnboundedReceiver<Command>) {
    loop {
        let deadline = state.next_deadline();
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => handle(&mut state, cmd),
                None => break,
            },
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {}
        }
        state.drain_queue(Instant::now());
        state.flush();
    }
    debug!("scheduler task stopped");
}

fn handle(state: &mut SchedulerState, cmd: Command) {
    match cmd {
        Command::Acquire { request, reply } => state.enqueue(request, reply, Instant::now()),
        Command::Release { lease_id } => {
            state.release(&lease_id);
        }
        // Admit first so the answer does not count callers that already gave up.
        Command::Snapshot { reply } => {
            state.drain_queue(Instant::now());
            let _ = reply.send(state.snapshot());
        }
        Command::Plan { request, reply } => {
            state.drain_queue(Instant::now());
            let _ = reply.send(state.plan_vram_budget(&request));
        }
    }
}
