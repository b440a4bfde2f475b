//! Task runner: wires the scheduler and the preemption controller around a
//! unit of work.
//!
//! Every run follows the same protocol: preempt the low lane when the job is
//! critical or high, acquire a lease, register it for preemption, run the
//! work, then release and unregister on every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info};
use vramgate_preempt::{PreemptSignal, Registration, Terminators, VramMutex};
use vramgate_sched::{LeaseProvider, ResourceLease};
use vramgate_types::{LeaseId, ResourceRequest, TaskKind};

/// How long a job waits in the scheduler queue unless it says otherwise.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(15);

/// A unit of work as submitted to the runner.
#[derive(Clone, Debug)]
pub struct TaskJob {
    pub kind: TaskKind,
    /// Falls back to [`TaskKind::default_priority`].
    pub priority: Option<i32>,
    pub vram_mb: u64,
    pub model_id: Option<String>,
    pub model_vram_mb: Option<u64>,
    /// Falls back to [`DEFAULT_QUEUE_TIMEOUT`].
    pub timeout: Option<Duration>,
    pub training_job_id: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TaskJob {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            priority: None,
            vram_mb: 0,
            model_id: None,
            model_vram_mb: None,
            timeout: None,
            training_job_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn vram_mb(mut self, vram_mb: u64) -> Self {
        self.vram_mb = vram_mb;
        self
    }

    pub fn model(mut self, model_id: impl Into<String>, model_vram_mb: u64) -> Self {
        self.model_id = Some(model_id.into());
        self.model_vram_mb = Some(model_vram_mb);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn training_job(mut self, job_id: impl Into<String>) -> Self {
        self.training_job_id = Some(job_id.into());
        self
    }

    pub fn to_request(&self) -> ResourceRequest {
        let timeout = self.timeout.unwrap_or(DEFAULT_QUEUE_TIMEOUT);
        ResourceRequest {
            kind: self.kind,
            priority: self.priority.unwrap_or_else(|| self.kind.default_priority()),
            vram_mb: self.vram_mb,
            model_id: self.model_id.clone(),
            model_vram_mb: self.model_vram_mb,
            timeout_ms: Some(timeout.as_millis() as u64),
            metadata: self.metadata.clone(),
        }
    }
}

/// Handed to the work closure while its lease is held.
pub struct TaskContext {
    lease_id: LeaseId,
    kind: TaskKind,
    model_id: Option<String>,
    training_job_id: Option<String>,
    signal: watch::Receiver<PreemptSignal>,
    vram: Arc<VramMutex>,
}

impl TaskContext {
    pub fn lease_id(&self) -> &LeaseId {
        &self.lease_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    /// Callbacks the preemption controller uses to stop this task.
    pub fn attach_terminators(&self, terminators: Terminators) -> bool {
        self.vram.update_terminators(&self.lease_id, terminators)
    }

    pub fn preempt_signal(&self) -> PreemptSignal {
        *self.signal.borrow()
    }

    /// Resolves once a soft or hard stop has been requested.
    pub async fn preempted(&mut self) -> PreemptSignal {
        if let Ok(signal) = self.signal.wait_for(|s| *s != PreemptSignal::None).await {
            return *signal;
        }
        *self.signal.borrow()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.training_job_id
            .as_deref()
            .is_some_and(|job| self.vram.is_cancel_requested(job))
    }
}

/// Lease plus its preemption registration; gives both back when dropped.
struct HeldLease {
    lease: Option<ResourceLease>,
    vram: Arc<VramMutex>,
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let id = lease.id().clone();
            lease.release();
            self.vram.unregister(&id);
            debug!(lease = %id, "task finished");
        }
    }
}

pub struct TaskRunner {
    pub leases: Arc<dyn LeaseProvider>,
    pub vram: Arc<VramMutex>,
}

impl TaskRunner {
    pub fn new(leases: Arc<dyn LeaseProvider>, vram: Arc<VramMutex>) -> Self {
        Self { leases, vram }
    }

    /// Run `work` under a VRAM lease.
    ///
    /// The lease is released and the preemption registration dropped whether
    /// `work` succeeds, fails, panics or is cancelled.
    pub async fn run<T, F, Fut>(&self, job: TaskJob, work: F) -> anyhow::Result<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let lane = job.kind.lane();
        if lane.should_preempt_low_lane() {
            let report = self.vram.preempt_low_lane(lane).await;
            if !report.is_noop() {
                info!(
                    kind = %job.kind,
                    soft = report.soft_signaled.len(),
                    hard = report.hard_signaled.len(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "low lane preempted"
                );
            }
        }

        let lease = self
            .leases
            .acquire(job.to_request())
            .await
            .with_context(|| format!("acquire VRAM lease for {}", job.kind))?;

        let signal = self.vram.register(Registration {
            lease_id: lease.id().clone(),
            kind: job.kind,
            training_job_id: job.training_job_id.clone(),
        });
        let ctx = TaskContext {
            lease_id: lease.id().clone(),
            kind: job.kind,
            model_id: lease.model_id().map(str::to_string),
            training_job_id: job.training_job_id,
            signal,
            vram: self.vram.clone(),
        };
        let held = HeldLease {
            lease: Some(lease),
            vram: self.vram.clone(),
        };

        let result = work(ctx).await;
        drop(held);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use tokio::time::Instant;
    use vramgate_preempt::PreemptOptions;
    use vramgate_sched::{ResourceScheduler, SchedError, SchedulerConfig};

    fn runner(options: PreemptOptions) -> (TaskRunner, ResourceScheduler) {
        let config = SchedulerConfig {
            total_vram_mb: 8192,
            safety_margin_mb: 0,
            max_concurrent_tasks: 2,
            ..SchedulerConfig::default()
        };
        let sched = ResourceScheduler::new(config);
        let runner = TaskRunner::new(Arc::new(sched.clone()), Arc::new(VramMutex::new(options)));
        (runner, sched)
    }

    async fn wait_for_armed_training(vram: &VramMutex) {
        for _ in 0..1000 {
            if vram.low_lane_targets().iter().any(|t| t.has_terminators) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("training task never registered");
    }

    #[test]
    fn job_defaults_follow_kind() {
        let request = TaskJob::new(TaskKind::TrainingVoice).vram_mb(2000).to_request();
        assert_eq!(request.priority, 10);
        assert_eq!(request.timeout_ms, Some(15_000));

        let request = TaskJob::new(TaskKind::VoiceTts)
            .priority(7)
            .timeout(Duration::from_millis(250))
            .model("kokoro", 600)
            .to_request();
        assert_eq!(request.priority, 7);
        assert_eq!(request.timeout_ms, Some(250));
        assert_eq!(request.model(), Some("kokoro"));

        assert_eq!(TaskJob::new(TaskKind::ShellExec).to_request().priority, 50);
    }

    #[tokio::test]
    async fn critical_job_preempts_training_quickly() {
        let (runner, sched) = runner(PreemptOptions::default());
        let runner = Arc::new(runner);

        let training = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run(
                        TaskJob::new(TaskKind::TrainingImage)
                            .vram_mb(6000)
                            .training_job("lora-1"),
                        |ctx| async move {
                            let stop = Arc::new(Notify::new());
                            let notify = stop.clone();
                            ctx.attach_terminators(Terminators {
                                terminate_soft: Some(Arc::new(move || {
                                    notify.notify_one();
                                    Ok(())
                                })),
                                terminate_hard: None,
                            });
                            stop.notified().await;
                            assert!(ctx.is_cancel_requested());
                            Ok("stopped")
                        },
                    )
                    .await
            })
        };
        wait_for_armed_training(&runner.vram).await;

        let started = Instant::now();
        let granted_after = runner
            .run(
                TaskJob::new(TaskKind::VisionAnalyze).vram_mb(4000),
                |_ctx| async move { Ok(started.elapsed()) },
            )
            .await
            .unwrap();
        assert!(
            granted_after < Duration::from_millis(150),
            "critical job waited {granted_after:?}"
        );
        assert_eq!(training.await.unwrap().unwrap(), "stopped");
        assert!(runner.vram.low_lane_targets().is_empty());
        assert_eq!(sched.snapshot().await.unwrap().active_tasks, 0);
    }

    #[tokio::test]
    async fn unresponsive_training_gets_hard_signal() {
        let (runner, _sched) = runner(PreemptOptions {
            grace: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        });
        let runner = Arc::new(runner);
        let hard_called = Arc::new(AtomicBool::new(false));

        let training = {
            let runner = runner.clone();
            let hard_called = hard_called.clone();
            tokio::spawn(async move {
                runner
                    .run(TaskJob::new(TaskKind::TrainingVoice).vram_mb(1000), |mut ctx| async move {
                        ctx.attach_terminators(Terminators {
                            terminate_soft: Some(Arc::new(|| Err(anyhow::anyhow!("soft stop not supported")))),
                            terminate_hard: Some(Arc::new(move || {
                                hard_called.store(true, Ordering::SeqCst);
                                Ok(())
                            })),
                        });
                        // Ignores soft, honours hard.
                        while ctx.preempted().await != PreemptSignal::Hard {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Ok(())
                    })
                    .await
            })
        };
        wait_for_armed_training(&runner.vram).await;

        runner
            .run(TaskJob::new(TaskKind::ImageGenerate).vram_mb(500), |_ctx| async {
                Ok(())
            })
            .await
            .unwrap();
        training.await.unwrap().unwrap();
        assert!(hard_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_work_still_releases() {
        let (runner, sched) = runner(PreemptOptions::default());
        let err = runner
            .run(TaskJob::new(TaskKind::TrainingImage).vram_mb(3000), |ctx| async move {
                assert_eq!(ctx.preempt_signal(), PreemptSignal::None);
                Err::<(), _>(anyhow::anyhow!("trainer crashed"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "trainer crashed");
        let snap = sched.snapshot().await.unwrap();
        assert_eq!(snap.active_tasks, 0);
        assert_eq!(snap.used_vram_mb, 0);
        assert!(runner.vram.low_lane_targets().is_empty());
    }

    #[tokio::test]
    async fn oversized_job_surfaces_scheduler_error() {
        let (runner, _sched) = runner(PreemptOptions::default());
        let err = runner
            .run(TaskJob::new(TaskKind::ImageGenerate).vram_mb(9000), |_ctx| async {
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchedError>(),
            Some(SchedError::HardVramLimitExceeded { .. })
        ));
    }
}
