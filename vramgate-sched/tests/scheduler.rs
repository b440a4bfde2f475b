use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use vramgate_journal::{read_events, Journal};
use vramgate_sched::{ResourceScheduler, SchedError, SchedulerConfig};
use vramgate_types::{ResidencyTier, ResourceRequest, ResourceSchedulerSnapshot, TaskKind};

/// Hot tier spans the whole card, so tiering never offloads a model.
fn config(total: u64, margin: u64, max: usize) -> SchedulerConfig {
    SchedulerConfig {
        total_vram_mb: total,
        safety_margin_mb: margin,
        max_concurrent_tasks: max,
        hot_tier_mb: Some(total),
        ..SchedulerConfig::default()
    }
}

fn req(kind: TaskKind, priority: i32, vram: u64) -> ResourceRequest {
    ResourceRequest::new(kind).with_priority(priority).with_vram_mb(vram)
}

async fn wait_for_queue_depth(sched: &ResourceScheduler, depth: usize) {
    for _ in 0..1000 {
        if sched.snapshot().await.unwrap().queue_depth == depth {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("queue never reached depth {depth}");
}

fn assert_within_budget(snap: &ResourceSchedulerSnapshot) {
    assert!(
        snap.used_vram_mb + snap.loaded_model_vram_mb() <= snap.total_vram_mb - snap.safety_margin_mb,
        "budget exceeded: {snap:?}"
    );
}

#[tokio::test]
async fn higher_priority_is_granted_first() {
    let sched = ResourceScheduler::new(config(8192, 256, 1));
    let first = sched.acquire(req(TaskKind::Generic, 10, 128)).await.unwrap();

    let (order_tx, mut order_rx) = mpsc::unbounded_channel();
    for (label, priority) in [("low", 1), ("high", 100), ("high-later", 100)] {
        let task_sched = sched.clone();
        let order_tx = order_tx.clone();
        tokio::spawn(async move {
            let lease = task_sched.acquire(req(TaskKind::Generic, priority, 128)).await.unwrap();
            order_tx.send(label).unwrap();
            lease.release();
        });
        // Pin arrival order.
        wait_for_queue_depth(&sched, match label {
            "low" => 1,
            "high" => 2,
            _ => 3,
        })
        .await;
    }
    drop(order_tx);

    first.release();
    let mut order = Vec::new();
    while let Some(label) = order_rx.recv().await {
        order.push(label);
    }
    assert_eq!(order, vec!["high", "high-later", "low"]);
}

#[tokio::test(start_paused = true)]
async fn queued_request_times_out_at_deadline() {
    let sched = ResourceScheduler::new(config(8192, 0, 1));
    let _holder = sched.acquire(req(TaskKind::Generic, 1, 100)).await.unwrap();

    let started = Instant::now();
    let err = sched
        .acquire(req(TaskKind::Generic, 1, 100).with_timeout_ms(500))
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, SchedError::AcquireTimeout { .. }));
    assert!(err.is_retryable());
    assert!(waited >= Duration::from_millis(500), "fired early: {waited:?}");
    assert!(waited < Duration::from_millis(600), "fired late: {waited:?}");
    let snap = sched.snapshot().await.unwrap();
    assert_eq!(snap.queue_depth, 0);
    assert_eq!(snap.active_tasks, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_does_not_fire_once_granted() {
    let sched = ResourceScheduler::new(config(8192, 0, 1));
    let holder = sched.acquire(req(TaskKind::Generic, 1, 100)).await.unwrap();

    let waiter = {
        let sched = sched.clone();
        tokio::spawn(async move {
            sched
                .acquire(req(TaskKind::Generic, 1, 100).with_timeout_ms(1000))
                .await
        })
    };
    wait_for_queue_depth(&sched, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    holder.release();

    let lease = waiter.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(sched.snapshot().await.unwrap().active_tasks, 1);
    drop(lease);
}

#[tokio::test]
async fn hard_limit_rejected_before_queueing() {
    let sched = ResourceScheduler::new(config(8192, 0, 1));
    let err = sched
        .acquire(req(TaskKind::ImageGenerate, 100, 5000).with_model("flux", 4000))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SchedError::HardVramLimitExceeded {
            requested_mb: 9000,
            limit_mb: 8192
        }
    );
    assert!(!err.is_retryable());
    assert_eq!(sched.snapshot().await.unwrap().queue_depth, 0);
}

#[tokio::test]
async fn lru_model_is_evicted_first() {
    let sched = ResourceScheduler::new(config(3000, 0, 1));
    for model in ["a", "b", "c", "a"] {
        sched
            .with_lease(req(TaskKind::Generic, 1, 0).with_model(model, 1000), || async {
                Ok::<_, SchedError>(())
            })
            .await
            .unwrap();
    }
    sched
        .with_lease(req(TaskKind::Generic, 1, 0).with_model("d", 1000), || async {
            Ok::<_, SchedError>(())
        })
        .await
        .unwrap();

    let snap = sched.snapshot().await.unwrap();
    let mut resident: Vec<&str> = snap.loaded_models.iter().map(|m| m.model_id.as_str()).collect();
    resident.sort();
    assert_eq!(resident, vec!["a", "c", "d"]);
    assert_eq!(snap.warm_pool[0].model_id, "b");
}

#[tokio::test]
async fn sequential_models_keep_most_recent_resident() {
    let sched = ResourceScheduler::new(config(3000, 0, 1));
    for (kind, model) in [
        (TaskKind::ImageGenerate, "model-a"),
        (TaskKind::VoiceTts, "model-b"),
        (TaskKind::VisionAnalyze, "model-c"),
    ] {
        sched
            .with_lease(
                ResourceRequest::new(kind).with_vram_mb(200).with_model(model, 1200),
                || async { Ok::<_, SchedError>(()) },
            )
            .await
            .unwrap();
    }
    let snap = sched.snapshot().await.unwrap();
    assert!(snap.loaded_models.len() <= 2);
    assert!(snap.is_loaded("model-c"));
    assert_eq!(snap.used_vram_mb, 0);
    assert_within_budget(&snap);
}

#[tokio::test]
async fn hydraulics_offload_models_beyond_both_tiers() {
    let sched = ResourceScheduler::new(SchedulerConfig {
        hot_tier_mb: Some(1300),
        warm_tier_mb: Some(1300),
        ..config(4096, 0, 1)
    });
    for model in ["hydra-a", "hydra-b", "hydra-c"] {
        sched
            .with_lease(
                ResourceRequest::new(TaskKind::ImageGenerate)
                    .with_vram_mb(100)
                    .with_model(model, 1200),
                || async { Ok::<_, SchedError>(()) },
            )
            .await
            .unwrap();
    }

    let snap = sched.snapshot().await.unwrap();
    assert_eq!(snap.hydraulics.hot_limit_mb, 1300);
    assert_eq!(snap.hydraulics.warm_limit_mb, 1300);
    let tiers: Vec<(&str, ResidencyTier)> = snap
        .loaded_models
        .iter()
        .map(|m| (m.model_id.as_str(), m.residency))
        .collect();
    assert_eq!(
        tiers,
        vec![("hydra-c", ResidencyTier::Hot), ("hydra-b", ResidencyTier::Warm)]
    );
    assert_eq!(snap.hydraulics.hot_used_mb, 1200);
    assert_eq!(snap.hydraulics.warm_used_mb, 1200);

    let offloaded: Vec<_> = snap
        .warm_pool
        .iter()
        .filter(|e| e.reason == "hydraulics_offload")
        .collect();
    assert_eq!(offloaded.len(), 1);
    assert_eq!(offloaded[0].model_id, "hydra-a");
    assert_eq!(offloaded[0].vram_mb, 1200);
    assert_within_budget(&snap);
}

#[tokio::test(start_paused = true)]
async fn caller_that_gave_up_does_not_block_the_queue() {
    let sched = ResourceScheduler::new(config(1000, 0, 4));
    let _holder = sched.acquire(req(TaskKind::Generic, 1, 900)).await.unwrap();

    // Head of the queue, but its caller stops waiting.
    let gave_up = tokio::time::timeout(
        Duration::from_millis(20),
        sched.acquire(req(TaskKind::Generic, 100, 500)),
    )
    .await;
    assert!(gave_up.is_err());

    let live = tokio::time::timeout(
        Duration::from_secs(1),
        sched.acquire(req(TaskKind::Generic, 1, 50)),
    )
    .await
    .expect("granted past the abandoned head")
    .unwrap();
    let snap = sched.snapshot().await.unwrap();
    assert_eq!(snap.queue_depth, 0);
    assert_eq!(snap.active_tasks, 2);
    assert_eq!(snap.used_vram_mb, 950);
    drop(live);
}

#[tokio::test]
async fn with_lease_releases_on_error() {
    let sched = ResourceScheduler::new(config(8192, 0, 1));
    #[derive(Debug)]
    enum JobError {
        Sched(SchedError),
        Failed,
    }
    impl From<SchedError> for JobError {
        fn from(e: SchedError) -> Self {
            JobError::Sched(e)
        }
    }

    let result: Result<(), JobError> = sched
        .with_lease(req(TaskKind::VoiceAsr, 1, 300), || async { Err(JobError::Failed) })
        .await;
    assert!(matches!(result, Err(JobError::Failed)));
    let snap = sched.snapshot().await.unwrap();
    assert_eq!(snap.active_tasks, 0);
    assert_eq!(snap.used_vram_mb, 0);
    assert!(!matches!(result, Err(JobError::Sched(_))));
}

#[tokio::test]
async fn dropped_lease_is_released() {
    let sched = ResourceScheduler::new(config(8192, 0, 1));
    let lease = sched.acquire(req(TaskKind::Generic, 1, 700)).await.unwrap();
    assert_eq!(sched.snapshot().await.unwrap().used_vram_mb, 700);
    drop(lease);
    let snap = sched.snapshot().await.unwrap();
    assert_eq!(snap.used_vram_mb, 0);
    assert_eq!(snap.active_tasks, 0);
}

#[tokio::test]
async fn plan_reports_resident_model_as_kept() {
    let sched = ResourceScheduler::new(config(4000, 0, 2));
    let _lease = sched
        .acquire(req(TaskKind::ImageGenerate, 1, 500).with_model("sdxl", 2000))
        .await
        .unwrap();

    let plan = sched
        .plan_vram_budget(&req(TaskKind::ImageGenerate, 1, 500).with_model("sdxl", 2000))
        .await
        .unwrap();
    assert!(plan.fit);
    assert_eq!(plan.model_plan.keep_loaded, vec!["sdxl".to_string()]);
    assert_eq!(plan.available_mb, 3500);

    let plan = sched
        .plan_vram_budget(&req(TaskKind::ImageGenerate, 1, 500).with_model("flux", 4000))
        .await
        .unwrap();
    assert!(!plan.fit);
    assert_eq!(plan.overflow_mb, 1000);
    assert!(plan.model_plan.unload_first.is_empty());
}

#[tokio::test(start_paused = true)]
async fn budget_holds_under_churn() {
    // derived tier limits: 3300 hot, 1500 warm
    let sched = ResourceScheduler::new(SchedulerConfig {
        hot_tier_mb: None,
        ..config(6000, 500, 3)
    });
    let models = ["m0", "m1", "m2", "m3"];
    let mut handles = Vec::new();
    let mut seed: u64 = 0x2545_f491;
    for i in 0..40u64 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let vram = 100 + (seed >> 33) % 900;
        let model = models[((seed >> 20) % 4) as usize];
        let model_mb = 800 + (seed >> 40) % 1200;
        let priority = ((seed >> 12) % 5) as i32;
        let hold = Duration::from_millis(5 + (seed >> 50) % 40);
        let kind = if i % 7 == 0 {
            TaskKind::TrainingImage
        } else {
            TaskKind::ImageGenerate
        };
        let sched = sched.clone();
        handles.push(tokio::spawn(async move {
            let request = req(kind, priority, vram)
                .with_model(model, model_mb)
                .with_timeout_ms(30_000);
            let lease = sched.acquire(request).await?;
            let snap = sched.snapshot().await?;
            assert_within_budget(&snap);
            assert!(snap.active_tasks <= 3);
            tokio::time::sleep(hold).await;
            lease.release();
            Ok::<_, SchedError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let snap = sched.snapshot().await.unwrap();
    assert_eq!(snap.active_tasks, 0);
    assert_eq!(snap.used_vram_mb, 0);
    assert_within_budget(&snap);
}

#[tokio::test]
async fn journal_records_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(dir.path()).unwrap();
    let events_path = journal.events_path().to_path_buf();
    let sched = ResourceScheduler::with_journal(config(8192, 0, 1), journal);

    sched
        .with_lease(req(TaskKind::VoiceTts, 100, 200).with_model("kokoro", 600), || async {
            Ok::<_, SchedError>(())
        })
        .await
        .unwrap();
    // Snapshot round-trips through the task after the release, so the log is complete.
    sched.snapshot().await.unwrap();

    let names: Vec<&'static str> = read_events(&events_path)
        .unwrap()
        .iter()
        .map(|e| e.kind.name())
        .collect();
    assert_eq!(
        names,
        vec!["queued", "model_loaded", "model_swap", "granted", "released"]
    );
}
