use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vramgate_budget::{calculate_vram_budget, decide_model_swap_action, select_inference_tier};
use vramgate_core::{TaskJob, TaskRunner};
use vramgate_journal::{journal_dir, read_snapshot, EVENTS_FILE, SNAPSHOT_FILE};
use vramgate_preempt::VramMutex;
use vramgate_sched::{ResourceScheduler, SchedulerConfig, SchedulerRegistry};
use vramgate_types::{
    HydraulicsView, ResourceRequest, ResourceSchedulerSnapshot, TaskKind, VramBudgetModelInput,
    VramBudgetTaskInput,
};

#[derive(Parser)]
#[command(name = "vramgate")]
struct Cli {
    /// Project directory holding `.vramgate/scheduler`.
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a short training + inference scenario against a journaled scheduler.
    Demo,
    /// Budget plan for a request against the last persisted snapshot.
    Plan {
        #[arg(long)]
        kind: TaskKind,
        #[arg(long, default_value_t = 0)]
        vram_mb: u64,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        model_vram_mb: Option<u64>,
        /// Model currently serving this kind, for the swap decision.
        #[arg(long)]
        current_model: Option<String>,
    },
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommand,
    },
    Events {
        #[command(subcommand)]
        action: EventsCommand,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    Show,
}

#[derive(Subcommand)]
enum EventsCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vramgate=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo => {
            let config = SchedulerConfig::from_env()?;
            demo(&cli.project, config).await?;
        }
        Command::Plan {
            kind,
            vram_mb,
            model,
            model_vram_mb,
            current_model,
        } => {
            let mut request = ResourceRequest::new(kind)
                .with_priority(kind.default_priority())
                .with_vram_mb(vram_mb);
            request.model_id = model;
            request.model_vram_mb = model_vram_mb;
            let snapshot = persisted_or_empty(&cli.project)?;
            plan(&snapshot, &request, current_model.as_deref())?;
        }
        Command::Snapshot { action } => match action {
            SnapshotCommand::Show => {
                let path = journal_dir(&cli.project).join(SNAPSHOT_FILE);
                let snapshot = read_snapshot(&path)?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        },
        Command::Events { action } => match action {
            EventsCommand::Tail { lines } => {
                let path = journal_dir(&cli.project).join(EVENTS_FILE);
                let content = std::fs::read_to_string(&path)?;
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(lines);
                for line in &all[start..] {
                    println!("{line}");
                }
            }
        },
    }

    Ok(())
}

/// The persisted snapshot, or the state of a fresh scheduler when none exists yet.
fn persisted_or_empty(project: &Path) -> anyhow::Result<ResourceSchedulerSnapshot> {
    let path = journal_dir(project).join(SNAPSHOT_FILE);
    if path.exists() {
        return Ok(read_snapshot(&path)?);
    }
    let config = SchedulerConfig::from_env()?;
    let (hot_limit_mb, warm_limit_mb) = config.tier_limits_mb();
    Ok(ResourceSchedulerSnapshot {
        timestamp: chrono::Utc::now(),
        total_vram_mb: config.total_vram_mb,
        safety_margin_mb: config.safety_margin_mb,
        used_vram_mb: 0,
        available_vram_mb: config.budget_mb(),
        active_tasks: 0,
        queue_depth: 0,
        loaded_models: Vec::new(),
        hotset_model_ids: config.hotset_model_ids.clone(),
        warm_pool: Vec::new(),
        hydraulics: HydraulicsView {
            hot_limit_mb,
            warm_limit_mb,
            ..HydraulicsView::default()
        },
    })
}

fn plan(
    snapshot: &ResourceSchedulerSnapshot,
    request: &ResourceRequest,
    current_model: Option<&str>,
) -> anyhow::Result<()> {
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
    let budget = calculate_vram_budget(snapshot, &task, &models);
    let action = decide_model_swap_action(current_model, request.model(), &budget);
    let tier = select_inference_tier(&budget);

    println!("{}", serde_json::to_string_pretty(&budget)?);
    println!("swap action: {}", action.as_str());
    println!("inference tier: {tier:?}");
    Ok(())
}

async fn demo(project: &Path, config: SchedulerConfig) -> anyhow::Result<()> {
    let registry = SchedulerRegistry::new(config);
    let scheduler = registry.get_or_create(project)?;
    let vram = Arc::new(VramMutex::default());
    let runner = Arc::new(TaskRunner::new(Arc::new(scheduler.clone()), vram.clone()));

    let training = {
        let runner = runner.clone();
        tokio::spawn(async move {
            runner
                .run(
                    TaskJob::new(TaskKind::TrainingImage)
                        .vram_mb(2500)
                        .model("sdxl-lora-trainer", 2000)
                        .training_job("demo-lora"),
                    |mut ctx| async move {
                        let signal = ctx.preempted().await;
                        println!("training {} stopped on {signal:?} signal", ctx.lease_id());
                        Ok(())
                    },
                )
                .await
        })
    };
    while vram.low_lane_targets().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    runner
        .run(
            TaskJob::new(TaskKind::VisionAnalyze)
                .vram_mb(600)
                .model("qwen-vl", 1800),
            |ctx| async move {
                println!("vision.analyze granted {}", ctx.lease_id());
                Ok(())
            },
        )
        .await?;
    training.await??;

    for model in ["model-a", "model-b", "model-c"] {
        runner
            .run(
                TaskJob::new(TaskKind::ImageGenerate)
                    .vram_mb(300)
                    .model(model, 1200),
                |ctx| async move {
                    println!("image.generate on {} granted {}", model, ctx.lease_id());
                    Ok(())
                },
            )
            .await?;
    }

    print_summary(&scheduler).await?;
    info!(journal = %journal_dir(project).display(), "demo finished");
    Ok(())
}

async fn print_summary(scheduler: &ResourceScheduler) -> anyhow::Result<()> {
    let snap = scheduler.snapshot().await?;
    println!(
        "vram: used {} MB, models {} MB, available {} MB of {} MB (margin {} MB)",
        snap.used_vram_mb,
        snap.loaded_model_vram_mb(),
        snap.available_vram_mb,
        snap.total_vram_mb,
        snap.safety_margin_mb
    );
    let tiers = &snap.hydraulics;
    println!(
        "tiers: hot {}/{} MB, warm {}/{} MB",
        tiers.hot_used_mb, tiers.hot_limit_mb, tiers.warm_used_mb, tiers.warm_limit_mb
    );
    for model in &snap.loaded_models {
        println!(
            "  loaded {} ({} MB, pins {}, hotset {}, {:?})",
            model.model_id, model.vram_mb, model.pins, model.hotset, model.residency
        );
    }
    for entry in &snap.warm_pool {
        println!(
            "  evicted {} ({} MB, {}, at {})",
            entry.model_id,
            entry.vram_mb,
            entry.reason,
            entry.evicted_at.to_rfc3339()
        );
    }
    Ok(())
}
