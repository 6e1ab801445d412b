use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use fittrack_rs::aggregator::{ActivityAggregator, Collaborators};
use fittrack_rs::auth::StaticSession;
use fittrack_rs::backend;
use fittrack_rs::config::{BackendKind, TrackerConfig};
use fittrack_rs::live_status::LiveStatus;
use fittrack_rs::notify::LogNotifier;
use fittrack_rs::permissions::{PermissionGate, StaticPermissions};
use fittrack_rs::persistence::{MemorySnapshotStore, SnapshotRecord, SnapshotStore};
use fittrack_rs::preferences::JsonFilePreferences;
use fittrack_rs::supervisor::AutoTrackingSupervisor;
use fittrack_rs::types::ActivitySnapshot;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "fittrack")]
#[command(about = "Step and distance tracker over simulated or Termux sensors", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sensor backend (platform, simulated); overrides the config file
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Output directory for preferences, the snapshot journal and status files
    #[arg(long, default_value = "fittrack_sessions")]
    output_dir: PathBuf,

    /// User the session is recorded for
    #[arg(long, default_value = "local-user")]
    user: String,

    /// Do not enable auto-tracking; only resume if previously enabled
    #[arg(long)]
    no_auto: bool,
}

#[derive(Serialize)]
struct SessionSummary {
    user_id: String,
    backend: BackendKind,
    started_at: chrono::DateTime<Utc>,
    ended_at: chrono::DateTime<Utc>,
    totals: ActivitySnapshot,
    display_distance_km: f64,
    flushes: u64,
    motion_samples: u64,
    location_fixes: u64,
    rows: Vec<SnapshotRecord>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    if let Some(kind) = args.backend {
        config.backend = kind;
    }
    if config.backend == BackendKind::Native {
        bail!("the native backend needs host glue pushing samples; use platform or simulated");
    }
    config.validate()?;

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    info!("fittrack starting");
    info!("  Duration: {} seconds (0=continuous)", args.duration);
    info!("  Backend: {:?}", config.backend);
    info!("  User: {}", args.user);
    info!("  Output Dir: {}", args.output_dir.display());

    let prefs = Arc::new(JsonFilePreferences::open(args.output_dir.join("preferences.json"))?);
    let store = Arc::new(
        MemorySnapshotStore::open_journal(&args.output_dir.join("snapshots.jsonl")).await?,
    );
    let notifier = Arc::new(LogNotifier);
    let built = backend::build(&config);
    let gate = Arc::new(PermissionGate::new(
        Arc::new(StaticPermissions::granting_all()),
        prefs.clone(),
        &config,
    ));
    let aggregator = Arc::new(ActivityAggregator::new(
        &config,
        Collaborators {
            session: Arc::new(StaticSession::signed_in(args.user.clone())),
            store: store.clone(),
            gate: gate.clone(),
            backend: built.backend.clone(),
            notifier: notifier.clone(),
        },
    ));
    let supervisor = Arc::new(AutoTrackingSupervisor::new(
        aggregator.clone(),
        gate,
        prefs,
        notifier,
        config.supervisor.clone(),
    ));

    let mut subscription = store.subscribe(&args.user).await?;
    let subscription_id = subscription.id;
    let row_logger = tokio::spawn(async move {
        while let Some(row) = subscription.updates.recv().await {
            info!(
                "[store] row from {}: {} steps, {:.2} km, fitscore {}",
                row.device_label,
                row.snapshot.steps,
                row.snapshot.display_distance_km(),
                row.snapshot.fitscore
            );
        }
    });

    let started_at = Utc::now();
    if supervisor.auto_tracking_enabled() {
        let _resume = supervisor.spawn_resume();
    } else if !args.no_auto {
        if !supervisor.toggle(true).await {
            bail!("tracking could not start");
        }
    } else {
        warn!("auto-tracking is off and --no-auto was given; nothing to record");
    }

    let status_path = args.output_dir.join("live_status.json");
    let started = Instant::now();
    let deadline = (args.duration > 0).then(|| started + Duration::from_secs(args.duration));
    let mut status_tick = interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = status_tick.tick() => {
                write_status(&supervisor, started.elapsed().as_secs(), &status_path);
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    info!("Duration reached, stopping...");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping...");
                break;
            }
        }
    }

    let status = aggregator.status();
    supervisor.shutdown().await;
    write_status(
        &supervisor,
        started.elapsed().as_secs(),
        &args.output_dir.join("live_status_final.json"),
    );

    store.unsubscribe(subscription_id).await?;
    let _ = row_logger.await;

    let rows = store
        .query_historical_snapshots(&args.user, started_at)
        .await?;
    let totals = aggregator.snapshot();
    let summary = SessionSummary {
        user_id: args.user.clone(),
        backend: config.backend,
        started_at,
        ended_at: Utc::now(),
        totals,
        display_distance_km: totals.display_distance_km(),
        flushes: aggregator.flush_count(),
        motion_samples: status.motion_samples,
        location_fixes: status.location_fixes,
        rows,
    };
    let filename = args
        .output_dir
        .join(format!("session_{}.json", started_at.format("%Y%m%d_%H%M%S")));
    std::fs::write(&filename, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("writing {}", filename.display()))?;

    println!("\n=== Session Summary ===");
    println!("Steps:      {}", totals.steps);
    println!("Distance:   {:.2} km", totals.display_distance_km());
    println!("Calories:   {}", totals.calories);
    println!("Fitscore:   {}", totals.fitscore);
    println!("Flushes:    {}", summary.flushes);
    println!("Samples:    {} motion, {} fixes", status.motion_samples, status.location_fixes);
    println!("Saved to:   {}", filename.display());
    Ok(())
}

fn write_status(supervisor: &AutoTrackingSupervisor, uptime: u64, path: &Path) {
    let live = LiveStatus::capture(
        &supervisor.aggregator().status(),
        supervisor.state(),
        supervisor.auto_tracking_enabled(),
        uptime,
    );
    if let Err(e) = live.save(path) {
        warn!("failed to write {}: {}", path.display(), e);
    }
}
