//! aquahub entry point: parses the `run` command, loads config, connects
//! SQLite, builds the hardware layer (real GPIO or the deterministic
//! stub), and drives the scheduler until SIGINT/SIGTERM.
//!
//! Safety behaviour on the way down: the scheduler gets a grace period to
//! finish in-flight work, then the output arbiter drives every managed
//! pin LOW (panic-off) before the process exits. A fatal fault exits
//! non-zero after the same panic-off attempt.
//!
//! The top level is a single-threaded cooperative runtime; only the
//! CS1237 samplers own OS threads, because their bit cells need
//! microsecond busy-waits no cooperative loop can guarantee.

mod api;
mod calibration;
mod config;
mod controller;
mod cs1237;
mod db;
mod error;
mod events;
mod hw;
mod mqtt;
mod outputs;
mod scheduler;
mod sensor;
mod store;
mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::db::Db;
use crate::hw::Hardware;
use crate::outputs::OutputArbiter;
use crate::scheduler::{Runtime, Scheduler};
use crate::store::MeasurementStore;

/// How often retention pruning runs.
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);

struct Cli {
    dry_run: bool,
}

fn parse_cli() -> anyhow::Result<Cli> {
    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        bail!("usage: aquahub run [--dry-run]");
    };
    if command != "run" {
        bail!("unknown command '{command}' (expected: run)");
    }
    let mut dry_run = false;
    for arg in args {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            other => bail!("unknown flag '{other}'"),
        }
    }
    Ok(Cli { dry_run })
}

fn build_hardware(dry_run: bool) -> anyhow::Result<Arc<dyn Hardware>> {
    if dry_run {
        info!("dry-run: using simulated stub hardware");
        return Ok(Arc::new(hw::stub::StubHardware::simulated()));
    }
    #[cfg(feature = "gpio")]
    {
        Ok(Arc::new(hw::rpi::RpiHardware::new().context("gpio init")?))
    }
    #[cfg(not(feature = "gpio"))]
    {
        warn!("built without the gpio feature: falling back to stub hardware");
        Ok(Arc::new(hw::stub::StubHardware::simulated()))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = parse_cli()?;

    // ── Config (env overrides file values) ──────────────────────────
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "aquahub.toml".to_string());
    let mut cfg = match std::fs::metadata(&config_path) {
        Ok(_) => config::load(&config_path)?,
        Err(_) => {
            warn!(path = %config_path, "config file missing, using defaults");
            config::parse("")?
        }
    };
    if let Ok(url) = std::env::var("DB_URL") {
        cfg.database.url = url;
    }
    if let Ok(bind) = std::env::var("WEB_BIND") {
        cfg.web.bind = bind;
    }

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.migrate().await?;
    let (seeded_sensors, seeded_controllers) = cfg.apply_seed(&db).await?;
    if seeded_sensors + seeded_controllers > 0 {
        info!(
            sensors = seeded_sensors,
            controllers = seeded_controllers,
            "seeded entities from config"
        );
    }

    // ── Measurement store ───────────────────────────────────────────
    let store = Arc::new(MeasurementStore::new(db.clone(), cfg.retention.policy()));
    let warmed = store.warm_cache().await?;
    info!(points = warmed, "measurement cache warmed");

    // ── Hardware + output arbiter ───────────────────────────────────
    let hw = build_hardware(cli.dry_run)?;
    let arbiter = Arc::new(OutputArbiter::new(Arc::clone(&hw), &cfg.pin_configs())?);
    let watchdog = outputs::spawn_watchdog(Arc::clone(&arbiter));

    let runtime = Arc::new(Runtime::new(
        db.clone(),
        Arc::clone(&store),
        Arc::clone(&arbiter),
        hw,
    ));
    info!(
        pins = cfg.outputs.len(),
        db = %cfg.database.url,
        "runtime ready"
    );

    // ── Shutdown signal plumbing ────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // ── HTTP API ────────────────────────────────────────────────────
    let bind: std::net::SocketAddr = cfg
        .web
        .bind
        .parse()
        .with_context(|| format!("invalid web bind address '{}'", cfg.web.bind))?;
    let web_runtime = Arc::clone(&runtime);
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(web_runtime, bind).await {
            warn!("web server stopped: {e}");
        }
    });

    // ── MQTT publisher ──────────────────────────────────────────────
    let mqtt_task = if cfg.mqtt.enabled {
        let mqtt_runtime = Arc::clone(&runtime);
        let settings = cfg.mqtt.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            mqtt::run(mqtt_runtime, settings, rx).await;
        }))
    } else {
        None
    };

    // ── Retention pruning ───────────────────────────────────────────
    let prune_store = Arc::clone(&store);
    let prune_task = tokio::spawn(async move {
        // Don't prune immediately on startup — wait a bit first.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            match prune_store.prune().await {
                Ok(n) if n > 0 => info!(deleted = n, "pruned old measurements"),
                Ok(_) => {}
                Err(e) => warn!("retention prune failed: {e}"),
            }
        }
    });

    // ── Scheduler + signal handling ─────────────────────────────────
    let mut scheduler = Scheduler::new(Arc::clone(&runtime));
    let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let exit_reason;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => { exit_reason = "SIGINT"; }
        _ = sigterm.recv() => { exit_reason = "SIGTERM"; }
    }

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down");
    let _ = shutdown_tx.send(true);

    let outcome = tokio::time::timeout(
        scheduler::SHUTDOWN_GRACE + Duration::from_secs(1),
        scheduler_task,
    )
    .await;

    watchdog.abort();
    prune_task.abort();
    web_task.abort();
    if let Some(task) = mqtt_task {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    match outcome {
        Ok(Ok(Ok(()))) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(Ok(Err(e))) => {
            // The scheduler already attempted panic-off on its fatal path.
            bail!("scheduler failed: {e}");
        }
        Ok(Err(join_err)) => {
            let _ = arbiter.panic_off();
            bail!("scheduler task aborted: {join_err}");
        }
        Err(_) => {
            let _ = arbiter.panic_off();
            bail!("scheduler did not stop within the grace period");
        }
    }
}
