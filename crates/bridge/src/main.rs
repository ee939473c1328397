mod bridge;
mod config;
mod db;
mod hub;
mod recorder;
mod retention;
mod state;
mod tanks;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use time::UtcOffset;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bridge::Bridge;
use db::Db;
use hub::Hub;
use recorder::Recorder;
use retention::RetentionPolicy;
use state::UnitMirror;
use web::AppState;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    if let Ok(url) = env::var("DB_URL") {
        cfg.database.url = url;
    }
    info!(config = %config_path, db = %cfg.database.url, "starting unitboard bridge");

    // ── Database ────────────────────────────────────────────────────
    let clock = UtcOffset::from_whole_seconds(
        i32::try_from(cfg.database.clock_offset_min * 60).context("database.clock_offset_min")?,
    )
    .context("database.clock_offset_min")?;
    let db = Db::connect(&cfg.database.url).await?.with_clock_offset(clock);
    db.migrate().await?;
    let summary = db.summary().await?;
    info!(
        packets = summary.packets,
        size_bytes = summary.size_bytes,
        "db ready"
    );

    // ── Shared state ────────────────────────────────────────────────
    let shared = UnitMirror::shared();
    shared
        .write()
        .await
        .record_system("bridge started".to_string());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue = usize::try_from(cfg.bridge.persist_queue).context("bridge.persist_queue")?;
    let (recorder, recorder_task) = Recorder::spawn(db.clone(), queue, shared.clone());
    let hub = Hub::new();
    let write_timeout =
        u64::try_from(cfg.bridge.write_timeout_ms).context("bridge.write_timeout_ms")?;
    let bridge = Bridge::new(
        hub,
        recorder,
        shared.clone(),
        config_path.clone(),
        Duration::from_millis(write_timeout),
    );

    // ── Retention ───────────────────────────────────────────────────
    let interval_secs =
        u64::try_from(cfg.database.eviction_interval_sec).context("database.eviction_interval_sec")?;
    let retention_task = tokio::spawn(retention::run(
        db.clone(),
        config_path.clone(),
        RetentionPolicy::from_config(&cfg.database),
        Duration::from_secs(interval_secs),
        shared.clone(),
        shutdown_rx.clone(),
    ));

    // ── Controller endpoints ────────────────────────────────────────
    let telemetry = TcpListener::bind(&cfg.bridge.telemetry_addr)
        .await
        .with_context(|| format!("failed to bind telemetry port {}", cfg.bridge.telemetry_addr))?;
    let commands = TcpListener::bind(&cfg.bridge.command_addr)
        .await
        .with_context(|| format!("failed to bind command port {}", cfg.bridge.command_addr))?;

    let telemetry_task = {
        let bridge = bridge.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { bridge.serve_telemetry(telemetry, shutdown).await })
    };
    let command_task = {
        let bridge = bridge.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { bridge.serve_commands(commands, shutdown).await })
    };

    // ── Web server ──────────────────────────────────────────────────
    let web_listener = TcpListener::bind(&cfg.bridge.web_addr)
        .await
        .with_context(|| format!("failed to bind web port {}", cfg.bridge.web_addr))?;
    let app = AppState {
        bridge: bridge.clone(),
        db,
        recipes_dir: PathBuf::from(&cfg.recipes.dir),
        firmware_dir: PathBuf::from(&cfg.firmware.dir),
    };

    let mut web_shutdown = shutdown_rx.clone();
    let mut web_task = tokio::spawn(web::serve(web_listener, app, async move {
        let _ = web_shutdown.changed().await;
    }));

    let mut web_done = false;
    tokio::select! {
        res = &mut web_task => {
            web_done = true;
            match res {
                Ok(Err(e)) => error!("{e:#}"),
                Err(e) => error!("web task ended abnormally: {e}"),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => info!("shutdown requested"),
    }

    // ── Teardown ────────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    if !web_done {
        match web_task.await {
            Ok(Err(e)) => error!("{e:#}"),
            Err(e) => warn!("web task ended abnormally: {e}"),
            Ok(Ok(())) => {}
        }
    }
    for (name, task) in [
        ("telemetry", telemetry_task),
        ("command", command_task),
        ("retention", retention_task),
    ] {
        if let Err(e) = task.await {
            warn!(task = name, "task ended abnormally: {e}");
        }
    }

    // The writer exits once every bridge handle is gone. Telemetry
    // connections still open hold one, so don't wait forever.
    drop(bridge);
    match tokio::time::timeout(Duration::from_secs(5), recorder_task).await {
        Ok(Err(e)) => warn!("persistence writer ended abnormally: {e}"),
        Err(_) => warn!("persistence writer still busy at exit"),
        Ok(Ok(())) => {}
    }

    info!("bridge stopped");
    Ok(())
}
