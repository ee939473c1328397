//! Age- and size-based eviction of stored telemetry.
//!
//! Runs once at startup and then every `eviction_interval_sec`. Limits are
//! re-read from the config file at the start of every run.

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{self, DatabaseConfig};
use crate::db::{format_timestamp, Db};
use crate::state::SharedState;

/// Packets removed per size-eviction step.
const EVICTION_BATCH: i64 = 100;

/// Upper bound on size-eviction steps per run.
const MAX_ITERATIONS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: i64,
    pub max_bytes: i64,
    pub batch: i64,
    pub max_iterations: u32,
}

impl RetentionPolicy {
    pub fn from_config(db: &DatabaseConfig) -> Self {
        Self {
            retention_days: db.retention_days,
            max_bytes: db.max_size_mb.saturating_mul(1024 * 1024),
            batch: EVICTION_BATCH,
            max_iterations: MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub aged_out: u64,
    pub size_evicted: u64,
    pub iterations: u32,
    pub size_before: i64,
    pub size_after: i64,
    /// Packets left after the run.
    pub remaining: i64,
    /// The iteration bound was hit while still over the size cap.
    pub exhausted: bool,
}

/// Wall-clock instant `retention_days` before `now`, or `None` when that
/// falls outside the representable date range.
fn age_cutoff(now: OffsetDateTime, retention_days: i64) -> Option<PrimitiveDateTime> {
    let window = retention_days
        .checked_mul(86_400)
        .map(time::Duration::seconds)?;
    let at = now.checked_sub(window)?;
    Some(PrimitiveDateTime::new(at.date(), at.time()))
}

/// One eviction pass.
pub async fn evict_once(
    db: &Db,
    policy: &RetentionPolicy,
    now: OffsetDateTime,
) -> Result<EvictionReport> {
    let mut report = EvictionReport {
        size_before: db.size_bytes().await?,
        ..EvictionReport::default()
    };

    // ── Age ─────────────────────────────────────────────────────────
    match age_cutoff(now, policy.retention_days) {
        Some(cutoff) => {
            let cutoff = format_timestamp(cutoff)?;
            report.aged_out = db.delete_older_than(&cutoff).await?;
        }
        None => warn!(
            retention_days = policy.retention_days,
            "retention window reaches past the calendar, skipping age eviction"
        ),
    }

    let mut vacuumed = false;
    if report.aged_out > 0 {
        // Freed pages still count towards page_count until the file is rebuilt.
        db.vacuum().await?;
        vacuumed = true;
    }

    // ── Size ────────────────────────────────────────────────────────
    let mut size = db.size_bytes().await?;
    while size > policy.max_bytes && report.iterations < policy.max_iterations {
        let deleted = db.delete_oldest(policy.batch).await?;
        if deleted == 0 {
            break;
        }
        report.iterations += 1;
        report.size_evicted += deleted;

        db.vacuum().await?;
        vacuumed = true;
        size = db.size_bytes().await?;
    }
    report.exhausted = size > policy.max_bytes && report.iterations >= policy.max_iterations;

    if !vacuumed {
        db.vacuum().await?;
        size = db.size_bytes().await?;
    }
    report.size_after = size;
    report.remaining = db.packet_count().await?;

    Ok(report)
}

/// Periodic eviction task. Intended to be `tokio::spawn`-ed from main; stops
/// when `shutdown` changes or its sender is dropped.
pub async fn run(
    db: Db,
    config_path: String,
    startup_policy: RetentionPolicy,
    interval: Duration,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) {
    // The first tick completes immediately, giving the startup run.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_sec = interval.as_secs(),
        retention_days = startup_policy.retention_days,
        max_bytes = startup_policy.max_bytes,
        "retention started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let policy = match config::load(&config_path) {
            Ok(cfg) => RetentionPolicy::from_config(&cfg.database),
            Err(e) => {
                warn!("retention: config re-read failed, using startup limits: {e:#}");
                startup_policy.clone()
            }
        };

        match evict_once(&db, &policy, db.now()).await {
            Ok(report) => {
                if report.exhausted {
                    warn!(?report, "retention: still over size cap after max iterations");
                }
                info!(
                    aged_out = report.aged_out,
                    size_evicted = report.size_evicted,
                    iterations = report.iterations,
                    size_after = report.size_after,
                    remaining = report.remaining,
                    "retention run complete"
                );
            }
            Err(e) => {
                error!("retention run failed: {e:#}");
                state
                    .write()
                    .await
                    .record_error(format!("retention run failed: {e:#}"));
            }
        }
    }

    info!("retention stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
