//! End-to-end phases used by both the CLI and the HTTP control plane.
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use time::{format_description::well_known, OffsetDateTime};
use tracing::{info, warn};

use crate::batch::{run_batches, BatchGate, MeasureOptions, MeasureOutcome, MeasureSummary};
use crate::config::AppConfig;
use crate::error::ScanError;
use crate::geo::MaxMindGeo;
use crate::policy::CountryPolicy;
use crate::probe::PingProbe;
use crate::resolve::SystemResolver;
use crate::run::{RunContext, RunStatus};
use crate::scanner::{scan_targets, ScanDeps, ScanOptions};
use crate::speedtest::BandwidthMeter;
use crate::store::{load_store, merge, persist_store};
use crate::targets::{load_exclude_list, load_include_list, load_targets_from_path};
use crate::tunnel::{OpenVpnTunnel, Tunnel};
use crate::types::{ResultStore, ScanStats};

/// Collaborators backed by the OS resolver, the system `ping` and the GeoLite2 databases.
pub fn system_deps(cfg: &AppConfig) -> Result<ScanDeps> {
    for db in [&cfg.city_db, &cfg.country_db] {
        if !db.exists() {
            anyhow::bail!("GeoIP database not found: {}", db.display());
        }
    }
    Ok(ScanDeps {
        resolver: Arc::new(SystemResolver),
        prober: Arc::new(PingProbe::new()),
        geo: Arc::new(MaxMindGeo::open(&cfg.country_db, &cfg.city_db)),
    })
}

/// OpenVPN tunnel configured from `cfg`.
pub fn system_tunnel(cfg: &AppConfig) -> OpenVpnTunnel {
    OpenVpnTunnel::new(&cfg.vpn_username, &cfg.vpn_password)
        .interface(&cfg.vpn_interface)
        .connect_timeout(Duration::from_secs(cfg.vpn_connect_timeout_secs))
}

#[derive(Debug, Clone)]
pub struct ScanPhaseReport {
    pub stats: ScanStats,
    pub cancelled: bool,
    pub store: ResultStore,
    pub persisted: bool,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Scan the configured targets, merge with the stored results and rewrite the store.
///
/// The run context ends `completed`, `cancelled` or `error`.
pub async fn run_scan_phase(
    cfg: &AppConfig,
    opts: &ScanOptions,
    deps: &ScanDeps,
    ctx: &RunContext,
) -> Result<ScanPhaseReport> {
    let res = scan_phase(cfg, opts, deps, ctx).await;
    match &res {
        Ok(r) if r.cancelled => ctx.finish(RunStatus::Cancelled, "Scan cancelled").await,
        Ok(r) => {
            ctx.finish(
                RunStatus::Completed,
                format!("Scan completed: {} / {} reachable", r.stats.ok, r.stats.total),
            )
            .await
        }
        Err(e) => ctx.finish(RunStatus::Error, format!("{e:#}")).await,
    }
    res
}

async fn scan_phase(
    cfg: &AppConfig,
    opts: &ScanOptions,
    deps: &ScanDeps,
    ctx: &RunContext,
) -> Result<ScanPhaseReport> {
    let names = load_targets_from_path(&cfg.targets_file)?;
    let exclude = load_exclude_list(&cfg.exclude_file)?;
    let include = load_include_list(cfg.include_file.as_deref())?;
    let policy = CountryPolicy::new(Some(exclude), include);

    // An unreadable store aborts before any probing.
    let previous = load_store(&cfg.results_file)
        .with_context(|| format!("cannot merge with {}", cfg.results_file.display()))?;

    let started = now_rfc3339();
    let results = scan_targets(&names, &policy, opts, deps, ctx).await?;
    info!(started = %started, finished = %now_rfc3339(), "scan window");

    let store = merge(&results.entries, previous.as_ref());
    let persisted = if store.is_empty() {
        warn!("failed to ping any targets from the list, result store left unchanged");
        false
    } else {
        persist_store(&cfg.results_file, &store)?;
        true
    };

    Ok(ScanPhaseReport {
        stats: results.stats,
        cancelled: results.cancelled,
        store,
        persisted,
    })
}

/// Run measurement batches against `store` (or the persisted store) and rewrite it.
///
/// The store is written even when the run was stopped or cancelled, so finished
/// candidates are kept.
pub async fn run_measure_phase(
    cfg: &AppConfig,
    opts: &MeasureOptions,
    store: Option<ResultStore>,
    tunnel: &mut dyn Tunnel,
    meter: &dyn BandwidthMeter,
    gate: &dyn BatchGate,
    ctx: &RunContext,
) -> Result<(MeasureSummary, ResultStore)> {
    let res = measure_phase(cfg, opts, store, tunnel, meter, gate, ctx).await;
    match &res {
        Ok((s, _)) => match s.outcome {
            MeasureOutcome::Cancelled => {
                ctx.finish(RunStatus::Cancelled, "Measurement cancelled").await
            }
            MeasureOutcome::Stopped => {
                ctx.finish(RunStatus::Completed, "Measurement stopped by user").await
            }
            MeasureOutcome::Completed => {
                ctx.finish(
                    RunStatus::Completed,
                    format!("Measured {} of {} endpoints", s.measured, s.candidates),
                )
                .await
            }
        },
        Err(e) => ctx.finish(RunStatus::Error, format!("{e:#}")).await,
    }
    res
}

async fn measure_phase(
    cfg: &AppConfig,
    opts: &MeasureOptions,
    store: Option<ResultStore>,
    tunnel: &mut dyn Tunnel,
    meter: &dyn BandwidthMeter,
    gate: &dyn BatchGate,
    ctx: &RunContext,
) -> Result<(MeasureSummary, ResultStore)> {
    let mut store = match store {
        Some(s) => s,
        None => load_store(&cfg.results_file)?.ok_or_else(|| {
            ScanError::StoreMissing(cfg.results_file.display().to_string())
        })?,
    };

    let summary = run_batches(&mut store, opts, tunnel, meter, gate, ctx)
        .await
        .with_context(|| format!("cannot read {}", opts.config_dir.display()))?;

    if summary.measured > 0 {
        persist_store(&cfg.results_file, &store)?;
    }
    Ok((summary, store))
}
