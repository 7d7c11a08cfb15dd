//! Sequential connect → measure → disconnect over tunnel configs, in batches.
//!
//! Exactly one tunnel is up at any time: bringing one up rewrites process-wide routing.
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::run::{Phase, RunContext};
use crate::speedtest::BandwidthMeter;
use crate::tunnel::Tunnel;
use crate::types::ResultStore;

const CONFIG_EXT: &str = "ovpn";

#[derive(Debug, Clone)]
pub struct MeasureOptions {
    /// Directory holding `<endpoint>[.udp|.tcp].ovpn` files.
    pub config_dir: PathBuf,
    pub batch_size: usize,
    /// Ask the gate before every batch after the first.
    pub interactive: bool,
    /// Restrict to these endpoint names.
    pub only: Option<HashSet<String>>,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("ovpn"),
            batch_size: 20,
            interactive: true,
            only: None,
        }
    }
}

/// Continue/stop decision point between batches.
#[async_trait]
pub trait BatchGate: Send + Sync {
    /// `completed` is the 1-based number of the batch just finished.
    async fn proceed(&self, completed: usize, remaining: usize) -> bool;
}

/// Gate that never pauses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoContinue;

#[async_trait]
impl BatchGate for AutoContinue {
    async fn proceed(&self, _completed: usize, _remaining: usize) -> bool {
        true
    }
}

/// Gate resolved from elsewhere in the process (e.g. an HTTP handler).
#[derive(Debug, Default)]
pub struct ChannelGate {
    pending: Mutex<Option<oneshot::Sender<bool>>>,
}

impl ChannelGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer a parked orchestrator. Returns false if nothing was waiting.
    pub async fn resolve(&self, proceed: bool) -> bool {
        match self.pending.lock().await.take() {
            Some(tx) => tx.send(proceed).is_ok(),
            None => false,
        }
    }

    /// True only while an orchestrator is parked on this gate. A sender whose receiver
    /// was dropped (the run was cancelled while paused) no longer counts and is cleared.
    pub async fn is_waiting(&self) -> bool {
        let mut pending = self.pending.lock().await;
        if pending.as_ref().is_some_and(|tx| tx.is_closed()) {
            *pending = None;
        }
        pending.is_some()
    }
}

#[async_trait]
impl BatchGate for ChannelGate {
    async fn proceed(&self, completed: usize, remaining: usize) -> bool {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().await = Some(tx);
        info!(completed, remaining, "waiting for decision on next batch");
        rx.await.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub latency_ms: f64,
    pub config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureOutcome {
    /// Every candidate was processed (or there were none).
    Completed,
    /// The gate declined to continue.
    Stopped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureSummary {
    pub candidates: usize,
    pub processed: usize,
    pub measured: usize,
    pub failed: usize,
    pub batches: usize,
    pub outcome: MeasureOutcome,
}

/// Endpoint name a config file belongs to: stem without `.ovpn` and a `.udp`/`.tcp` marker.
pub fn endpoint_for_config(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(CONFIG_EXT) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let name = stem
        .strip_suffix(".udp")
        .or_else(|| stem.strip_suffix(".tcp"))
        .unwrap_or(stem);
    (!name.is_empty()).then(|| name.to_string())
}

/// Map endpoint name -> config path. `None` if the directory does not exist.
///
/// When both `.udp` and `.tcp` variants exist the `.udp` one wins.
pub fn find_tunnel_configs(dir: &Path) -> std::io::Result<Option<HashMap<String, PathBuf>>> {
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut paths: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut out: HashMap<String, PathBuf> = HashMap::new();
    for path in paths {
        let Some(name) = endpoint_for_config(&path) else {
            continue;
        };
        let is_udp = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.ends_with(".udp"));
        if is_udp || !out.contains_key(&name) {
            out.insert(name, path);
        }
    }
    Ok(Some(out))
}

/// Endpoints with both a record and a config (and in `only`, if given), fastest first.
pub fn select_candidates(
    store: &ResultStore,
    configs: &HashMap<String, PathBuf>,
    only: Option<&HashSet<String>>,
) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = store
        .iter()
        .filter(|(name, _)| only.map_or(true, |o| o.contains(*name)))
        .filter_map(|(name, rec)| {
            configs.get(name).map(|config| Candidate {
                name: name.clone(),
                latency_ms: rec.latency_ms,
                config: config.clone(),
            })
        })
        .collect();
    out.sort_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));
    out
}

/// Measure bandwidth through each candidate's tunnel, one at a time, in batches.
///
/// Successful measurements are written into `store`; any failure leaves that endpoint's
/// bandwidth fields untouched. Disconnect runs after every candidate. Cancellation is
/// honoured before each candidate and while paused between batches.
pub async fn run_batches(
    store: &mut ResultStore,
    opts: &MeasureOptions,
    tunnel: &mut dyn Tunnel,
    meter: &dyn BandwidthMeter,
    gate: &dyn BatchGate,
    ctx: &RunContext,
) -> std::io::Result<MeasureSummary> {
    ctx.set_phase(Phase::Preparing).await;

    let configs = match find_tunnel_configs(&opts.config_dir)? {
        Some(c) => c,
        None => {
            warn!(dir = %opts.config_dir.display(), "VPN config directory not found, nothing to measure");
            HashMap::new()
        }
    };
    let candidates = select_candidates(store, &configs, opts.only.as_ref());

    let mut summary = MeasureSummary {
        candidates: candidates.len(),
        processed: 0,
        measured: 0,
        failed: 0,
        batches: 0,
        outcome: MeasureOutcome::Completed,
    };
    ctx.set_total(candidates.len() as u64).await;

    if candidates.is_empty() {
        ctx.note("No VPN config files found for any scanned endpoints").await;
        ctx.set_phase(Phase::Done).await;
        return Ok(summary);
    }

    let batch_size = opts.batch_size.max(1);
    let total = candidates.len();
    ctx.note(format!("Performing VPN speedtests on {total} endpoints")).await;

    'batches: for (batch_idx, batch) in candidates.chunks(batch_size).enumerate() {
        let first = batch_idx * batch_size + 1;
        if batch_idx > 0 && opts.interactive {
            ctx.set_phase(Phase::Paused).await;
            let remaining = total - batch_idx * batch_size;
            ctx.note(format!(
                "Completed batch {batch_idx}. {remaining} endpoints remaining."
            ))
            .await;
            let go_on = tokio::select! {
                go = gate.proceed(batch_idx, remaining) => go,
                _ = ctx.cancel_token().cancelled() => false,
            };
            if !go_on {
                if !ctx.is_cancelled() {
                    ctx.note("VPN speedtest stopped by user").await;
                    summary.outcome = MeasureOutcome::Stopped;
                }
                break 'batches;
            }
        }

        summary.batches += 1;
        ctx.note(format!(
            "=== Batch {}: testing endpoints {first}-{} of {total} ===",
            batch_idx + 1,
            first + batch.len() - 1
        ))
        .await;

        for cand in batch {
            if ctx.is_cancelled() {
                break 'batches;
            }
            let line = measure_one(store, cand, tunnel, meter, ctx, &mut summary).await;
            summary.processed += 1;
            ctx.advance(line).await;
        }
    }

    if ctx.is_cancelled() {
        summary.outcome = MeasureOutcome::Cancelled;
        ctx.set_phase(Phase::Cancelled).await;
    } else {
        ctx.set_phase(Phase::Done).await;
    }
    info!(
        processed = summary.processed,
        measured = summary.measured,
        failed = summary.failed,
        outcome = ?summary.outcome,
        "bandwidth measurement finished"
    );
    Ok(summary)
}

async fn measure_one(
    store: &mut ResultStore,
    cand: &Candidate,
    tunnel: &mut dyn Tunnel,
    meter: &dyn BandwidthMeter,
    ctx: &RunContext,
    summary: &mut MeasureSummary,
) -> String {
    let name = &cand.name;
    ctx.set_phase(Phase::Connecting).await;
    let line = match tunnel.connect(&cand.config).await {
        Ok(()) => {
            ctx.set_phase(Phase::Measuring).await;
            match meter.measure().await {
                Ok(bw) => {
                    if let Some(rec) = store.get_mut(name) {
                        rec.download_mbps = Some(bw.download_mbps);
                        rec.upload_mbps = Some(bw.upload_mbps);
                    }
                    summary.measured += 1;
                    format!(
                        "{name}: DL={} Mbps, UL={} Mbps",
                        bw.download_mbps, bw.upload_mbps
                    )
                }
                Err(e) => {
                    summary.failed += 1;
                    format!("{name}: speedtest failed: {e}")
                }
            }
        }
        Err(e) => {
            summary.failed += 1;
            format!("{name}: VPN connection failed: {e}")
        }
    };
    ctx.set_phase(Phase::Disconnecting).await;
    tunnel.disconnect().await;
    line
}
