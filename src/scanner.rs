use crate::error::{Result, ScanError};
use crate::geo::{lookup_geo, GeoLookup};
use crate::policy::{CountryPolicy, PolicyVerdict};
use crate::probe::Prober;
use crate::resolve::{resolve_one, Resolver};
use crate::run::RunContext;
use crate::types::{ProbeOutcome, ScanEntry, ScanRecord, ScanResults, ScanStats, Target};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Knobs for one scan run.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Echo requests per probe invocation.
    pub pings: u32,
    /// Per-reply timeout handed to the probe.
    pub timeout: Duration,
    /// Worker pool size.
    pub workers: usize,
    /// Keep every resolved address of a name instead of only the first.
    pub all_addresses: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            pings: 1,
            timeout: Duration::from_millis(1000),
            workers: 20,
            all_addresses: false,
        }
    }
}

/// External collaborators used by a scan.
#[derive(Clone)]
pub struct ScanDeps {
    pub resolver: Arc<dyn Resolver>,
    pub prober: Arc<dyn Prober>,
    pub geo: Arc<dyn GeoLookup>,
}

/// Classified result of one target task.
#[derive(Debug, Clone, PartialEq)]
enum TaskOutcome {
    Ok(ScanEntry),
    Skipped,
    NoResponse,
}

/// Resolve, geo-locate, filter and probe every name using a bounded worker pool.
///
/// - Concurrency is bounded by a `Semaphore` of `workers` permits over a `JoinSet`.
/// - Each task returns its own outcome; results are combined only after every task joined.
/// - Cancellation is checked before each resolution and before each dispatch; tasks already
///   running finish normally.
/// - Entries come back sorted by latency, ties in input order.
pub async fn scan_targets(
    names: &[String],
    policy: &CountryPolicy,
    opts: &ScanOptions,
    deps: &ScanDeps,
    ctx: &RunContext,
) -> Result<ScanResults> {
    if names.is_empty() {
        return Err(ScanError::NoTargets("input".to_string()));
    }

    info!(
        servers = names.len(),
        pings = opts.pings,
        workers = opts.workers,
        timeout_ms = opts.timeout.as_millis() as u64,
        all_addresses = opts.all_addresses,
        "measuring latency"
    );

    let mut stats = ScanStats::default();
    let mut targets: Vec<Target> = Vec::new();
    for name in names {
        if ctx.is_cancelled() {
            break;
        }
        match resolve_one(deps.resolver.as_ref(), name, opts.all_addresses).await {
            Some(t) => targets.extend(t),
            None => {
                stats.resolution_errors += 1;
                ctx.note(format!("Unable to resolve {name}, skipping")).await;
            }
        }
    }
    ctx.set_total(targets.len() as u64).await;

    let sem = Arc::new(Semaphore::new(opts.workers.clamp(1, 1_000)));
    let policy = Arc::new(policy.clone());
    let mut set = JoinSet::new();
    let mut dispatched = 0usize;

    for (idx, target) in targets.iter().cloned().enumerate() {
        if ctx.is_cancelled() {
            break;
        }
        // Cancel is polled first: a permit freed by the task that cancelled must not
        // dispatch another target.
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => break,
            p = sem.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        if ctx.is_cancelled() {
            break;
        }
        dispatched += 1;

        let deps = deps.clone();
        let policy = policy.clone();
        let ctx = ctx.clone();
        let opts = opts.clone();

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes
            let outcome = scan_one(&target, &policy, &opts, &deps, &ctx).await;
            (idx, outcome)
        });
    }

    let mut outcomes: Vec<(usize, TaskOutcome)> = Vec::with_capacity(dispatched);
    while let Some(res) = set.join_next().await {
        match res {
            Ok(pair) => outcomes.push(pair),
            Err(e) => {
                warn!(error = %e, "scan task failed");
                stats.probe_errors += 1;
                ctx.advance(format!("Scan task failed: {e}")).await;
            }
        }
    }
    outcomes.sort_by_key(|(idx, _)| *idx);

    let mut entries = Vec::new();
    for (_, outcome) in outcomes {
        match outcome {
            TaskOutcome::Ok(entry) => {
                stats.ok += 1;
                entries.push(entry);
            }
            TaskOutcome::Skipped => stats.skipped += 1,
            TaskOutcome::NoResponse => stats.probe_errors += 1,
        }
    }
    // Stable: equal latencies keep input order.
    entries.sort_by(|a, b| a.record.latency_ms.total_cmp(&b.record.latency_ms));

    stats.total = dispatched as u64 + stats.resolution_errors;
    stats.not_dispatched = (targets.len() - dispatched) as u64;

    let cancelled = ctx.is_cancelled();
    info!(
        ok = stats.ok,
        skipped = stats.skipped,
        probe_errors = stats.probe_errors,
        resolution_errors = stats.resolution_errors,
        total = stats.total,
        cancelled,
        "scan finished"
    );

    Ok(ScanResults {
        stats,
        cancelled,
        entries,
    })
}

async fn scan_one(
    target: &Target,
    policy: &CountryPolicy,
    opts: &ScanOptions,
    deps: &ScanDeps,
    ctx: &RunContext,
) -> TaskOutcome {
    let name = &target.name;
    let geo = lookup_geo(deps.geo.as_ref(), target.address);

    match policy.verdict(&geo.country) {
        PolicyVerdict::Excluded => {
            ctx.advance(format!("Excluding {name} in {}", geo.country)).await;
            return TaskOutcome::Skipped;
        }
        PolicyVerdict::NotIncluded => {
            ctx.advance(format!(
                "Skipping {name} in {} (not in include list)",
                geo.country
            ))
            .await;
            return TaskOutcome::Skipped;
        }
        PolicyVerdict::Keep => {}
    }

    match deps
        .prober
        .probe(target.address, opts.pings, opts.timeout)
        .await
    {
        ProbeOutcome::Ok(latency_ms) => {
            ctx.advance(format!(
                "{name} {latency_ms} {} {} {}",
                target.address, geo.country, geo.city
            ))
            .await;
            TaskOutcome::Ok(ScanEntry {
                name: name.clone(),
                record: ScanRecord {
                    latency_ms,
                    address: target.address.to_string(),
                    country: geo.country,
                    city: geo.city,
                    download_mbps: None,
                    upload_mbps: None,
                },
            })
        }
        ProbeOutcome::NoResponse => {
            ctx.advance(format!("No response time received from {name}, skipping"))
                .await;
            TaskOutcome::NoResponse
        }
    }
}
