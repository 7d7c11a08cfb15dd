use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::time::Duration;

use geo_scan_rs::batch::{BatchGate, MeasureOptions, MeasureOutcome, MeasureSummary};
use geo_scan_rs::config::AppConfig;
use geo_scan_rs::run::{RunKind, RunRegistry};
use geo_scan_rs::scanner::ScanOptions;
use geo_scan_rs::speedtest::SpeedtestCli;
use geo_scan_rs::tunnel::Tunnel;
use geo_scan_rs::types::{ResultStore, ScanStats};
use geo_scan_rs::{pipeline, server};

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// geo-scan-rs: latency scanner with GeoIP enrichment and batched VPN bandwidth tests.
#[derive(Debug, Parser)]
#[command(name = "geo-scan-rs", version, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: AppConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Measure latency to every target and write the merged result store.
    Scan {
        #[command(flatten)]
        scan: ScanArgs,

        /// Run VPN bandwidth batches after the scan.
        #[arg(long, default_value_t = false)]
        measure: bool,

        #[command(flatten)]
        batches: BatchArgs,
    },
    /// Run VPN bandwidth batches against the existing result store.
    Measure {
        #[command(flatten)]
        batches: BatchArgs,

        /// Only measure these endpoints (comma separated).
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Start the HTTP control plane.
    Serve {
        #[arg(long, default_value = "127.0.0.1:5000")]
        bind: String,
    },
}

#[derive(Debug, Clone, Args)]
struct ScanArgs {
    /// Echo requests per target.
    #[arg(long, default_value_t = 1)]
    pings: u32,

    /// Per-reply ping timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 1000)]
    timeout_ms: u64,

    /// Concurrent probes.
    #[arg(long, default_value_t = 20)]
    workers: usize,

    /// Probe every resolved address, not only the first.
    #[arg(long = "all-addresses", default_value_t = false)]
    all_addresses: bool,
}

#[derive(Debug, Clone, Args)]
struct BatchArgs {
    /// Endpoints per batch.
    #[arg(long = "batch-size", default_value_t = 20)]
    batch_size: usize,

    /// Do not ask before each new batch.
    #[arg(long = "no-prompt", default_value_t = false)]
    no_prompt: bool,
}

/// Asks on the terminal whether to continue with the next batch.
struct StdinGate;

#[async_trait]
impl BatchGate for StdinGate {
    async fn proceed(&self, completed: usize, remaining: usize) -> bool {
        tokio::task::spawn_blocking(move || {
            println!("\nCompleted batch {completed}. {remaining} endpoints remaining.");
            print!("Continue with next batch? (y/n): ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => false,
                Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            }
        })
        .await
        .unwrap_or(false)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let registry = RunRegistry::new();

    match cli.command {
        Command::Scan {
            scan,
            measure,
            batches,
        } => {
            let opts = ScanOptions {
                pings: scan.pings,
                timeout: Duration::from_millis(scan.timeout_ms),
                workers: scan.workers,
                all_addresses: scan.all_addresses,
            };
            let deps = pipeline::system_deps(&cli.config)?;
            let store = {
                let (_guard, ctx) = registry.try_begin(RunKind::Scan).await?;
                cancel_on_ctrl_c(ctx.cancel_token().clone());
                let report = pipeline::run_scan_phase(&cli.config, &opts, &deps, &ctx).await?;
                print_results_table(&report.store);
                print_stats(&report.stats);
                if report.cancelled {
                    return Ok(());
                }
                report.store
            };
            if measure {
                run_measure(&cli.config, &registry, &batches, None, Some(store)).await?;
            }
        }
        Command::Measure { batches, only } => {
            let only = (!only.is_empty()).then(|| only.into_iter().collect());
            run_measure(&cli.config, &registry, &batches, only, None).await?;
        }
        Command::Serve { bind } => {
            server::spawn_server(&bind, cli.config).await?;
        }
    }
    Ok(())
}

fn cancel_on_ctrl_c(token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            token.cancel();
        }
    });
}

async fn run_measure(
    config: &AppConfig,
    registry: &RunRegistry,
    batches: &BatchArgs,
    only: Option<HashSet<String>>,
    store: Option<ResultStore>,
) -> Result<()> {
    if !config.has_vpn_credentials() {
        bail!("VPN bandwidth tests need --vpn-username and --vpn-password");
    }
    let opts = MeasureOptions {
        config_dir: config.vpn_config_dir.clone(),
        batch_size: batches.batch_size,
        interactive: !batches.no_prompt,
        only,
    };
    let (_guard, ctx) = registry.try_begin(RunKind::Measure).await?;
    cancel_on_ctrl_c(ctx.cancel_token().clone());

    let mut tunnel = pipeline::system_tunnel(config);
    let meter = SpeedtestCli::new();
    let res = pipeline::run_measure_phase(
        config,
        &opts,
        store,
        &mut tunnel,
        &meter,
        &StdinGate,
        &ctx,
    )
    .await;
    tunnel.disconnect().await;

    let (summary, store) = res?;
    print_results_table(&store);
    print_measure_summary(&summary);
    Ok(())
}

fn fmt_mbps(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string())
}

fn print_results_table(store: &ResultStore) {
    let mut name_w = "name".len();
    let mut addr_w = "address".len();
    let mut country_w = "country".len();
    let mut city_w = "city".len();
    for (name, r) in store {
        name_w = name_w.max(name.len());
        addr_w = addr_w.max(r.address.len());
        country_w = country_w.max(r.country.len());
        city_w = city_w.max(r.city.len());
    }
    let lat_w = "latency_ms".len();
    let bw_w = "down_mbps".len();

    println!(
        "\n{:<name_w$}  {:>lat_w$}  {:<addr_w$}  {:<country_w$}  {:<city_w$}  {:>bw_w$}  {:>bw_w$}",
        "name", "latency_ms", "address", "country", "city", "down_mbps", "up_mbps"
    );
    println!(
        "{:-<name_w$}  {:-<lat_w$}  {:-<addr_w$}  {:-<country_w$}  {:-<city_w$}  {:-<bw_w$}  {:-<bw_w$}",
        "", "", "", "", "", "", ""
    );
    for (name, r) in store {
        println!(
            "{:<name_w$}  {:>lat_w$.3}  {:<addr_w$}  {:<country_w$}  {:<city_w$}  {:>bw_w$}  {:>bw_w$}",
            name,
            r.latency_ms,
            r.address,
            r.country,
            r.city,
            fmt_mbps(r.download_mbps),
            fmt_mbps(r.upload_mbps),
        );
    }
}

fn print_stats(stats: &ScanStats) {
    println!();
    println!("Excluded:        {} / {}", stats.skipped, stats.total);
    println!("Errors:          {} / {}", stats.probe_errors + stats.resolution_errors, stats.total);
    println!("Total retrieved: {} / {}", stats.ok, stats.total);
    if stats.not_dispatched > 0 {
        println!("Not scanned:     {} (cancelled)", stats.not_dispatched);
    }
}

fn print_measure_summary(summary: &MeasureSummary) {
    let how = match summary.outcome {
        MeasureOutcome::Completed => "completed",
        MeasureOutcome::Stopped => "stopped by user",
        MeasureOutcome::Cancelled => "cancelled",
    };
    info!(
        measured = summary.measured,
        failed = summary.failed,
        candidates = summary.candidates,
        "bandwidth tests {how}"
    );
    println!(
        "\nBandwidth tests {how}: {} measured, {} failed, {} of {} processed in {} batch(es)",
        summary.measured, summary.failed, summary.processed, summary.candidates, summary.batches
    );
}
