use async_trait::async_trait;
use geo_scan_rs::batch::{
    find_tunnel_configs, run_batches, AutoContinue, BatchGate, ChannelGate, MeasureOptions,
    MeasureOutcome,
};
use geo_scan_rs::run::{Phase, RunContext};
use geo_scan_rs::speedtest::{Bandwidth, BandwidthMeter, MeasureError};
use geo_scan_rs::tunnel::{Tunnel, TunnelError};
use geo_scan_rs::types::{ResultStore, ScanRecord};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn record(latency_ms: f64) -> ScanRecord {
    ScanRecord {
        latency_ms,
        address: "192.0.2.1".into(),
        country: "Germany".into(),
        city: "Berlin".into(),
        download_mbps: None,
        upload_mbps: None,
    }
}

/// Store of `n` endpoints `e0..e{n-1}` (latency = 10 * (n - i), so e{n-1} is fastest),
/// each with a matching config file.
fn setup(n: usize) -> (TempDir, ResultStore) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ResultStore::new();
    for i in 0..n {
        let name = format!("e{i}");
        store.insert(name.clone(), record(10.0 * (n - i) as f64));
        std::fs::write(dir.path().join(format!("{name}.udp.ovpn")), "client\n").unwrap();
    }
    (dir, store)
}

fn opts(dir: &Path, batch_size: usize, interactive: bool) -> MeasureOptions {
    MeasureOptions {
        config_dir: dir.to_path_buf(),
        batch_size,
        interactive,
        only: None,
    }
}

#[derive(Default)]
struct FakeTunnel {
    up: bool,
    connects: Vec<PathBuf>,
    disconnects: usize,
    fail_for: HashSet<String>,
}

#[async_trait]
impl Tunnel for FakeTunnel {
    async fn connect(&mut self, config: &Path) -> Result<(), TunnelError> {
        assert!(!self.up, "only one tunnel may be up at a time");
        self.connects.push(config.to_path_buf());
        let stem = config.file_name().unwrap().to_string_lossy().to_string();
        if self.fail_for.iter().any(|f| stem.starts_with(&format!("{f}."))) {
            return Err(TunnelError::Timeout(std::time::Duration::from_secs(30)));
        }
        self.up = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.up = false;
        self.disconnects += 1;
    }
}

/// Returns 100, 101, ... Mbps down; optionally cancels the run after the nth call.
struct FakeMeter {
    calls: AtomicUsize,
    cancel_after: Option<(usize, RunContext)>,
    fail: bool,
}

impl FakeMeter {
    fn ok() -> Self {
        Self { calls: AtomicUsize::new(0), cancel_after: None, fail: false }
    }
}

#[async_trait]
impl BandwidthMeter for FakeMeter {
    async fn measure(&self) -> Result<Bandwidth, MeasureError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, ctx)) = &self.cancel_after {
            if n == *after {
                ctx.cancel();
            }
        }
        if self.fail {
            return Err(MeasureError::Failed("exit status: 1".into()));
        }
        Ok(Bandwidth { download_mbps: 99.0 + n as f64, upload_mbps: 10.0 })
    }
}

/// Records each pause and answers from a script.
struct ScriptedGate {
    answers: Mutex<Vec<bool>>,
    asked: Mutex<Vec<(usize, usize)>>,
}

#[async_trait]
impl BatchGate for ScriptedGate {
    async fn proceed(&self, completed: usize, remaining: usize) -> bool {
        self.asked.lock().unwrap().push((completed, remaining));
        let mut a = self.answers.lock().unwrap();
        if a.is_empty() { false } else { a.remove(0) }
    }
}

#[tokio::test]
async fn non_interactive_runs_all_batches_without_pausing() {
    let (dir, mut store) = setup(5);
    let mut tunnel = FakeTunnel::default();
    let meter = FakeMeter::ok();
    let gate = ScriptedGate { answers: Mutex::new(vec![]), asked: Mutex::new(vec![]) };
    let ctx = RunContext::new();
    ctx.start("measure").await;

    let summary = run_batches(&mut store, &opts(dir.path(), 2, false), &mut tunnel, &meter, &gate, &ctx)
        .await
        .unwrap();

    assert_eq!(summary.batches, 3);
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.measured, 5);
    assert_eq!(summary.outcome, MeasureOutcome::Completed);
    assert!(gate.asked.lock().unwrap().is_empty());
    assert_eq!(tunnel.disconnects, 5);
    assert!(store.values().all(|r| r.has_bandwidth()));

    // Fastest first: e4 (10 ms) is measured first.
    assert!(tunnel.connects[0].ends_with("e4.udp.ovpn"));
    assert_eq!(store["e4"].download_mbps, Some(100.0));
    assert_eq!(store["e0"].download_mbps, Some(104.0));

    let p = ctx.progress().await;
    assert_eq!((p.done, p.total), (5, 5));
    assert_eq!(p.phase, Phase::Done);
}

#[tokio::test]
async fn cancel_after_second_candidate_leaves_the_rest_untouched() {
    let (dir, mut store) = setup(5);
    store.get_mut("e0").unwrap().download_mbps = Some(1.5);
    store.get_mut("e0").unwrap().upload_mbps = Some(0.5);

    let ctx = RunContext::new();
    ctx.start("measure").await;
    let mut tunnel = FakeTunnel::default();
    let meter = FakeMeter { calls: AtomicUsize::new(0), cancel_after: Some((2, ctx.clone())), fail: false };

    let summary = run_batches(&mut store, &opts(dir.path(), 2, false), &mut tunnel, &meter, &AutoContinue, &ctx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, MeasureOutcome::Cancelled);
    assert_eq!(summary.processed, 2);
    assert!(store["e4"].has_bandwidth());
    assert!(store["e3"].has_bandwidth());
    assert!(!store["e2"].has_bandwidth());
    assert!(!store["e1"].has_bandwidth());
    assert_eq!(store["e0"].download_mbps, Some(1.5));
    assert_eq!(tunnel.disconnects, 2);
    assert_eq!(ctx.progress().await.phase, Phase::Cancelled);
}

#[tokio::test]
async fn failures_keep_previous_values_and_still_disconnect() {
    let (dir, mut store) = setup(3);
    store.get_mut("e1").unwrap().download_mbps = Some(7.0);
    store.get_mut("e1").unwrap().upload_mbps = Some(2.0);

    let mut tunnel = FakeTunnel { fail_for: ["e1".to_string()].into(), ..FakeTunnel::default() };
    let meter = FakeMeter { calls: AtomicUsize::new(0), cancel_after: None, fail: true };
    let ctx = RunContext::new();

    let summary = run_batches(&mut store, &opts(dir.path(), 10, false), &mut tunnel, &meter, &AutoContinue, &ctx)
        .await
        .unwrap();

    assert_eq!(summary.failed, 3);
    assert_eq!(summary.measured, 0);
    assert_eq!(tunnel.disconnects, 3);
    assert_eq!(store["e1"].download_mbps, Some(7.0));
    assert_eq!(store["e0"].download_mbps, None);
    // Connect failed for e1, so the meter only ran twice.
    assert_eq!(meter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn interactive_stop_ends_after_current_batch() {
    let (dir, mut store) = setup(5);
    let mut tunnel = FakeTunnel::default();
    let meter = FakeMeter::ok();
    let gate = ScriptedGate { answers: Mutex::new(vec![true, false]), asked: Mutex::new(vec![]) };
    let ctx = RunContext::new();

    let summary = run_batches(&mut store, &opts(dir.path(), 2, true), &mut tunnel, &meter, &gate, &ctx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, MeasureOutcome::Stopped);
    assert_eq!(summary.processed, 4);
    assert_eq!(*gate.asked.lock().unwrap(), vec![(1, 3), (2, 1)]);
    assert!(!store["e0"].has_bandwidth());
}

#[tokio::test]
async fn channel_gate_resumes_parked_run() {
    let (dir, store) = setup(3);
    let gate = Arc::new(ChannelGate::new());
    let ctx = RunContext::new();

    let task = {
        let gate = gate.clone();
        let ctx = ctx.clone();
        let options = opts(dir.path(), 1, true);
        tokio::spawn(async move {
            let mut store = store;
            let mut tunnel = FakeTunnel::default();
            let meter = FakeMeter::ok();
            let summary = run_batches(&mut store, &options, &mut tunnel, &meter, gate.as_ref(), &ctx)
                .await
                .unwrap();
            (summary, store)
        })
    };

    for answer in [true, true] {
        while !gate.is_waiting().await {
            tokio::task::yield_now().await;
        }
        assert_eq!(ctx.progress().await.phase, Phase::Paused);
        assert!(gate.resolve(answer).await);
    }
    let (summary, store) = task.await.unwrap();
    assert_eq!(summary.outcome, MeasureOutcome::Completed);
    assert_eq!(summary.batches, 3);
    assert!(store.values().all(|r| r.has_bandwidth()));
    assert!(!gate.resolve(true).await);
}

#[tokio::test]
async fn cancel_releases_a_parked_gate() {
    let (dir, mut store) = setup(2);
    let gate = ChannelGate::new();
    let ctx = RunContext::new();
    let canceller = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            ctx.cancel();
        })
    };
    let mut tunnel = FakeTunnel::default();
    let summary = run_batches(&mut store, &opts(dir.path(), 1, true), &mut tunnel, &FakeMeter::ok(), &gate, &ctx)
        .await
        .unwrap();
    canceller.await.unwrap();
    assert_eq!(summary.outcome, MeasureOutcome::Cancelled);
    assert_eq!(summary.processed, 1);
    assert!(!gate.is_waiting().await);
    assert!(!gate.resolve(true).await);
}

#[tokio::test]
async fn subset_and_missing_configs_limit_candidates() {
    let (dir, mut store) = setup(3);
    store.insert("no-config".into(), record(1.0));
    let mut o = opts(dir.path(), 5, false);
    o.only = Some(["e1".to_string(), "no-config".to_string()].into());

    let mut tunnel = FakeTunnel::default();
    let summary = run_batches(&mut store, &o, &mut tunnel, &FakeMeter::ok(), &AutoContinue, &RunContext::new())
        .await
        .unwrap();
    assert_eq!(summary.candidates, 1);
    assert!(store["e1"].has_bandwidth());
    assert!(!store["no-config"].has_bandwidth());
}

#[tokio::test]
async fn missing_config_dir_is_a_no_op() {
    let (_dir, mut store) = setup(2);
    let mut tunnel = FakeTunnel::default();
    let summary = run_batches(
        &mut store,
        &opts(Path::new("/nonexistent/ovpn"), 5, false),
        &mut tunnel,
        &FakeMeter::ok(),
        &AutoContinue,
        &RunContext::new(),
    )
    .await
    .unwrap();
    assert_eq!(summary.candidates, 0);
    assert_eq!(summary.outcome, MeasureOutcome::Completed);
    assert!(tunnel.connects.is_empty());
}

#[test]
fn config_files_map_to_endpoint_names() {
    let dir = tempfile::tempdir().unwrap();
    for f in ["ad1.example.com.tcp.ovpn", "ad1.example.com.udp.ovpn", "plain.ovpn", "notes.txt"] {
        std::fs::write(dir.path().join(f), "").unwrap();
    }
    let map = find_tunnel_configs(dir.path()).unwrap().unwrap();
    assert_eq!(map.len(), 2);
    assert!(map["ad1.example.com"].ends_with("ad1.example.com.udp.ovpn"));
    assert!(map["plain"].ends_with("plain.ovpn"));
}
