use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MeasureError {
    #[error("failed to start measurement tool: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("measurement timed out after {0:?}")]
    Timeout(Duration),
    #[error("measurement tool failed: {0}")]
    Failed(String),
    #[error("unusable measurement report: {0}")]
    Parse(String),
}

/// Download/upload rates in megabits per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bandwidth {
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

/// Bandwidth measurement over whatever route is currently active.
#[async_trait]
pub trait BandwidthMeter: Send + Sync {
    async fn measure(&self) -> Result<Bandwidth, MeasureError>;
}

#[derive(Deserialize)]
struct SpeedtestReport {
    download: Option<f64>,
    upload: Option<f64>,
}

fn to_mbps(bits_per_sec: f64) -> f64 {
    (bits_per_sec / 1_000_000.0 * 100.0).round() / 100.0
}

/// Parse `speedtest-cli --json` output. Rates are bits per second.
pub fn parse_speedtest_json(s: &str) -> Result<Bandwidth, MeasureError> {
    let report: SpeedtestReport =
        serde_json::from_str(s).map_err(|e| MeasureError::Parse(e.to_string()))?;
    match (report.download, report.upload) {
        (Some(d), Some(u)) if d.is_finite() && u.is_finite() && d >= 0.0 && u >= 0.0 => {
            Ok(Bandwidth {
                download_mbps: to_mbps(d),
                upload_mbps: to_mbps(u),
            })
        }
        _ => Err(MeasureError::Parse("missing download/upload rate".into())),
    }
}

/// Runs `speedtest-cli --json --secure`.
#[derive(Debug, Clone)]
pub struct SpeedtestCli {
    program: String,
    timeout: Duration,
}

impl SpeedtestCli {
    pub fn new() -> Self {
        Self {
            program: "speedtest-cli".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl Default for SpeedtestCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BandwidthMeter for SpeedtestCli {
    async fn measure(&self) -> Result<Bandwidth, MeasureError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--json", "--secure", "--timeout", "30"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let out = time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| MeasureError::Timeout(self.timeout))??;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(MeasureError::Failed(format!("{}: {stderr}", out.status)));
        }
        let bw = parse_speedtest_json(&String::from_utf8_lossy(&out.stdout))?;
        debug!(download = bw.download_mbps, upload = bw.upload_mbps, "speedtest complete");
        Ok(bw)
    }
}
