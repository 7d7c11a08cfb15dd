use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::types::ProbeOutcome;

/// Latency probe against a single address.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe once (which may send `count` echo requests) and report the average RTT.
    /// Never fails: anything other than a parsable average is `NoResponse`.
    async fn probe(&self, address: IpAddr, count: u32, timeout: Duration) -> ProbeOutcome;
}

// "rtt min/avg/max/mdev = 12.3/23.4/30.1/2.2 ms" (Linux) or "round-trip min/avg/max/stddev = ..." (BSD)
static SLASH_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"=\s*([\d.]+)/([\d.]+)/").expect("static regex")
});

// "Minimum = 10ms, Maximum = 30ms, Average = 23ms" (Windows)
static AVERAGE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Average\s*=\s*([\d.]+)\s*ms").expect("static regex")
});

/// Extract the average round-trip time from a ping report.
pub fn parse_ping_output(output: &str) -> ProbeOutcome {
    let avg = SLASH_SUMMARY
        .captures(output)
        .and_then(|c| c.get(2))
        .or_else(|| AVERAGE_LABEL.captures(output).and_then(|c| c.get(1)))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    match avg {
        Some(ms) if ms.is_finite() && ms >= 0.0 => ProbeOutcome::Ok(ms),
        _ => ProbeOutcome::NoResponse,
    }
}

/// Arguments for the platform `ping`, excluding the address.
pub fn ping_args(count: u32, timeout: Duration) -> Vec<String> {
    let count = count.max(1).to_string();
    if cfg!(windows) {
        vec!["-n".into(), count, "-w".into(), timeout.as_millis().to_string()]
    } else {
        let secs = ((timeout.as_millis() as f64) / 1000.0).round().max(1.0) as u64;
        vec!["-c".into(), count, "-W".into(), secs.to_string()]
    }
}

/// Probe implemented by spawning the system `ping`.
#[derive(Debug, Clone)]
pub struct PingProbe {
    program: String,
}

impl PingProbe {
    pub fn new() -> Self {
        Self {
            program: "ping".to_string(),
        }
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for PingProbe {
    async fn probe(&self, address: IpAddr, count: u32, timeout: Duration) -> ProbeOutcome {
        let mut cmd = Command::new(&self.program);
        cmd.args(ping_args(count, timeout))
            .arg(address.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // Whole invocation bound: every echo may wait the full per-reply timeout.
        let bound = timeout * count.max(1) + Duration::from_secs(2);
        match time::timeout(bound, cmd.output()).await {
            Ok(Ok(out)) => parse_ping_output(&String::from_utf8_lossy(&out.stdout)),
            Ok(Err(e)) => {
                debug!(%address, error = %e, "failed to run ping");
                ProbeOutcome::NoResponse
            }
            Err(_) => {
                debug!(%address, "ping timed out");
                ProbeOutcome::NoResponse
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linux_summary() {
        let out = "\
PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.
64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=11.9 ms

--- 1.1.1.1 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 11.912/13.481/15.050/1.569 ms
";
        assert_eq!(parse_ping_output(out), ProbeOutcome::Ok(13.481));
    }

    #[test]
    fn parses_bsd_summary() {
        let out = "round-trip min/avg/max/stddev = 9.1/10.5/12.0/1.1 ms\n";
        assert_eq!(parse_ping_output(out), ProbeOutcome::Ok(10.5));
    }

    #[test]
    fn parses_windows_average() {
        let out = "\
Ping statistics for 1.1.1.1:
    Packets: Sent = 2, Received = 2, Lost = 0 (0% loss),
Approximate round trip times in milli-seconds:
    Minimum = 10ms, Maximum = 30ms, Average = 23ms
";
        assert_eq!(parse_ping_output(out), ProbeOutcome::Ok(23.0));
    }

    #[test]
    fn unknown_or_lossy_output_is_no_response() {
        assert_eq!(parse_ping_output(""), ProbeOutcome::NoResponse);
        let lost = "1 packets transmitted, 0 received, 100% packet loss, time 0ms\n";
        assert_eq!(parse_ping_output(lost), ProbeOutcome::NoResponse);
        assert_eq!(parse_ping_output("rtt = x/y/z"), ProbeOutcome::NoResponse);
    }

    #[test]
    fn unix_timeout_rounds_to_whole_seconds() {
        if cfg!(windows) {
            return;
        }
        assert_eq!(ping_args(3, Duration::from_millis(400)), vec!["-c", "3", "-W", "1"]);
        assert_eq!(ping_args(1, Duration::from_millis(2600)), vec!["-c", "1", "-W", "3"]);
    }
}
