use std::net::IpAddr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One resolved (name, address) pair submitted to the probe stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub address: IpAddr,
}

/// Result of a single external latency probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Ok(f64),
    NoResponse,
}

/// Best-effort geographic metadata for an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
}

pub const UNKNOWN: &str = "Unknown";

impl Default for GeoInfo {
    fn default() -> Self {
        Self {
            country: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
        }
    }
}

/// Persisted knowledge about one endpoint.
///
/// Bandwidth fields stay `None` until a measurement batch succeeds for the endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub latency_ms: f64,
    #[serde(alias = "ip")]
    pub address: String,
    pub country: String,
    pub city: String,
    #[serde(default, alias = "rx_speed_mbps", skip_serializing_if = "Option::is_none")]
    pub download_mbps: Option<f64>,
    #[serde(default, alias = "tx_speed_mbps", skip_serializing_if = "Option::is_none")]
    pub upload_mbps: Option<f64>,
}

impl ScanRecord {
    pub fn has_bandwidth(&self) -> bool {
        self.download_mbps.is_some() && self.upload_mbps.is_some()
    }
}

/// Endpoint name -> record. Iteration order is latency order when written by a scan.
pub type ResultStore = IndexMap<String, ScanRecord>;

/// One reachable endpoint produced by a scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanEntry {
    pub name: String,
    #[serde(flatten)]
    pub record: ScanRecord,
}

/// Aggregate counters for a scan run.
///
/// `total == ok + skipped + probe_errors + resolution_errors`; targets never dispatched
/// because of cancellation are reported separately in `not_dispatched`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub resolution_errors: u64,
    pub skipped: u64,
    pub probe_errors: u64,
    pub ok: u64,
    pub total: u64,
    pub not_dispatched: u64,
}

/// Entries ordered by ascending latency, plus counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanResults {
    pub stats: ScanStats,
    pub cancelled: bool,
    pub entries: Vec<ScanEntry>,
}
