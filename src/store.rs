//! Persisted result store: decoding (including legacy shapes), merging and atomic rewrite.
use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Result, ScanError};
use crate::types::{ResultStore, ScanEntry, ScanRecord};

/// Every on-disk shape the store has had.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredShape {
    Map(IndexMap<String, StoredValue>),
    List(Vec<StoredListItem>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Record(ScanRecord),
    /// `[latency_ms, address, country, city]`
    Legacy((f64, String, String, String)),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredListItem {
    /// `{"domain": ..., "latency_ms": ..., "ip": ..., ...}`
    Named {
        #[serde(alias = "domain")]
        name: String,
        #[serde(flatten)]
        record: ScanRecord,
    },
    /// `[name, latency_ms, address, country, city]`
    Flat((String, f64, String, String, String)),
    /// `[name, [latency_ms, address, country, city]]`
    Pair((String, (f64, String, String, String))),
}

fn legacy_record(fields: (f64, String, String, String)) -> ScanRecord {
    let (latency_ms, address, country, city) = fields;
    ScanRecord {
        latency_ms,
        address,
        country,
        city,
        download_mbps: None,
        upload_mbps: None,
    }
}

/// Decode store JSON into the canonical shape, upgrading legacy layouts.
///
/// Legacy records keep their four original fields and never gain bandwidth values.
pub fn decode_store(json: &str) -> Result<ResultStore> {
    let shape: StoredShape =
        serde_json::from_str(json).map_err(|e| ScanError::StoreFormat(e.to_string()))?;
    let store = match shape {
        StoredShape::Map(map) => map
            .into_iter()
            .map(|(name, v)| {
                let rec = match v {
                    StoredValue::Record(r) => r,
                    StoredValue::Legacy(f) => legacy_record(f),
                };
                (name, rec)
            })
            .collect(),
        StoredShape::List(items) => items
            .into_iter()
            .map(|item| match item {
                StoredListItem::Named { name, record } => (name, record),
                StoredListItem::Flat((name, lat, addr, country, city)) => {
                    (name, legacy_record((lat, addr, country, city)))
                }
                StoredListItem::Pair((name, f)) => (name, legacy_record(f)),
            })
            .collect(),
    };
    Ok(store)
}

/// Read a store file. `Ok(None)` if it does not exist.
pub fn load_store(path: impl AsRef<Path>) -> Result<Option<ResultStore>> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => {
            let store = decode_store(&content)?;
            debug!(file = %path.display(), records = store.len(), "loaded result store");
            Ok(Some(store))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Rewrite the store file in full, atomically (temp file in the same directory, then rename).
pub fn persist_store(path: impl AsRef<Path>, store: &ResultStore) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, store)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ScanError::Io(e.error))?;
    info!(file = %path.display(), records = store.len(), "wrote result store");
    Ok(())
}

/// Merge fresh scan entries with the previous store.
///
/// Latency, address and geo fields always come from the fresh entry. Bandwidth comes from
/// the fresh entry if it has one, otherwise from the previous record of the same name.
/// Names absent from `fresh` are dropped.
pub fn merge(fresh: &[ScanEntry], previous: Option<&ResultStore>) -> ResultStore {
    fresh
        .iter()
        .map(|entry| {
            let mut rec = entry.record.clone();
            if let Some(old) = previous.and_then(|p| p.get(&entry.name)) {
                if rec.download_mbps.is_none() {
                    rec.download_mbps = old.download_mbps;
                }
                if rec.upload_mbps.is_none() {
                    rec.upload_mbps = old.upload_mbps;
                }
            }
            (entry.name.clone(), rec)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_map_of_lists_upgrades() {
        let store = decode_store(r#"{"a.example.com": [12.5, "192.0.2.1", "Norway", "Oslo"]}"#)
            .unwrap();
        let rec = &store["a.example.com"];
        assert_eq!(rec.latency_ms, 12.5);
        assert_eq!(rec.address, "192.0.2.1");
        assert_eq!(rec.country, "Norway");
        assert_eq!(rec.city, "Oslo");
        assert_eq!(rec.download_mbps, None);
        assert_eq!(rec.upload_mbps, None);
    }

    #[test]
    fn old_key_names_are_accepted() {
        let store = decode_store(
            r#"{"a": {"latency_ms": 3, "ip": "192.0.2.1", "country": "X", "city": "Y",
                     "rx_speed_mbps": 80.5, "tx_speed_mbps": null}}"#,
        )
        .unwrap();
        assert_eq!(store["a"].download_mbps, Some(80.5));
        assert_eq!(store["a"].upload_mbps, None);
        assert_eq!(store["a"].latency_ms, 3.0);
    }

    #[test]
    fn garbage_is_a_format_error() {
        assert!(matches!(decode_store("42"), Err(ScanError::StoreFormat(_))));
        assert!(matches!(
            decode_store(r#"{"a": "fast"}"#),
            Err(ScanError::StoreFormat(_))
        ));
    }
}
