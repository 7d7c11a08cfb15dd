use geo_scan_rs::store::{decode_store, load_store, merge, persist_store};
use geo_scan_rs::types::{ResultStore, ScanEntry, ScanRecord};

fn record(latency_ms: f64, address: &str, down: Option<f64>, up: Option<f64>) -> ScanRecord {
    ScanRecord {
        latency_ms,
        address: address.to_string(),
        country: "Netherlands".to_string(),
        city: "Amsterdam".to_string(),
        download_mbps: down,
        upload_mbps: up,
    }
}

fn entry(name: &str, rec: ScanRecord) -> ScanEntry {
    ScanEntry {
        name: name.to_string(),
        record: rec,
    }
}

/// What a latency-only scan of `store` would produce.
fn rescan(store: &ResultStore) -> Vec<ScanEntry> {
    store
        .iter()
        .map(|(name, r)| {
            entry(
                name,
                ScanRecord {
                    download_mbps: None,
                    upload_mbps: None,
                    ..r.clone()
                },
            )
        })
        .collect()
}

#[test]
fn rescan_keeps_measured_bandwidth() {
    let mut previous = ResultStore::new();
    previous.insert("e.example.com".into(), record(40.0, "192.0.2.1", Some(12.3), Some(4.5)));

    let fresh = vec![entry("e.example.com", record(25.0, "192.0.2.9", None, None))];
    let merged = merge(&fresh, Some(&previous));

    let rec = &merged["e.example.com"];
    assert_eq!(rec.latency_ms, 25.0);
    assert_eq!(rec.address, "192.0.2.9");
    assert_eq!(rec.download_mbps, Some(12.3));
    assert_eq!(rec.upload_mbps, Some(4.5));
}

#[test]
fn fresh_bandwidth_wins() {
    let mut previous = ResultStore::new();
    previous.insert("e".into(), record(40.0, "192.0.2.1", Some(12.3), Some(4.5)));
    let fresh = vec![entry("e", record(40.0, "192.0.2.1", Some(99.0), None))];
    let merged = merge(&fresh, Some(&previous));
    assert_eq!(merged["e"].download_mbps, Some(99.0));
    assert_eq!(merged["e"].upload_mbps, Some(4.5));
}

#[test]
fn names_not_rescanned_are_dropped() {
    let mut previous = ResultStore::new();
    previous.insert("gone".into(), record(1.0, "192.0.2.1", Some(1.0), Some(1.0)));
    previous.insert("kept".into(), record(2.0, "192.0.2.2", None, None));
    let merged = merge(&[entry("kept", record(3.0, "192.0.2.2", None, None))], Some(&previous));
    assert_eq!(merged.len(), 1);
    assert!(merged.contains_key("kept"));
}

#[test]
fn merging_a_store_with_its_own_rescan_is_a_no_op() {
    let mut store = ResultStore::new();
    store.insert("a".into(), record(5.0, "192.0.2.1", Some(50.0), Some(10.0)));
    store.insert("b".into(), record(9.0, "192.0.2.2", None, None));

    let once = merge(&rescan(&store), Some(&store));
    assert_eq!(once, store);
    let twice = merge(&rescan(&once), Some(&once));
    assert_eq!(twice, store);
}

#[test]
fn legacy_shapes_upgrade_without_bandwidth() {
    let shapes = [
        r#"{"a": [12.5, "192.0.2.1", "Norway", "Oslo"]}"#,
        r#"[["a", 12.5, "192.0.2.1", "Norway", "Oslo"]]"#,
        r#"[["a", [12.5, "192.0.2.1", "Norway", "Oslo"]]]"#,
        r#"[{"domain": "a", "latency_ms": 12.5, "ip": "192.0.2.1", "country": "Norway", "city": "Oslo"}]"#,
    ];
    for json in shapes {
        let store = decode_store(json).unwrap_or_else(|e| panic!("{json}: {e}"));
        let rec = &store["a"];
        assert_eq!(rec.latency_ms, 12.5, "{json}");
        assert_eq!(rec.address, "192.0.2.1", "{json}");
        assert_eq!(rec.country, "Norway", "{json}");
        assert_eq!(rec.city, "Oslo", "{json}");
        assert_eq!(rec.download_mbps, None, "{json}");
        assert_eq!(rec.upload_mbps, None, "{json}");
    }
}

#[test]
fn legacy_upgrade_is_idempotent() {
    let legacy = r#"{"a": [12.5, "192.0.2.1", "Norway", "Oslo"]}"#;
    let upgraded = decode_store(legacy).unwrap();
    let rewritten = serde_json::to_string(&upgraded).unwrap();
    assert_eq!(decode_store(&rewritten).unwrap(), upgraded);
}

#[test]
fn persist_writes_canonical_json_and_replaces_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.json");
    std::fs::write(&path, r#"{"old": [1, "192.0.2.1", "X", "Y"]}"#).unwrap();

    let mut store = ResultStore::new();
    store.insert("fast".into(), record(3.0, "192.0.2.3", Some(80.0), Some(20.0)));
    store.insert("slow".into(), record(90.0, "192.0.2.4", None, None));
    persist_store(&path, &store).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"download_mbps\": 80.0"));
    assert!(!text.contains("old"));
    let loaded = load_store(&path).unwrap().unwrap();
    assert_eq!(loaded, store);
    let names: Vec<&String> = loaded.keys().collect();
    assert_eq!(names, vec!["fast", "slow"]);
}

#[test]
fn missing_store_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_store(dir.path().join("nope.json")).unwrap().is_none());
}
