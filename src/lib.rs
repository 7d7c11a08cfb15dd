//! Library crate for geo-scan-rs: concurrent latency scanning with GeoIP enrichment,
//! a mergeable result store and batched VPN bandwidth measurement.
pub mod batch;
pub mod config;
pub mod error;
pub mod geo;
pub mod pipeline;
pub mod policy;
pub mod probe;
pub mod resolve;
pub mod run;
pub mod scanner;
pub mod server;
pub mod speedtest;
pub mod store;
pub mod targets;
pub mod tunnel;
pub mod types;
