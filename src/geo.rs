use anyhow::{anyhow, Result};
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

use crate::types::{GeoInfo, UNKNOWN};

/// Address -> country/city names. The two lookups are independent and each may fail.
pub trait GeoLookup: Send + Sync {
    fn country(&self, address: IpAddr) -> Result<Option<String>>;
    fn city(&self, address: IpAddr) -> Result<Option<String>>;
}

fn or_unknown(field: &str, address: IpAddr, res: Result<Option<String>>) -> String {
    match res {
        Ok(Some(name)) if !name.trim().is_empty() => name,
        Ok(_) => {
            debug!(%address, field, "no name in geo database, using Unknown");
            UNKNOWN.to_string()
        }
        Err(e) => {
            debug!(%address, field, error = %e, "geo lookup failed, using Unknown");
            UNKNOWN.to_string()
        }
    }
}

/// Best-effort geo enrichment. Never fails; missing data becomes `"Unknown"`.
pub fn lookup_geo(geo: &dyn GeoLookup, address: IpAddr) -> GeoInfo {
    GeoInfo {
        country: or_unknown("country", address, geo.country(address)),
        city: or_unknown("city", address, geo.city(address)),
    }
}

/// Lookup backed by MaxMind GeoLite2 country and city databases.
pub struct MaxMindGeo {
    country_db: Option<Reader<Vec<u8>>>,
    city_db: Option<Reader<Vec<u8>>>,
}

fn open_db(path: &Path) -> Option<Reader<Vec<u8>>> {
    match Reader::open_readfile(path) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "cannot open geo database");
            None
        }
    }
}

impl MaxMindGeo {
    /// Open both databases. A database that fails to open yields `Unknown` for its field.
    pub fn open(country_db: impl AsRef<Path>, city_db: impl AsRef<Path>) -> Self {
        Self {
            country_db: open_db(country_db.as_ref()),
            city_db: open_db(city_db.as_ref()),
        }
    }
}

impl GeoLookup for MaxMindGeo {
    fn country(&self, address: IpAddr) -> Result<Option<String>> {
        let db = self
            .country_db
            .as_ref()
            .ok_or_else(|| anyhow!("country database not loaded"))?;
        let rec: geoip2::Country = db.lookup(address)?;
        Ok(rec
            .country
            .and_then(|c| c.names)
            .and_then(|n| n.get("en").map(|s| s.to_string())))
    }

    fn city(&self, address: IpAddr) -> Result<Option<String>> {
        let db = self
            .city_db
            .as_ref()
            .ok_or_else(|| anyhow!("city database not loaded"))?;
        let rec: geoip2::City = db.lookup(address)?;
        Ok(rec
            .city
            .and_then(|c| c.names)
            .and_then(|n| n.get("en").map(|s| s.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct Partial;

    impl GeoLookup for Partial {
        fn country(&self, _: IpAddr) -> Result<Option<String>> {
            Err(anyhow!("boom"))
        }
        fn city(&self, _: IpAddr) -> Result<Option<String>> {
            Ok(Some("Lisbon".into()))
        }
    }

    struct Empty;

    impl GeoLookup for Empty {
        fn country(&self, _: IpAddr) -> Result<Option<String>> {
            Ok(Some("  ".into()))
        }
        fn city(&self, _: IpAddr) -> Result<Option<String>> {
            Ok(None)
        }
    }

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

    #[test]
    fn failed_country_does_not_block_city() {
        let g = lookup_geo(&Partial, ADDR);
        assert_eq!(g.country, "Unknown");
        assert_eq!(g.city, "Lisbon");
    }

    #[test]
    fn empty_names_become_unknown() {
        assert_eq!(lookup_geo(&Empty, ADDR), GeoInfo::default());
    }

    #[test]
    fn missing_databases_yield_unknown() {
        let geo = MaxMindGeo::open("/nonexistent/country.mmdb", "/nonexistent/city.mmdb");
        assert_eq!(lookup_geo(&geo, ADDR), GeoInfo::default());
    }
}
