use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use tracing::warn;

use crate::types::Target;

/// Name -> address resolution.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Return every address the name resolves to, in resolver order.
    async fn resolve(&self, name: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
///
/// Hostnames resolve to their IPv4 (A record) addresses only; literal addresses of
/// either family are passed through.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, name: &str) -> io::Result<Vec<IpAddr>> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs = tokio::net::lookup_host((name, 0)).await?;
        Ok(ipv4_only(addrs.map(|sa| sa.ip())))
    }
}

fn ipv4_only(addrs: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    addrs.into_iter().filter(IpAddr::is_ipv4).collect()
}

/// Turn one resolved name into targets.
///
/// Addresses are deduplicated keeping resolver order; only the first is used unless
/// `all_addresses` is set. An empty address list is treated as a resolution failure (`None`).
pub fn expand_addresses(name: &str, addrs: Vec<IpAddr>, all_addresses: bool) -> Option<Vec<Target>> {
    let mut distinct: Vec<IpAddr> = Vec::with_capacity(addrs.len());
    for ip in addrs {
        if !distinct.contains(&ip) {
            distinct.push(ip);
        }
    }
    if distinct.is_empty() {
        return None;
    }
    if !all_addresses {
        distinct.truncate(1);
    }
    Some(
        distinct
            .into_iter()
            .map(|address| Target {
                name: name.to_string(),
                address,
            })
            .collect(),
    )
}

/// Resolve a single name. Failures are logged and reported as `None`; no retries.
pub async fn resolve_one(
    resolver: &dyn Resolver,
    name: &str,
    all_addresses: bool,
) -> Option<Vec<Target>> {
    match resolver.resolve(name).await {
        Ok(addrs) => {
            let expanded = expand_addresses(name, addrs, all_addresses);
            if expanded.is_none() {
                warn!(name, "no addresses returned, skipping");
            }
            expanded
        }
        Err(e) => {
            warn!(name, error = %e, "unable to resolve, skipping");
            None
        }
    }
}
