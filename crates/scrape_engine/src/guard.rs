//! SSRF containment: refuse targets that resolve into internal networks.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use engine_logging::{engine_debug, engine_warn};
use url::{Host, Url};

use crate::{FailureKind, FetchError};

#[async_trait::async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system via tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait::async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Fixed host table; unknown hosts fail to resolve.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, addrs: Vec<IpAddr>) -> Self {
        self.entries.insert(host.into().to_ascii_lowercase(), addrs);
        self
    }
}

#[async_trait::async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}")))
    }
}

/// A parsed target that passed the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VettedTarget {
    pub url: Url,
    /// Domain name when the host is not an IP literal.
    pub domain: Option<String>,
    /// Addresses the connection may use; empty when containment is off.
    pub addrs: Vec<IpAddr>,
}

#[derive(Clone)]
pub struct AddressGuard {
    enabled: bool,
    resolver: Arc<dyn HostResolver>,
    /// Domains exempt from the address blocklist. They are still resolved
    /// and pinned; IP literals and other hosts are never exempt.
    trusted: HashSet<String>,
}

impl AddressGuard {
    pub fn new(enabled: bool, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            enabled,
            resolver,
            trusted: HashSet::new(),
        }
    }

    pub fn with_trusted_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.trusted.extend(
            hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty()),
        );
        self
    }

    pub fn system(enabled: bool) -> Self {
        Self::new(enabled, Arc::new(SystemResolver))
    }

    pub fn disabled() -> Self {
        Self::system(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Parses and, when containment is on, resolves the target and rejects
    /// it if any resolved address is internal.
    pub async fn vet(&self, address: &str) -> Result<VettedTarget, FetchError> {
        let url = parse_target(address)?;
        self.vet_url(url).await
    }

    pub async fn vet_url(&self, url: Url) -> Result<VettedTarget, FetchError> {
        let host = url
            .host()
            .ok_or_else(|| FetchError::new(FailureKind::InvalidUrl, "missing host"))?
            .to_owned();
        let domain = match &host {
            Host::Domain(d) => Some(d.to_ascii_lowercase()),
            Host::Ipv4(_) | Host::Ipv6(_) => None,
        };

        if !self.enabled {
            return Ok(VettedTarget {
                url,
                domain,
                addrs: Vec::new(),
            });
        }

        let host_label = host.to_string();
        let mut trusted = false;
        let addrs = match &host {
            Host::Ipv4(ip) => vec![IpAddr::V4(*ip)],
            Host::Ipv6(ip) => vec![IpAddr::V6(*ip)],
            Host::Domain(d) => {
                let d = d.to_ascii_lowercase();
                trusted = self.trusted.contains(&d);
                if !trusted && (d == "localhost" || d.ends_with(".localhost")) {
                    return Err(blocked(&host_label, &d));
                }
                let port = url.port_or_known_default().unwrap_or(80);
                let addrs = self.resolver.resolve(&d, port).await.map_err(|err| {
                    FetchError::new(
                        FailureKind::Dns,
                        format!("DNS resolution failed for host '{d}': {err}"),
                    )
                })?;
                if addrs.is_empty() {
                    return Err(FetchError::new(
                        FailureKind::Dns,
                        format!("no addresses resolved for host '{d}'"),
                    ));
                }
                addrs
            }
        };

        if trusted {
            engine_debug!("Trusted host={} addrs={:?}", host_label, addrs);
        } else if let Some(bad) = addrs.iter().find(|ip| is_blocked_ip(**ip)) {
            engine_warn!("Blocked target host={} address={}", host_label, bad);
            return Err(blocked(&host_label, &bad.to_string()));
        } else {
            engine_debug!("Vetted host={} addrs={:?}", host_label, addrs);
        }

        Ok(VettedTarget { url, domain, addrs })
    }
}

impl std::fmt::Debug for AddressGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressGuard")
            .field("enabled", &self.enabled)
            .field("trusted", &self.trusted)
            .finish_non_exhaustive()
    }
}

fn blocked(host: &str, address: &str) -> FetchError {
    FetchError::new(
        FailureKind::BlockedAddress {
            host: host.to_string(),
            address: address.to_string(),
        },
        format!("blocked host '{host}' (resolves to private/internal address {address})"),
    )
}

/// Parses an already-substituted address and accepts only http(s) with a host.
pub fn parse_target(address: &str) -> Result<Url, FetchError> {
    let url = Url::parse(address.trim())
        .map_err(|err| FetchError::new(FailureKind::InvalidUrl, format!("{address}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::new(
            FailureKind::InvalidUrl,
            format!("only http/https URLs are allowed, got '{}'", url.scheme()),
        ));
    }
    if url.host().is_none() {
        return Err(FetchError::new(FailureKind::InvalidUrl, "missing host"));
    }
    Ok(url)
}

/// Loopback, private, link-local, multicast, documentation and other
/// non-public ranges. IPv6 forms that embed an IPv4 address are judged by it.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => match embedded_ipv4(v6) {
            Some(v4) => is_blocked_v4(v4),
            None => is_blocked_v6(v6),
        },
    }
}

/// IPv4 address carried by mapped, compatible, NAT64 and 6to4 addresses.
fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    let o = ip.octets();
    match ip.segments() {
        // ::ffff:a.b.c.d, ::a.b.c.d, 64:ff9b::a.b.c.d
        [0, 0, 0, 0, 0, 0xffff, _, _] | [0, 0, 0, 0, 0, 0, _, _] | [0x64, 0xff9b, 0, 0, 0, 0, _, _] => {
            Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
        }
        // 2002:aabb:ccdd::/48
        [0x2002, ..] => Some(Ipv4Addr::new(o[2], o[3], o[4], o[5])),
        _ => None,
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
        // 192.0.0.0/24 protocol assignments, 192.0.2.0/24 TEST-NET-1
        || (a == 192 && b == 0 && (c == 0 || c == 2))
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b == 18 || b == 19))
        // 198.51.100.0/24 TEST-NET-2, 203.0.113.0/24 TEST-NET-3
        || (a == 198 && b == 51 && c == 100)
        || (a == 203 && b == 0 && c == 113)
        // 240.0.0.0/4 reserved
        || a >= 240
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    let [first, second, third, ..] = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && second == 0x0db8)
        // 64:ff9b:1::/48 local-use NAT64
        || (first == 0x64 && second == 0xff9b && third == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_internal_ranges() {
        for ip in [
            "127.0.0.1",
            "10.0.0.5",
            "172.16.4.4",
            "192.168.1.1",
            "169.254.169.254",
            "224.0.0.1",
            "100.64.0.1",
            "0.0.0.0",
            "::1",
            "fd00::1",
            "fe80::1",
            "ff02::1",
            "::ffff:10.0.0.1",
            "192.0.0.8",
            "192.0.2.2",
            "198.18.0.1",
            "198.19.255.1",
            "198.51.100.7",
            "203.0.113.9",
            "2001:db8::1",
            "::127.0.0.1",
            "64:ff9b::7f00:1",
            "64:ff9b::a00:5",
            "64:ff9b:1::1",
            "2002:7f00:1::1",
        ] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }
        for ip in [
            "93.184.216.34",
            "8.8.8.8",
            "198.20.0.1",
            "2606:4700::1111",
            "::ffff:8.8.8.8",
            "64:ff9b::808:808",
            "2002:808:808::1",
        ] {
            assert!(!is_blocked_ip(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn parse_target_rejects_other_schemes() {
        assert_eq!(
            parse_target("ftp://example.com/x").unwrap_err().kind,
            FailureKind::InvalidUrl
        );
        assert!(parse_target("https://example.com/a?b=c").is_ok());
    }
}
