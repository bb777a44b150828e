//! Effective client IP resolution behind trusted proxies
//!
//! The rightmost `X-Forwarded-For` element is honoured only when the
//! immediate peer sits inside the configured trust ranges; otherwise the
//! peer address itself is used and the spoof attempt is logged.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

// IPv4 addresses compare in their IPv6-mapped form so one range type
// covers both families.
fn to_comparable(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Inclusive address ranges whose members may set `X-Forwarded-For`.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    bounds: Vec<(u128, u128)>,
}

impl TrustedProxies {
    pub fn from_networks(nets: &[IpNet]) -> Self {
        let bounds = nets
            .iter()
            .map(|net| (to_comparable(net.network()), to_comparable(net.broadcast())))
            .collect();
        Self { bounds }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let needle = to_comparable(ip);
        self.bounds.iter().any(|(lo, hi)| *lo <= needle && needle <= *hi)
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

pub struct ForwardedIpResolver {
    trusted: TrustedProxies,
    /// When off, forwarded headers are ignored entirely.
    honour_forwarded: bool,
}

impl ForwardedIpResolver {
    pub fn new(trusted: TrustedProxies, honour_forwarded: bool) -> Self {
        Self {
            trusted,
            honour_forwarded,
        }
    }

    /// Resolve the address the verdict applies to.
    pub fn effective_ip(&self, peer: IpAddr, x_forwarded_for: Option<&str>) -> IpAddr {
        if !self.honour_forwarded {
            return peer;
        }

        let header = match x_forwarded_for {
            Some(h) if !h.trim().is_empty() => h,
            _ => return peer,
        };

        let candidate = match header
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .last()
        {
            Some(c) => c,
            None => return peer,
        };

        let forwarded: IpAddr = match candidate.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(peer = %peer, header = candidate, "unparsable X-Forwarded-For element");
                return peer;
            }
        };

        if self.trusted.contains(peer) {
            forwarded
        } else {
            warn!(
                event = "NON_AUTHORIZED_X_FORWARDED_FOR_USAGE",
                peer = %peer,
                forwarded = %forwarded,
                "ignoring X-Forwarded-For from untrusted peer"
            );
            peer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ForwardedIpResolver {
        let trusted =
            TrustedProxies::from_networks(&["10.0.0.0/8".parse().unwrap()]);
        ForwardedIpResolver::new(trusted, true)
    }

    #[test]
    fn test_trusted_peer_yields_forwarded_ip() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let ip = resolver().effective_ip(peer, Some("203.0.113.5, 10.0.0.1"));
        assert_eq!(ip.to_string(), "203.0.113.5");
    }

    #[test]
    fn test_untrusted_peer_keeps_peer_ip() {
        let peer: IpAddr = "198.51.100.7".parse().unwrap();
        let ip = resolver().effective_ip(peer, Some("203.0.113.5"));
        assert_eq!(ip, peer);
    }

    #[test]
    fn test_rightmost_element_is_used() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let ip = resolver().effective_ip(peer, Some("1.1.1.1, 2.2.2.2, 3.3.3.3"));
        assert_eq!(ip.to_string(), "3.3.3.3");
    }

    #[test]
    fn test_empty_or_missing_header_keeps_peer() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(resolver().effective_ip(peer, None), peer);
        assert_eq!(resolver().effective_ip(peer, Some("   ")), peer);
        assert_eq!(resolver().effective_ip(peer, Some(", ,")), peer);
    }

    #[test]
    fn test_garbage_element_keeps_peer() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(resolver().effective_ip(peer, Some("not-an-ip")), peer);
    }

    #[test]
    fn test_disabled_short_circuits() {
        let trusted = TrustedProxies::from_networks(&["10.0.0.0/8".parse().unwrap()]);
        let resolver = ForwardedIpResolver::new(trusted, false);
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(resolver.effective_ip(peer, Some("203.0.113.5")), peer);
    }

    #[test]
    fn test_ipv4_mapped_comparison() {
        let trusted = TrustedProxies::from_networks(&["10.0.0.0/8".parse().unwrap()]);
        let mapped: IpAddr = "::ffff:10.1.2.3".parse().unwrap();
        assert!(trusted.contains(mapped));
    }
}
