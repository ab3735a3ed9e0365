//! Address-range helpers used by NAT classification

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Shared address space for carrier-grade NAT (RFC 6598): 100.64.0.0/10
const CGNAT_NETWORK: u32 = 0x6440_0000;
const CGNAT_MASK: u32 = 0xFFC0_0000;

/// Whether an address lies in the carrier-grade NAT range
///
/// ```
/// use natmapper::nat::is_cgnat;
///
/// assert!(is_cgnat("100.64.0.1".parse().unwrap()));
/// assert!(!is_cgnat("203.0.113.5".parse().unwrap()));
/// ```
pub fn is_cgnat(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) & CGNAT_MASK == CGNAT_NETWORK,
        IpAddr::V6(_) => false,
    }
}

/// Whether an address is private to a site (RFC 1918, loopback, link-local, ULA)
///
/// Carrier-grade NAT space is not included; see [`is_private_range`].
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || is_private_v6(&v6),
    }
}

/// Whether an address cannot be the public side of the last NAT hop
///
/// Includes carrier-grade NAT space, so a STUN-mapped address in
/// 100.64.0.0/10 is treated as another NAT layer.
pub fn is_private_range(ip: IpAddr) -> bool {
    let private = is_private_ip(ip) || is_cgnat(ip);
    if private {
        debug!("{} is in a private range", ip);
    }
    private
}

fn is_private_v4(v4: Ipv4Addr) -> bool {
    v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
}

fn is_private_v6(v6: &Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    // fc00::/7 unique local, fe80::/10 link-local
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}
