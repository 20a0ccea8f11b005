//! Local interface table and multicast source filters.
//!
//! Own addresses are discovered through `getifaddrs(3)` and classified
//! by scope; the scope gates which addresses produce locators, and the
//! configured source filter gates which interfaces join multicast
//! groups per domain.

use crate::locator::{LocatorKind, Scope};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::warn;

/// One local address usable as a locator source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnAddress {
    pub kind: LocatorKind,
    pub address: [u8; 16],
    pub scope_id: u32,
    pub scope: Scope,
}

impl OwnAddress {
    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.address[12],
            self.address[13],
            self.address[14],
            self.address[15],
        )
    }
}

/// Scope of an IPv4 address.
pub fn classify_ipv4(a: [u8; 4]) -> Scope {
    if a[0] == 127 {
        Scope::Node
    } else if a[0] == 169 && a[1] == 254 {
        Scope::Link
    } else if a[0] == 10
        || (a[0] == 172 && (a[1] & 0xf0) == 16)
        || (a[0] == 192 && a[1] == 168)
    {
        Scope::Site
    } else {
        Scope::Global
    }
}

/// Scope of an IPv6 address.
pub fn classify_ipv6(a: &[u8; 16]) -> Scope {
    let ip = Ipv6Addr::from(*a);
    if ip.is_loopback() {
        Scope::Node
    } else if a[0] == 0xfe && (a[1] & 0xc0) == 0x80 {
        Scope::Link
    } else if (a[0] & 0xfe) == 0xfc {
        Scope::Site
    } else {
        Scope::Global
    }
}

/// Enumerate the local addresses of one family.
pub fn own_addresses(kind: LocatorKind) -> Vec<OwnAddress> {
    let mut result = Vec::new();
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills ifap with a list we walk read-only and
    // release with freeifaddrs before returning.
    unsafe {
        if libc::getifaddrs(&mut ifap) != 0 {
            warn!("getifaddrs() failed");
            return result;
        }
        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = &*cur;
            cur = ifa.ifa_next;
            if ifa.ifa_addr.is_null() || (ifa.ifa_flags & libc::IFF_UP as u32) == 0 {
                continue;
            }
            let family = (*ifa.ifa_addr).sa_family as i32;
            match (kind, family) {
                (LocatorKind::UdpV4, libc::AF_INET) => {
                    let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    let raw = sin.sin_addr.s_addr.to_ne_bytes();
                    let mut address = [0u8; 16];
                    address[12..].copy_from_slice(&raw);
                    result.push(OwnAddress {
                        kind,
                        address,
                        scope_id: 0,
                        scope: classify_ipv4(raw),
                    });
                }
                (LocatorKind::UdpV6, libc::AF_INET6) => {
                    let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                    let address = sin6.sin6_addr.s6_addr;
                    result.push(OwnAddress {
                        kind,
                        address,
                        scope_id: sin6.sin6_scope_id,
                        scope: classify_ipv6(&address),
                    });
                }
                _ => {}
            }
        }
        libc::freeifaddrs(ifap);
    }
    result
}

/// One source-filter entry: an IPv4 prefix, optionally bound to one
/// domain.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterEntry {
    addr: [u8; 4],
    prefix_len: u8,
    domain: Option<u32>,
}

/// Multicast source-selection filter.
///
/// Text form: entries separated by `;` or `,`, each
/// `[domain:]a.b.c.d[/prefix]`. An address matches when any entry
/// covers it and the entry's domain (if present) equals the queried
/// domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpFilter {
    entries: Vec<FilterEntry>,
}

impl IpFilter {
    pub fn parse(spec: &str) -> Option<IpFilter> {
        let mut entries = Vec::new();
        for part in spec.split([';', ',']) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (domain, rest) = match part.split_once(':') {
                Some((d, rest)) => match d.parse::<u32>() {
                    Ok(d) => (Some(d), rest),
                    Err(_) => {
                        warn!(entry = part, "bad domain in multicast source filter");
                        return None;
                    }
                },
                None => (None, part),
            };
            let (addr_str, prefix_len) = match rest.split_once('/') {
                Some((a, p)) => (a, p.parse::<u8>().ok()?),
                None => (rest, 32),
            };
            let addr: Ipv4Addr = addr_str.parse().ok()?;
            if prefix_len > 32 {
                return None;
            }
            entries.push(FilterEntry {
                addr: addr.octets(),
                prefix_len,
                domain,
            });
        }
        Some(IpFilter { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `addr` may act as a multicast source in `domain`.
    pub fn matches(&self, domain: u32, addr: [u8; 4]) -> bool {
        self.entries.iter().any(|e| {
            if let Some(d) = e.domain {
                if d != domain {
                    return false;
                }
            }
            let bits = e.prefix_len as u32;
            if bits == 0 {
                return true;
            }
            let a = u32::from_be_bytes(addr);
            let b = u32::from_be_bytes(e.addr);
            let mask = u32::MAX << (32 - bits);
            (a & mask) == (b & mask)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case([127, 0, 0, 1], Scope::Node; "loopback")]
    #[test_case([169, 254, 3, 4], Scope::Link; "link local")]
    #[test_case([10, 1, 2, 3], Scope::Site; "rfc1918 ten")]
    #[test_case([172, 20, 0, 1], Scope::Site; "rfc1918 one seventy two")]
    #[test_case([192, 168, 0, 9], Scope::Site; "rfc1918 one ninety two")]
    #[test_case([8, 8, 8, 8], Scope::Global; "public")]
    fn ipv4_scopes(addr: [u8; 4], scope: Scope) {
        assert_eq!(classify_ipv4(addr), scope);
    }

    #[test]
    fn ipv6_scopes() {
        let mut link = [0u8; 16];
        link[0] = 0xfe;
        link[1] = 0x80;
        assert_eq!(classify_ipv6(&link), Scope::Link);

        let mut ula = [0u8; 16];
        ula[0] = 0xfd;
        assert_eq!(classify_ipv6(&ula), Scope::Site);

        let mut lo = [0u8; 16];
        lo[15] = 1;
        assert_eq!(classify_ipv6(&lo), Scope::Node);
    }

    #[test]
    fn own_addresses_reports_loopback() {
        let addrs = own_addresses(LocatorKind::UdpV4);
        // Every test host has at least the loopback interface up.
        assert!(addrs.iter().any(|a| a.scope == Scope::Node));
    }

    #[test]
    fn filter_prefix_matching() {
        let f = IpFilter::parse("192.168.0.0/16;10.0.0.1").unwrap();
        assert!(f.matches(0, [192, 168, 5, 5]));
        assert!(f.matches(9, [10, 0, 0, 1]));
        assert!(!f.matches(0, [10, 0, 0, 2]));
    }

    #[test]
    fn filter_domain_binding() {
        let f = IpFilter::parse("7:172.16.0.0/12").unwrap();
        assert!(f.matches(7, [172, 17, 0, 1]));
        assert!(!f.matches(8, [172, 17, 0, 1]));
    }

    #[test]
    fn filter_rejects_garbage() {
        assert!(IpFilter::parse("not-an-address").is_none());
        assert!(IpFilter::parse("10.0.0.0/40").is_none());
    }
}
