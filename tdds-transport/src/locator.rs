//! Locators: wire endpoints identified by `(kind, address, port)`.
//!
//! IPv4 addresses are stored IPv6-mapped: twelve zero bytes followed by
//! the four address bytes, so one 16-byte field serves both families.

use bitflags::bitflags;
use smallvec::SmallVec;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Transport kind of a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocatorKind {
    UdpV4,
    UdpV6,
}

/// Address scope, narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    Node,
    Link,
    Site,
    Org,
    Global,
}

bitflags! {
    /// Traffic class and cast mode served by a locator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocatorFlags: u32 {
        const DATA  = 0x01;
        const META  = 0x02;
        const UCAST = 0x04;
        const MCAST = 0x08;
    }
}

/// One wire endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub kind: LocatorKind,
    pub address: [u8; 16],
    pub port: u16,
    pub scope_id: u32,
    pub scope: Scope,
    pub flags: LocatorFlags,
    /// Transport context handle; 0 when unbound.
    pub handle: u32,
}

impl Locator {
    pub fn udpv4(ip: [u8; 4], port: u16, scope: Scope, flags: LocatorFlags) -> Locator {
        let mut address = [0u8; 16];
        address[12..].copy_from_slice(&ip);
        Locator {
            kind: LocatorKind::UdpV4,
            address,
            port,
            scope_id: 0,
            scope,
            flags,
            handle: 0,
        }
    }

    pub fn udpv6(ip: [u8; 16], port: u16, scope_id: u32, scope: Scope, flags: LocatorFlags) -> Locator {
        Locator {
            kind: LocatorKind::UdpV6,
            address: ip,
            port,
            scope_id,
            scope,
            flags,
            handle: 0,
        }
    }

    /// The low four bytes as an IPv4 address.
    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.address[12],
            self.address[13],
            self.address[14],
            self.address[15],
        )
    }

    pub fn ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.address)
    }

    /// Whether the address is an IPv4 class-D / IPv6 ff00::/8 group.
    pub fn is_multicast_address(&self) -> bool {
        match self.kind {
            LocatorKind::UdpV4 => self.address[12] >= 224 && self.address[12] < 240,
            LocatorKind::UdpV6 => self.address[0] == 0xff,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self.kind {
            LocatorKind::UdpV4 => SocketAddr::V4(SocketAddrV4::new(self.ipv4(), self.port)),
            LocatorKind::UdpV6 => SocketAddr::V6(SocketAddrV6::new(
                self.ipv6(),
                self.port,
                0,
                self.scope_id,
            )),
        }
    }

    /// Identity without the flags/handle decorations.
    pub fn same_endpoint(&self, other: &Locator) -> bool {
        self.kind == other.kind && self.address == other.address && self.port == other.port
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LocatorKind::UdpV4 => write!(f, "{}:{}", self.ipv4(), self.port),
            LocatorKind::UdpV6 => write!(f, "[{}]:{}", self.ipv6(), self.port),
        }
    }
}

/// An ordered list of locators with endpoint-identity deduplication.
#[derive(Debug, Clone, Default)]
pub struct LocatorList {
    items: SmallVec<[Locator; 4]>,
}

impl LocatorList {
    pub fn new() -> LocatorList {
        LocatorList::default()
    }

    /// Append unless the same endpoint is already present. Returns
    /// whether the locator was added.
    pub fn add(&mut self, locator: Locator) -> bool {
        if self.items.iter().any(|l| l.same_endpoint(&locator)) {
            return false;
        }
        self.items.push(locator);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Locator> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[Locator] {
        &self.items
    }
}

impl FromIterator<Locator> for LocatorList {
    fn from_iter<T: IntoIterator<Item = Locator>>(iter: T) -> Self {
        let mut list = LocatorList::new();
        for l in iter {
            list.add(l);
        }
        list
    }
}
