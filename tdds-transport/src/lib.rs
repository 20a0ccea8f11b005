// tdds-transport: locators and the UDP/IPv4+IPv6 transport
//
// Derives per-domain, per-participant locators from the configured
// port mapping, manages multicast membership across local interfaces,
// and provides the scatter-gather send path and receive demux serviced
// by the kernel's socket set.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod intf;
pub mod locator;
pub mod udp;

pub use intf::{classify_ipv4, classify_ipv6, own_addresses, IpFilter, OwnAddress};
pub use locator::{Locator, LocatorFlags, LocatorKind, LocatorList, Scope};
pub use udp::{
    ChunkedMessage, LocatorClass, ReceiveFn, TransportStats, UdpConfig, UdpParameters,
    UdpTransport,
};
