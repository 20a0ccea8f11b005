//! UDP transport: per-domain locator derivation, multicast group
//! management and the send/receive paths.
//!
//! Ports derive from the configured parameter set as
//! `pb + dg*domain + pg*participant + dN`. Every served locator gets
//! its own bound socket registered in the socket set; multicast
//! locators join their group once per eligible local interface. The
//! send path fans a scatter-gather datagram out to every destination,
//! replicated per source-multicast interface when more than one
//! qualifies. Send errors are logged and counted, never propagated.

use crate::intf::{own_addresses, IpFilter, OwnAddress};
use crate::locator::{Locator, LocatorFlags, LocatorKind, LocatorList, Scope};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tdds_kernel::error::{DdsError, Result};
use tdds_kernel::sock::{set_nonblocking, PollEvents, SocketCallback, SocketSet};
use tracing::{debug, info, warn};

/// Maximum scatter-gather elements per datagram.
const MAX_IOVEC: usize = 32;

/// Receive buffer size; RTPS reassembles anything larger.
const RX_BUF_SIZE: usize = 65536;

/// Port mapping parameters of one locator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpParameters {
    pub pb: u32,
    pub dg: u32,
    pub pg: u32,
    pub d0: u32,
    pub d1: u32,
    pub d2: u32,
    pub d3: u32,
}

impl Default for UdpParameters {
    fn default() -> Self {
        UdpParameters {
            pb: 7400,
            dg: 250,
            pg: 2,
            d0: 0,
            d1: 10,
            d2: 1,
            d3: 11,
        }
    }
}

impl UdpParameters {
    pub fn validate(&self) -> Result<()> {
        if self.pb == 0
            || self.pb > 0xff00
            || self.dg == 0
            || self.dg > 0x8000
            || self.pg == 0
            || self.pg > 0x8000
            || self.d0 > 0x8000
            || self.d1 > 0x8000
            || self.d2 > 0x8000
            || self.d3 > 0x8000
        {
            return Err(DdsError::bad_parameter("UDP port parameters out of range"));
        }
        Ok(())
    }

    pub fn meta_multicast_port(&self, domain: u32) -> u32 {
        self.pb + self.dg * domain + self.d0
    }

    pub fn meta_unicast_port(&self, domain: u32, participant: u32) -> u32 {
        self.pb + self.dg * domain + self.pg * participant + self.d1
    }

    pub fn user_multicast_port(&self, domain: u32) -> u32 {
        self.pb + self.dg * domain + self.d2
    }

    pub fn user_unicast_port(&self, domain: u32, participant: u32) -> u32 {
        self.pb + self.dg * domain + self.pg * participant + self.d3
    }
}

/// Locator class requested from the derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorClass {
    /// User data traffic.
    User,
    /// Discovery (meta) traffic.
    Meta,
}

/// Transport configuration resolved by the factory.
#[derive(Debug, Clone, Default)]
pub struct UdpConfig {
    pub pars_v4: UdpParameters,
    pub pars_v6: UdpParameters,
    /// Multicast TTL override (1..=255).
    pub mcast_ttl: Option<u32>,
    /// Egress interface override for multicast sends.
    pub mcast_dest: Option<Ipv4Addr>,
    /// Multicast group override, v4.
    pub mcast_addr_v4: Option<Ipv4Addr>,
    /// Multicast group override, v6.
    pub mcast_addr_v6: Option<[u8; 16]>,
    /// Hop limit override, v6.
    pub mcast_hops_v6: Option<u32>,
    /// Egress interface index override, v6.
    pub mcast_intf_v6: Option<u32>,
    /// Source-selection filter gating multicast membership.
    pub mcast_src: Option<IpFilter>,
    /// Interface filter gating locator generation.
    pub intf_filter: Option<IpFilter>,
    /// Disable blocking on missing multicast routes.
    pub no_mcast: bool,
}

impl UdpConfig {
    fn default_group_v4(&self) -> [u8; 4] {
        self.mcast_addr_v4
            .map(|a| a.octets())
            .unwrap_or([239, 255, 0, 1])
    }

    fn default_group_v6(&self) -> [u8; 16] {
        self.mcast_addr_v6.unwrap_or({
            let mut a = [0u8; 16];
            a[0] = 0xff;
            a[1] = 0x03;
            a[15] = 0x80;
            a
        })
    }
}

/// Per-context traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub packets_rcvd: u64,
    pub octets_rcvd: u64,
}

/// A scatter-gather message: header chunk plus element chunks, sent as
/// one datagram.
#[derive(Debug, Clone, Default)]
pub struct ChunkedMessage {
    pub chunks: SmallVec<[Vec<u8>; 4]>,
}

impl ChunkedMessage {
    pub fn total_len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

/// Receive hook: `(context handle, destination locator, payload,
/// source address)`.
pub type ReceiveFn =
    Arc<dyn Fn(u32, &Locator, &[u8], std::net::SocketAddr) + Send + Sync>;

struct IpContext {
    handle: u32,
    locator: Locator,
    users: u32,
    fd: RawFd,
    src_mcast: bool,
    join_pending: bool,
    stats: TransportStats,
}

struct TransportInner {
    contexts: FxHashMap<u32, IpContext>,
    by_fd: FxHashMap<RawFd, u32>,
    next_handle: u32,
    send_v4: Option<RawFd>,
    send_v6: Option<RawFd>,
    own_v4: Vec<OwnAddress>,
    own_v6: Vec<OwnAddress>,
    max_src_mc_v4: u32,
    max_src_mc_v6: u32,
    wait_mc_if: bool,
}

/// The UDP transport for one runtime.
pub struct UdpTransport {
    cfg: UdpConfig,
    socks: Arc<SocketSet>,
    inner: Mutex<TransportInner>,
    rx: RwLock<Option<ReceiveFn>>,
}

fn close_fd(fd: RawFd) {
    // SAFETY: closing a descriptor this module opened.
    unsafe { libc::close(fd) };
}

fn sockaddr_v4(ip: [u8; 4], port: u16) -> libc::sockaddr_in {
    // SAFETY: zeroed sockaddr_in is a valid initial value.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(ip);
    sa
}

fn sockaddr_v6(ip: [u8; 16], port: u16, scope_id: u32) -> libc::sockaddr_in6 {
    let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_port = port.to_be();
    sa.sin6_addr.s6_addr = ip;
    sa.sin6_scope_id = scope_id;
    sa
}

fn new_socket(kind: LocatorKind) -> Result<RawFd> {
    let family = match kind {
        LocatorKind::UdpV4 => libc::AF_INET,
        LocatorKind::UdpV6 => libc::AF_INET6,
    };
    // SAFETY: plain socket creation; the descriptor is owned by the
    // caller from here on.
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, libc::IPPROTO_UDP) };
    if fd < 0 {
        return Err(DdsError::already_deleted("socket() failed"));
    }
    Ok(fd)
}

fn set_sockopt_i32(fd: RawFd, level: i32, name: i32, value: i32) -> bool {
    // SAFETY: value points at a live i32 for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    rc == 0
}

fn join_v4(fd: RawFd, group: [u8; 4], interface: [u8; 4]) -> std::io::Result<()> {
    let mreq = libc::ip_mreq {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(group),
        },
        imr_interface: libc::in_addr {
            s_addr: u32::from_ne_bytes(interface),
        },
    };
    // SAFETY: mreq is a live ip_mreq for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_ADD_MEMBERSHIP,
            &mreq as *const libc::ip_mreq as *const libc::c_void,
            std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn join_v6(fd: RawFd, group: [u8; 16], interface: u32) -> std::io::Result<()> {
    let mreq = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr { s6_addr: group },
        ipv6mr_interface: interface,
    };
    // SAFETY: mreq is a live ipv6_mreq for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_ADD_MEMBERSHIP,
            &mreq as *const libc::ipv6_mreq as *const libc::c_void,
            std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

impl UdpTransport {
    /// Create the transport and its per-kind sender sockets.
    pub fn new(cfg: UdpConfig, socks: Arc<SocketSet>, ipv6: bool) -> Result<Arc<UdpTransport>> {
        cfg.pars_v4.validate()?;
        if ipv6 {
            cfg.pars_v6.validate()?;
        }

        let send_v4 = new_socket(LocatorKind::UdpV4)?;
        if let Some(ttl) = cfg.mcast_ttl {
            if (1..=255).contains(&ttl) {
                if !set_sockopt_i32(send_v4, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl as i32)
                {
                    warn!("setsockopt(IP_MULTICAST_TTL) failed");
                } else {
                    info!(ttl, "multicast TTL override");
                }
            }
        }
        if let Some(dest) = cfg.mcast_dest {
            let addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(dest.octets()),
            };
            // SAFETY: addr is live for the duration of the call.
            let rc = unsafe {
                libc::setsockopt(
                    send_v4,
                    libc::IPPROTO_IP,
                    libc::IP_MULTICAST_IF,
                    &addr as *const libc::in_addr as *const libc::c_void,
                    std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                warn!("setsockopt(IP_MULTICAST_IF) failed");
            }
        }

        let send_v6 = if ipv6 {
            let fd = new_socket(LocatorKind::UdpV6)?;
            if let Some(hops) = cfg.mcast_hops_v6 {
                if !set_sockopt_i32(
                    fd,
                    libc::IPPROTO_IPV6,
                    libc::IPV6_MULTICAST_HOPS,
                    hops as i32,
                ) {
                    warn!("setsockopt(IPV6_MULTICAST_HOPS) failed");
                }
            }
            if let Some(intf) = cfg.mcast_intf_v6 {
                if !set_sockopt_i32(
                    fd,
                    libc::IPPROTO_IPV6,
                    libc::IPV6_MULTICAST_IF,
                    intf as i32,
                ) {
                    warn!("setsockopt(IPV6_MULTICAST_IF) failed");
                }
            }
            Some(fd)
        } else {
            None
        };

        Ok(Arc::new(UdpTransport {
            inner: Mutex::new(TransportInner {
                contexts: FxHashMap::default(),
                by_fd: FxHashMap::default(),
                next_handle: 1,
                send_v4: Some(send_v4),
                send_v6,
                own_v4: own_addresses(LocatorKind::UdpV4),
                own_v6: if ipv6 {
                    own_addresses(LocatorKind::UdpV6)
                } else {
                    Vec::new()
                },
                max_src_mc_v4: 0,
                max_src_mc_v6: 0,
                wait_mc_if: false,
            }),
            cfg,
            socks,
            rx: RwLock::new(None),
        }))
    }

    /// Register the function invoked for every received datagram.
    pub fn set_receiver(&self, rx: ReceiveFn) {
        *self.rx.write() = Some(rx);
    }

    pub fn parameters(&self, kind: LocatorKind) -> UdpParameters {
        match kind {
            LocatorKind::UdpV4 => self.cfg.pars_v4,
            LocatorKind::UdpV6 => self.cfg.pars_v6,
        }
    }

    fn add_port(
        list: &mut LocatorList,
        kind: LocatorKind,
        own: Option<&OwnAddress>,
        group: Option<[u8; 16]>,
        port: u32,
        scope: Scope,
        flags: LocatorFlags,
    ) {
        if port >= 0xffff {
            warn!(port, "can't create locator for selected domain/participant parameters");
            return;
        }
        let locator = match (own, group) {
            (Some(a), None) => match kind {
                LocatorKind::UdpV4 => {
                    let mut ip = [0u8; 4];
                    ip.copy_from_slice(&a.address[12..]);
                    Locator::udpv4(ip, port as u16, scope, flags)
                }
                LocatorKind::UdpV6 => {
                    Locator::udpv6(a.address, port as u16, a.scope_id, scope, flags)
                }
            },
            (None, Some(g)) => match kind {
                LocatorKind::UdpV4 => {
                    let mut ip = [0u8; 4];
                    ip.copy_from_slice(&g[12..]);
                    Locator::udpv4(ip, port as u16, scope, flags)
                }
                LocatorKind::UdpV6 => Locator::udpv6(g, port as u16, 0, scope, flags),
            },
            _ => return,
        };
        list.add(locator);
    }

    /// Derive the unicast/multicast locators of a `(domain,
    /// participant)` pair for one kind and traffic class. `dst`
    /// additionally receives the meta multicast destination used to
    /// bootstrap discovery.
    pub fn locators_get(
        &self,
        domain: u32,
        participant: u32,
        kind: LocatorKind,
        class: LocatorClass,
        uc: &mut LocatorList,
        mc: &mut LocatorList,
        dst: Option<&mut LocatorList>,
    ) {
        let pars = self.parameters(kind);
        let inner = self.inner.lock();
        let own = match kind {
            LocatorKind::UdpV4 => &inner.own_v4,
            LocatorKind::UdpV6 => &inner.own_v6,
        };
        let group = match kind {
            LocatorKind::UdpV4 => {
                let mut g = [0u8; 16];
                g[12..].copy_from_slice(&self.cfg.default_group_v4());
                g
            }
            LocatorKind::UdpV6 => self.cfg.default_group_v6(),
        };

        let (uc_port, mc_port, uc_flags, mc_flags) = match class {
            LocatorClass::User => (
                pars.user_unicast_port(domain, participant),
                pars.user_multicast_port(domain),
                LocatorFlags::DATA | LocatorFlags::UCAST,
                LocatorFlags::DATA | LocatorFlags::MCAST,
            ),
            LocatorClass::Meta => (
                pars.meta_unicast_port(domain, participant),
                pars.meta_multicast_port(domain),
                LocatorFlags::META | LocatorFlags::UCAST,
                LocatorFlags::META | LocatorFlags::MCAST,
            ),
        };

        for a in own {
            if let (Some(f), LocatorKind::UdpV4) = (&self.cfg.intf_filter, kind) {
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&a.address[12..]);
                if !f.matches(domain, ip) {
                    continue;
                }
            }
            Self::add_port(uc, kind, Some(a), None, uc_port, a.scope, uc_flags);
        }
        Self::add_port(mc, kind, None, Some(group), mc_port, Scope::Org, mc_flags);
        if class == LocatorClass::Meta {
            if let Some(dst) = dst {
                Self::add_port(
                    dst,
                    kind,
                    None,
                    Some(group),
                    pars.meta_multicast_port(domain),
                    Scope::Org,
                    mc_flags,
                );
            }
        }
    }

    /// Serve a locator: create and bind its socket, join multicast
    /// groups, and register for reception. Returns the context handle.
    pub fn add_locator(
        self: &Arc<Self>,
        domain: u32,
        locator: &Locator,
        serve: bool,
    ) -> Result<u32> {
        if !serve {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        if inner
            .contexts
            .values()
            .any(|c| c.locator.same_endpoint(locator))
        {
            debug!(%locator, "add_locator: already exists");
            return Err(DdsError::precondition("locator already served"));
        }

        let fd = new_socket(locator.kind)?;
        let is_mcast = locator.is_multicast_address();
        let mut src_mcast = false;

        if is_mcast {
            // Allow multiple binds per host.
            if !set_sockopt_i32(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
                warn!(%locator, "setsockopt(SO_REUSEADDR) failed");
            }
        } else if locator.kind == LocatorKind::UdpV4 {
            // Unicast source address: decide multicast-source duty.
            let mut ip = [0u8; 4];
            ip.copy_from_slice(&locator.address[12..]);
            let allowed = match &self.cfg.mcast_src {
                Some(f) => f.matches(domain, ip),
                None => true,
            };
            if allowed {
                src_mcast = match self.cfg.mcast_dest {
                    Some(dest) => dest.octets() == ip,
                    None => true,
                };
                if locator.flags.contains(LocatorFlags::DATA) {
                    inner.max_src_mc_v4 += 1;
                }
                if src_mcast {
                    let addr = libc::in_addr {
                        s_addr: u32::from_ne_bytes(ip),
                    };
                    // SAFETY: addr is live for the duration of the call.
                    let rc = unsafe {
                        libc::setsockopt(
                            fd,
                            libc::IPPROTO_IP,
                            libc::IP_MULTICAST_IF,
                            &addr as *const libc::in_addr as *const libc::c_void,
                            std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
                        )
                    };
                    if rc != 0 {
                        warn!(%locator, "setsockopt(IP_MULTICAST_IF) failed");
                    }
                    if let Some(ttl) = self.cfg.mcast_ttl {
                        set_sockopt_i32(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl as i32);
                    }
                    // Join every multicast group of the same class on
                    // this interface.
                    let flags = (locator.flags & (LocatorFlags::DATA | LocatorFlags::META))
                        | LocatorFlags::MCAST;
                    for c in inner.contexts.values() {
                        if c.locator.kind == LocatorKind::UdpV4
                            && c.locator.flags.contains(flags)
                        {
                            let mut group = [0u8; 4];
                            group.copy_from_slice(&c.locator.address[12..]);
                            debug!(group = %c.locator, intf = %locator, "IP_ADD_MEMBERSHIP");
                            if let Err(e) = join_v4(fd, group, ip) {
                                debug!(%locator, error = %e, "late group join failed");
                            }
                        }
                    }
                }
            }
        } else {
            src_mcast = true;
            if locator.flags.contains(LocatorFlags::DATA) {
                inner.max_src_mc_v6 += 1;
            }
        }

        // Bind to the locator address.
        let rc = match locator.kind {
            LocatorKind::UdpV4 => {
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&locator.address[12..]);
                let sa = sockaddr_v4(ip, locator.port);
                // SAFETY: sa is a live sockaddr_in for the call.
                unsafe {
                    libc::bind(
                        fd,
                        &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            LocatorKind::UdpV6 => {
                let sa = sockaddr_v6(locator.address, locator.port, locator.scope_id);
                // SAFETY: sa is a live sockaddr_in6 for the call.
                unsafe {
                    libc::bind(
                        fd,
                        &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
            }
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            close_fd(fd);
            return if err.raw_os_error() == Some(libc::EADDRINUSE) {
                Err(DdsError::precondition("address in use"))
            } else {
                warn!(%locator, error = %err, "bind failed");
                Err(DdsError::out_of_resources("bind failed"))
            };
        }

        // Multicast locator: join the group once per eligible source
        // interface.
        let mut join_pending = false;
        if is_mcast {
            match locator.kind {
                LocatorKind::UdpV4 => {
                    let mut group = [0u8; 4];
                    group.copy_from_slice(&locator.address[12..]);
                    let interfaces: Vec<[u8; 4]> = if let Some(dest) = self.cfg.mcast_dest {
                        vec![dest.octets()]
                    } else {
                        let flags = (locator.flags & (LocatorFlags::DATA | LocatorFlags::META))
                            | LocatorFlags::UCAST;
                        let mut v: Vec<[u8; 4]> = inner
                            .contexts
                            .values()
                            .filter(|c| {
                                c.src_mcast
                                    && c.locator.kind == LocatorKind::UdpV4
                                    && c.locator.flags.contains(flags)
                            })
                            .map(|c| {
                                let mut ip = [0u8; 4];
                                ip.copy_from_slice(&c.locator.address[12..]);
                                ip
                            })
                            .collect();
                        if v.is_empty() {
                            v.push([0, 0, 0, 0]); // INADDR_ANY
                        }
                        v
                    };
                    for intf in interfaces {
                        debug!(%locator, ?intf, "IP_ADD_MEMBERSHIP");
                        if let Err(e) = join_v4(fd, group, intf) {
                            if e.raw_os_error() == Some(libc::ENODEV) && !self.cfg.no_mcast {
                                // No route yet; retried on dynamic-IP
                                // notifications.
                                warn!("no multicast route available - waiting for a route");
                                inner.wait_mc_if = true;
                                join_pending = true;
                            } else {
                                warn!(%locator, error = %e, "IP_ADD_MEMBERSHIP failed");
                                close_fd(fd);
                                return Err(DdsError::out_of_resources(
                                    "multicast join failed",
                                ));
                            }
                        }
                    }
                }
                LocatorKind::UdpV6 => {
                    if let Err(e) = join_v6(fd, locator.address, locator.scope_id) {
                        if e.raw_os_error() == Some(libc::ENODEV) && !self.cfg.no_mcast {
                            warn!("no multicast route available - waiting for a route");
                            inner.wait_mc_if = true;
                            join_pending = true;
                        } else {
                            warn!(%locator, error = %e, "IPV6_JOIN_GROUP failed");
                            close_fd(fd);
                            return Err(DdsError::out_of_resources("multicast join failed"));
                        }
                    }
                }
            }
        }

        set_nonblocking(fd)?;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        let mut served = *locator;
        served.handle = handle;
        inner.contexts.insert(
            handle,
            IpContext {
                handle,
                locator: served,
                users: 1,
                fd,
                src_mcast,
                join_pending,
                stats: TransportStats::default(),
            },
        );
        inner.by_fd.insert(fd, handle);
        drop(inner);

        info!(%locator, fd, handle, "UDP: serving locator");
        let me = Arc::downgrade(self);
        let cb: SocketCallback = Arc::new(move |fd, _events, user| {
            if let Some(t) = me.upgrade() {
                t.receive(fd, user as u32);
            }
        });
        self.socks.add(
            fd,
            PollEvents::IN | PollEvents::PRI | PollEvents::HUP | PollEvents::NVAL,
            cb,
            handle as usize,
            "DDS.UDP",
        )?;
        Ok(handle)
    }

    /// Release one user of a served locator; the last user closes the
    /// socket.
    pub fn remove_locator(&self, handle: u32) {
        let mut inner = self.inner.lock();
        let Some(ctx) = inner.contexts.get_mut(&handle) else {
            return;
        };
        ctx.users -= 1;
        if ctx.users > 0 {
            return;
        }
        let fd = ctx.fd;
        if ctx.src_mcast
            && ctx.locator.kind == LocatorKind::UdpV4
            && ctx.locator.flags.contains(LocatorFlags::DATA)
            && !ctx.locator.is_multicast_address()
        {
            inner.max_src_mc_v4 = inner.max_src_mc_v4.saturating_sub(1);
        }
        inner.contexts.remove(&handle);
        inner.by_fd.remove(&fd);
        drop(inner);
        self.socks.remove(fd);
        close_fd(fd);
    }

    /// Add a reference to an already-served locator.
    pub fn reference_locator(&self, handle: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.contexts.get_mut(&handle) {
            Some(ctx) => {
                ctx.users += 1;
                Ok(())
            }
            None => Err(DdsError::bad_parameter("unknown locator handle")),
        }
    }

    pub fn context_stats(&self, handle: u32) -> Option<TransportStats> {
        self.inner.lock().contexts.get(&handle).map(|c| c.stats)
    }

    pub fn served_count(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    fn receive(&self, fd: RawFd, handle: u32) {
        let mut buf = vec![0u8; RX_BUF_SIZE];
        loop {
            let mut src: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut srclen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: buf and src outlive the call; lengths match.
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    0,
                    &mut src as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut srclen,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EAGAIN)
                    && err.raw_os_error() != Some(libc::EWOULDBLOCK)
                {
                    warn!(fd, error = %err, "recvfrom failed");
                }
                return;
            }
            let n = n as usize;
            let (locator, rx) = {
                let mut inner = self.inner.lock();
                let Some(ctx) = inner.contexts.get_mut(&handle) else {
                    return;
                };
                ctx.stats.packets_rcvd += 1;
                ctx.stats.octets_rcvd += n as u64;
                (ctx.locator, self.rx.read().clone())
            };
            if let Some(rx) = rx {
                let from = sockaddr_to_std(&src);
                rx(handle, &locator, &buf[..n], from);
            }
        }
    }

    /// Send each message to `first` and every further destination in
    /// `rest`. Multicast destinations replicate per source interface
    /// when more than one qualifies. Errors are logged and counted,
    /// never returned.
    pub fn send(&self, _id: u32, first: &Locator, rest: &[Locator], msgs: &[ChunkedMessage]) {
        for msg in msgs {
            if msg.chunks.len() > MAX_IOVEC {
                warn!(
                    chunks = msg.chunks.len(),
                    "too many elements in message, dropped"
                );
                continue;
            }
            let mut iov: SmallVec<[libc::iovec; 8]> = msg
                .chunks
                .iter()
                .map(|c| libc::iovec {
                    iov_base: c.as_ptr() as *mut libc::c_void,
                    iov_len: c.len(),
                })
                .collect();

            self.send_one(first, &mut iov, msg.total_len());
            for lp in rest {
                self.send_one(lp, &mut iov, msg.total_len());
            }
        }
    }

    fn send_one(&self, dst: &Locator, iov: &mut [libc::iovec], len: usize) {
        let mut inner = self.inner.lock();
        let default_fd = match dst.kind {
            LocatorKind::UdpV4 => inner.send_v4,
            LocatorKind::UdpV6 => inner.send_v6,
        };
        let Some(default_fd) = default_fd else {
            return;
        };

        let mut sources: SmallVec<[RawFd; 4]> = SmallVec::new();
        if dst.flags.contains(LocatorFlags::UCAST) || !dst.is_multicast_address() {
            // Unicast: a bound handle selects the exact source socket.
            let fd = if dst.handle != 0 {
                inner
                    .contexts
                    .get(&dst.handle)
                    .map(|c| c.fd)
                    .unwrap_or(default_fd)
            } else {
                default_fd
            };
            sources.push(fd);
        } else {
            let max_src_mc = match dst.kind {
                LocatorKind::UdpV4 => inner.max_src_mc_v4,
                LocatorKind::UdpV6 => inner.max_src_mc_v6,
            };
            let wanted = (dst.flags & (LocatorFlags::DATA | LocatorFlags::META))
                | LocatorFlags::UCAST;
            let mut ctxs: SmallVec<[RawFd; 4]> = inner
                .contexts
                .values()
                .filter(|c| {
                    c.src_mcast && c.locator.kind == dst.kind && c.locator.flags.contains(wanted)
                })
                .map(|c| c.fd)
                .collect();
            if ctxs.is_empty() || max_src_mc <= 1 {
                // Single (or no) source interface: the default sender
                // carries the configured egress.
                sources.push(if ctxs.is_empty() { default_fd } else { ctxs[0] });
            } else {
                sources.append(&mut ctxs);
            }
        }

        for fd in sources {
            let nwritten = match dst.kind {
                LocatorKind::UdpV4 => {
                    let mut ip = [0u8; 4];
                    ip.copy_from_slice(&dst.address[12..]);
                    let sa = sockaddr_v4(ip, dst.port);
                    let msg = libc::msghdr {
                        msg_name: &sa as *const libc::sockaddr_in as *mut libc::c_void,
                        msg_namelen: std::mem::size_of::<libc::sockaddr_in>()
                            as libc::socklen_t,
                        msg_iov: iov.as_mut_ptr(),
                        msg_iovlen: iov.len() as _,
                        msg_control: std::ptr::null_mut(),
                        msg_controllen: 0,
                        msg_flags: 0,
                    };
                    // SAFETY: sa and the iovec array outlive the call.
                    unsafe { libc::sendmsg(fd, &msg, 0) }
                }
                LocatorKind::UdpV6 => {
                    let sa = sockaddr_v6(dst.address, dst.port, dst.scope_id);
                    let msg = libc::msghdr {
                        msg_name: &sa as *const libc::sockaddr_in6 as *mut libc::c_void,
                        msg_namelen: std::mem::size_of::<libc::sockaddr_in6>()
                            as libc::socklen_t,
                        msg_iov: iov.as_mut_ptr(),
                        msg_iovlen: iov.len() as _,
                        msg_control: std::ptr::null_mut(),
                        msg_controllen: 0,
                        msg_flags: 0,
                    };
                    // SAFETY: sa and the iovec array outlive the call.
                    unsafe { libc::sendmsg(fd, &msg, 0) }
                }
            };
            if nwritten < 0 {
                let err = std::io::Error::last_os_error();
                debug!(%dst, error = %err, "sendmsg returned an error");
                continue;
            }
            // Counters only exist for served-locator sockets; the
            // default sender is anonymous.
            if let Some(handle) = inner.by_fd.get(&fd).copied() {
                if let Some(ctx) = inner.contexts.get_mut(&handle) {
                    ctx.stats.packets_sent += 1;
                    ctx.stats.octets_sent += len as u64;
                }
            }
        }
    }

    /// Dynamic-IP notification: rescan interfaces and retry pending
    /// multicast joins.
    pub fn dynamic_ip_notify(&self) {
        let mut inner = self.inner.lock();
        inner.own_v4 = own_addresses(LocatorKind::UdpV4);
        if inner.send_v6.is_some() {
            inner.own_v6 = own_addresses(LocatorKind::UdpV6);
        }
        if !inner.wait_mc_if {
            return;
        }
        let mut all_done = true;
        let handles: Vec<u32> = inner.contexts.keys().copied().collect();
        for h in handles {
            let (fd, locator, pending) = {
                let c = &inner.contexts[&h];
                (c.fd, c.locator, c.join_pending)
            };
            if !pending {
                continue;
            }
            let ok = match locator.kind {
                LocatorKind::UdpV4 => {
                    let mut group = [0u8; 4];
                    group.copy_from_slice(&locator.address[12..]);
                    join_v4(fd, group, [0, 0, 0, 0]).is_ok()
                }
                LocatorKind::UdpV6 => join_v6(fd, locator.address, locator.scope_id).is_ok(),
            };
            if ok {
                info!(%locator, "deferred multicast join succeeded");
                if let Some(c) = inner.contexts.get_mut(&h) {
                    c.join_pending = false;
                }
            } else {
                all_done = false;
            }
        }
        inner.wait_mc_if = !all_done;
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for (_, ctx) in inner.contexts.drain() {
            self.socks.remove(ctx.fd);
            close_fd(ctx.fd);
        }
        if let Some(fd) = inner.send_v4.take() {
            close_fd(fd);
        }
        if let Some(fd) = inner.send_v6.take() {
            close_fd(fd);
        }
    }
}

fn sockaddr_to_std(sa: &libc::sockaddr_storage) -> std::net::SocketAddr {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    match sa.ss_family as i32 {
        libc::AF_INET6 => {
            // SAFETY: family checked; storage is large enough.
            let sin6 = unsafe { &*(sa as *const _ as *const libc::sockaddr_in6) };
            std::net::SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            )
        }
        _ => {
            // SAFETY: storage is large enough for sockaddr_in.
            let sin = unsafe { &*(sa as *const _ as *const libc::sockaddr_in) };
            let b = sin.sin_addr.s_addr.to_ne_bytes();
            std::net::SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])),
                u16::from_be(sin.sin_port),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn transport() -> Arc<UdpTransport> {
        UdpTransport::new(UdpConfig::default(), Arc::new(SocketSet::default()), false).unwrap()
    }

    #[test]
    fn default_port_mapping() {
        let p = UdpParameters::default();
        assert_eq!(p.user_unicast_port(7, 3), 9167);
        assert_eq!(p.user_multicast_port(7), 9151);
        assert_eq!(p.meta_unicast_port(7, 3), 9166);
        assert_eq!(p.meta_multicast_port(7), 9150);
    }

    #[test]
    fn parameter_validation() {
        let mut p = UdpParameters::default();
        assert!(p.validate().is_ok());
        p.dg = 0;
        assert!(p.validate().is_err());
        p = UdpParameters {
            pb: 0xff01,
            ..UdpParameters::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn locator_derivation_includes_multicast_group() {
        let t = transport();
        let mut uc = LocatorList::new();
        let mut mc = LocatorList::new();
        let mut dst = LocatorList::new();
        t.locators_get(
            7,
            3,
            LocatorKind::UdpV4,
            LocatorClass::Meta,
            &mut uc,
            &mut mc,
            Some(&mut dst),
        );
        assert_eq!(mc.len(), 1);
        let g = mc.as_slice()[0];
        assert_eq!(g.ipv4().octets(), [239, 255, 0, 1]);
        assert_eq!(g.port, 9150);
        assert!(g.flags.contains(LocatorFlags::META | LocatorFlags::MCAST));
        assert_eq!(dst.len(), 1);
        // At least the loopback unicast locator.
        assert!(!uc.is_empty());
        assert!(uc.as_slice().iter().all(|l| l.port == 9166));
    }

    #[test]
    fn oversized_port_is_skipped() {
        let cfg = UdpConfig {
            pars_v4: UdpParameters {
                pb: 65000,
                dg: 250,
                pg: 2,
                d0: 0,
                d1: 10,
                d2: 1,
                d3: 11,
            },
            ..UdpConfig::default()
        };
        let t = UdpTransport::new(cfg, Arc::new(SocketSet::default()), false).unwrap();
        let mut uc = LocatorList::new();
        let mut mc = LocatorList::new();
        t.locators_get(
            7,
            0,
            LocatorKind::UdpV4,
            LocatorClass::User,
            &mut uc,
            &mut mc,
            None,
        );
        // 65000 + 1750 + d2 is over the port ceiling.
        assert!(mc.is_empty());
        assert!(uc.is_empty());
    }

    #[test]
    fn duplicate_locator_rejected() {
        let t = transport();
        let loc = Locator::udpv4(
            [127, 0, 0, 1],
            0, // ephemeral: bind always succeeds
            Scope::Node,
            LocatorFlags::DATA | LocatorFlags::UCAST,
        );
        // Port 0 binds are always distinct endpoints, so use a fixed
        // high port for the duplicate check.
        let loc = Locator { port: 39417, ..loc };
        let h = t.add_locator(0, &loc, true).unwrap();
        assert!(h != 0);
        let err = t.add_locator(0, &loc, true);
        assert!(matches!(err, Err(DdsError::PreconditionNotMet(_))));
        t.remove_locator(h);
        assert_eq!(t.served_count(), 0);
    }

    #[test]
    fn unserved_locator_is_a_noop() {
        let t = transport();
        let loc = Locator::udpv4(
            [127, 0, 0, 1],
            39418,
            Scope::Node,
            LocatorFlags::DATA | LocatorFlags::UCAST,
        );
        assert_eq!(t.add_locator(0, &loc, false).unwrap(), 0);
        assert_eq!(t.served_count(), 0);
    }

    #[test]
    fn send_and_receive_loopback() {
        let socks = Arc::new(SocketSet::default());
        let t = UdpTransport::new(UdpConfig::default(), socks.clone(), false).unwrap();
        let loc = Locator::udpv4(
            [127, 0, 0, 1],
            39419,
            Scope::Node,
            LocatorFlags::DATA | LocatorFlags::UCAST,
        );
        let handle = t.add_locator(0, &loc, true).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        t.set_receiver(Arc::new(move |h, dst, payload, _from| {
            assert_eq!(h, handle);
            assert_eq!(dst.port, 39419);
            assert_eq!(payload, b"HDR-PAYLOAD");
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        let msg = ChunkedMessage {
            chunks: smallvec::smallvec![b"HDR-".to_vec(), b"PAYLOAD".to_vec()],
        };
        t.send(0, &loc, &[], &[msg]);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            if socks.poll(100) {
                socks.dispatch();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = t.context_stats(handle).unwrap();
        assert_eq!(stats.packets_rcvd, 1);
        assert_eq!(stats.octets_rcvd, 11);
        t.remove_locator(handle);
    }
}
