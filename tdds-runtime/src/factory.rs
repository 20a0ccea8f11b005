//! Factory: two-phase runtime initialisation and teardown.
//!
//! Pre-init is idempotent and process-wide: it loads the configuration,
//! resolves pool constraints and prepares the logger. Init builds one
//! [`Runtime`]: pools, timer manager, socket set, dispatcher, GUID
//! prefix and the UDP transport, then starts the worker thread.
//! Teardown runs in reverse and is guarded against double close.

use crate::buffers::DataBufferPools;
use crate::config::{keys, Config};
use crate::constraints::PoolConstraints;
use crate::domain::DomainRegistry;
use crate::guid::GuidPrefix;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tdds_kernel::error::Result;
use tdds_kernel::event::Dispatcher;
use tdds_kernel::log::{self, source};
use tdds_kernel::sock::SocketSet;
use tdds_kernel::timer::TimerManager;
use tdds_transport::{IpFilter, UdpConfig, UdpParameters, UdpTransport};
use tracing::info;

/// Default purge delay in milliseconds.
const DEF_PURGE_DELAY_MS: u32 = 500;

/// Default and absolute maximum sample sizes.
const DEF_MAX_SAMPLE_SIZE: u32 = 1 << 20;
const ABS_MAX_SAMPLE_SIZE: u32 = 4 << 20;

/// Process-permanent context surviving runtime restarts.
pub struct PreInitState {
    pub config: Config,
    pub constraints: PoolConstraints,
}

static PRE_INIT: OnceLock<PreInitState> = OnceLock::new();

/// Idempotent pre-initialisation: configuration, constraints, logging.
pub fn pre_init() -> &'static PreInitState {
    PRE_INIT.get_or_init(|| {
        let config = Config::load();
        let constraints = PoolConstraints::from_config(&config);
        // Resolve the log file location before any subsystem emits.
        let logger = log::Logger::global();
        if let Some(dir) = config.get_str(keys::LOG_DIR) {
            logger.set_log_dir(dir);
        }
        log::log_line(source::DDS, "pre-init complete");
        PreInitState {
            config,
            constraints,
        }
    })
}

fn udp_parameters(cfg: &Config) -> UdpParameters {
    let d = UdpParameters::default();
    UdpParameters {
        pb: cfg.get_number(keys::UDP_PB, d.pb),
        dg: cfg.get_number(keys::UDP_DG, d.dg),
        pg: cfg.get_number(keys::UDP_PG, d.pg),
        d0: cfg.get_number(keys::UDP_D0, d.d0),
        d1: cfg.get_number(keys::UDP_D1, d.d1),
        d2: cfg.get_number(keys::UDP_D2, d.d2),
        d3: cfg.get_number(keys::UDP_D3, d.d3),
    }
}

fn udp_config(cfg: &Config) -> UdpConfig {
    let pars = udp_parameters(cfg);
    UdpConfig {
        pars_v4: pars,
        pars_v6: pars,
        mcast_ttl: cfg
            .defined(keys::IP_MCAST_TTL)
            .then(|| cfg.get_number(keys::IP_MCAST_TTL, 1))
            .filter(|t| (1..=255).contains(t)),
        mcast_dest: cfg.get_str(keys::IP_MCAST_DEST).and_then(|s| s.parse().ok()),
        mcast_addr_v4: cfg.get_str(keys::IP_MCAST_ADDR).and_then(|s| s.parse().ok()),
        mcast_addr_v6: cfg
            .get_str(keys::IPV6_MCAST_ADDR)
            .and_then(|s| s.parse::<std::net::Ipv6Addr>().ok())
            .map(|a| a.octets()),
        mcast_hops_v6: cfg
            .defined(keys::IPV6_MCAST_HOPS)
            .then(|| cfg.get_number(keys::IPV6_MCAST_HOPS, 1)),
        mcast_intf_v6: cfg
            .defined(keys::IPV6_MCAST_INTF)
            .then(|| cfg.get_number(keys::IPV6_MCAST_INTF, 0)),
        mcast_src: cfg.get_str(keys::IP_MCAST_SRC).and_then(IpFilter::parse),
        intf_filter: cfg.get_str(keys::IP_INTF).and_then(IpFilter::parse),
        no_mcast: cfg.get_flag(keys::IP_NO_MCAST),
    }
}

/// The assembled core runtime.
pub struct Runtime {
    pub config: Config,
    pub constraints: PoolConstraints,
    pub socks: Arc<SocketSet>,
    pub timers: Arc<TimerManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub transport: Arc<UdpTransport>,
    pub buffers: Arc<DataBufferPools>,
    pub domains: DomainRegistry,
    pub guid: GuidPrefix,
    pub purge_delay_ms: u32,
    pub max_sample_size: u32,
    pub rtps_enabled: bool,
    /// Participant entity name advertised to discovery.
    pub entity_name: Option<String>,
    core_lock: Mutex<()>,
    running: AtomicBool,
}

impl Runtime {
    /// Full initialisation. Runs pre-init first when needed.
    pub fn init() -> Result<Arc<Runtime>> {
        let pre = pre_init();
        let config = pre.config.clone();
        let constraints = pre.constraints.clone();

        let socks = Arc::new(SocketSet::new(constraints.max_sockets));
        let timers = Arc::new(TimerManager::new(constraints.limits(constraints.timers)));
        log::log_line(source::DDS, "timer pool initialized");

        let buffers = Arc::new(DataBufferPools::new(&constraints));
        log::log_line(source::DDS, "data buffer pools created");

        let dispatcher = Dispatcher::new(timers.clone(), socks.clone(), constraints.notifications.1)?;

        let guid = GuidPrefix::generate();
        log::log_line(source::DDS, &format!("unique GUID prefix created: {guid}"));

        let ipv6 = config.get_flag(keys::IPV6);
        let transport = UdpTransport::new(udp_config(&config), socks.clone(), ipv6)?;
        log::log_line(source::DDS, "UDP transport attached");

        let purge_delay_ms = config.get_number(keys::PURGE_DELAY, DEF_PURGE_DELAY_MS);
        let max_sample_size = config
            .get_number(keys::SAMPLE_SIZE, DEF_MAX_SAMPLE_SIZE)
            .min(ABS_MAX_SAMPLE_SIZE);
        let rtps_enabled = config.get_number(keys::RTPS_MODE, 1) != 0;
        let entity_name = config.get_str(keys::NAME).map(String::from);

        dispatcher.start()?;
        log::log_line(source::DDS, "core thread created");

        Ok(Arc::new(Runtime {
            domains: DomainRegistry::new(constraints.max_domains),
            config,
            constraints,
            socks,
            timers,
            dispatcher,
            transport,
            buffers,
            guid,
            purge_delay_ms,
            max_sample_size,
            rtps_enabled,
            entity_name,
            core_lock: Mutex::new(()),
            running: AtomicBool::new(true),
        }))
    }

    /// Serialise factory-level operations.
    pub fn lock_core(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.core_lock.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Teardown in reverse init order; safe to call twice.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping core thread");
        self.dispatcher.stop();
        self.buffers.dump();
        self.timers.dump();
        log::log_line(source::DDS, "core thread exited");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
