//! Pool constraints: the sizing contract between configuration and the
//! factory's pools.

use crate::config::{keys, Config};
use tdds_kernel::pool::PoolLimits;

/// Resolved pool sizing, defaults overridden by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConstraints {
    pub max_domains: usize,
    pub subscribers: (usize, usize),
    pub publishers: (usize, usize),
    pub readers: (usize, usize),
    pub writers: (usize, usize),
    pub topics: (usize, usize),
    pub topic_types: (usize, usize),
    pub locators: (usize, usize),
    pub timers: (usize, usize),
    pub notifications: (usize, usize),
    pub dyn_types: (usize, usize),
    pub dyn_samples: (usize, usize),
    /// Data-buffer bytes distributed over the size classes.
    pub pool_data: (usize, usize),
    pub max_sockets: usize,
    /// Growth percentage for every growable pool.
    pub growth: usize,
}

impl Default for PoolConstraints {
    fn default() -> Self {
        PoolConstraints {
            max_domains: 4,
            subscribers: (4, 64),
            publishers: (4, 64),
            readers: (8, 1024),
            writers: (8, 1024),
            topics: (16, 256),
            topic_types: (16, 256),
            locators: (16, 256),
            timers: (32, 256),
            notifications: (16, 1024),
            dyn_types: (16, 256),
            dyn_samples: (16, 1024),
            pool_data: (128 * 1024, 32 * 1024 * 1024),
            max_sockets: 1024,
            growth: 25,
        }
    }
}

impl PoolConstraints {
    pub fn from_config(cfg: &Config) -> PoolConstraints {
        let d = PoolConstraints::default();
        PoolConstraints {
            max_domains: cfg.get_number(keys::POOL_DOMAINS, d.max_domains as u32) as usize,
            subscribers: cfg.get_range(keys::POOL_SUBSCRIBERS, d.subscribers),
            publishers: cfg.get_range(keys::POOL_PUBLISHERS, d.publishers),
            readers: cfg.get_range(keys::POOL_READERS, d.readers),
            writers: cfg.get_range(keys::POOL_WRITERS, d.writers),
            topics: cfg.get_range(keys::POOL_TOPICS, d.topics),
            topic_types: cfg.get_range(keys::POOL_TOPIC_TYPES, d.topic_types),
            locators: cfg.get_range(keys::POOL_LOCATORS, d.locators),
            timers: cfg.get_range(keys::POOL_TIMERS, d.timers),
            notifications: cfg.get_range(keys::POOL_NOTIFICATIONS, d.notifications),
            dyn_types: cfg.get_range(keys::POOL_DYN_TYPES, d.dyn_types),
            dyn_samples: cfg.get_range(keys::POOL_DYN_SAMPLES, d.dyn_samples),
            pool_data: cfg.get_range(keys::POOL_DATA, d.pool_data),
            max_sockets: cfg.get_number(keys::IP_SOCKETS, d.max_sockets as u32) as usize,
            growth: cfg.get_number(keys::POOL_GROWTH, d.growth as u32) as usize,
        }
    }

    pub fn limits(&self, range: (usize, usize)) -> PoolLimits {
        PoolLimits::from_range(range.0, range.1, self.growth)
    }
}
