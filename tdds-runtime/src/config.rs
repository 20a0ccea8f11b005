//! Runtime configuration.
//!
//! Values come from an optional TOML file (path in `TDDS_CONFIG`) with
//! environment variables layered on top: every `TDDS_<KEY>` variable
//! overrides the file entry of the same (lower-cased) key. Unset keys
//! fall back to compiled-in defaults at the call site.

use rustc_hash::FxHashMap;
use std::path::Path;
use tracing::warn;

/// Well-known configuration keys.
pub mod keys {
    pub const POOL_DOMAINS: &str = "pool_domains";
    pub const POOL_SUBSCRIBERS: &str = "pool_subscribers";
    pub const POOL_PUBLISHERS: &str = "pool_publishers";
    pub const POOL_READERS: &str = "pool_readers";
    pub const POOL_WRITERS: &str = "pool_writers";
    pub const POOL_TOPICS: &str = "pool_topics";
    pub const POOL_TOPIC_TYPES: &str = "pool_topic_types";
    pub const POOL_LOCATORS: &str = "pool_locators";
    pub const POOL_TIMERS: &str = "pool_timers";
    pub const POOL_NOTIFICATIONS: &str = "pool_notifications";
    pub const POOL_DYN_TYPES: &str = "pool_dyn_types";
    pub const POOL_DYN_SAMPLES: &str = "pool_dyn_samples";
    pub const POOL_DATA: &str = "pool_data";
    pub const POOL_GROWTH: &str = "pool_growth";
    pub const IP_MCAST_TTL: &str = "ip_mcast_ttl";
    pub const IP_MCAST_DEST: &str = "ip_mcast_dest";
    pub const IP_MCAST_SRC: &str = "ip_mcast_src";
    pub const IP_MCAST_ADDR: &str = "ip_mcast_addr";
    pub const IP_NO_MCAST: &str = "ip_no_mcast";
    pub const IP_INTF: &str = "ip_intf";
    pub const IP_SOCKETS: &str = "ip_sockets";
    pub const IPV6_MCAST_HOPS: &str = "ipv6_mcast_hops";
    pub const IPV6_MCAST_INTF: &str = "ipv6_mcast_intf";
    pub const IPV6_MCAST_ADDR: &str = "ipv6_mcast_addr";
    pub const UDP_PB: &str = "udp_pb";
    pub const UDP_DG: &str = "udp_dg";
    pub const UDP_PG: &str = "udp_pg";
    pub const UDP_D0: &str = "udp_d0";
    pub const UDP_D1: &str = "udp_d1";
    pub const UDP_D2: &str = "udp_d2";
    pub const UDP_D3: &str = "udp_d3";
    pub const IPV6: &str = "ipv6";
    pub const RTPS_MODE: &str = "rtps_mode";
    pub const LOG_DIR: &str = "log_dir";
    pub const PURGE_DELAY: &str = "purge_delay";
    pub const SAMPLE_SIZE: &str = "sample_size";
    pub const NAME: &str = "name";
}

/// Loaded configuration: flat string map, lower-cased keys.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: FxHashMap<String, String>,
}

impl Config {
    /// Load the configuration file (if any) and the environment.
    pub fn load() -> Config {
        let mut cfg = Config::default();
        if let Ok(path) = std::env::var("TDDS_CONFIG") {
            if !path.is_empty() {
                cfg.load_file(Path::new(&path));
            }
        }
        cfg.load_env();
        cfg
    }

    fn load_file(&mut self, path: &Path) {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "can't read configuration file");
                return;
            }
        };
        let table: toml::Table = match text.parse() {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "bad configuration file");
                return;
            }
        };
        for (section, value) in table {
            match value {
                toml::Value::Table(inner) => {
                    for (k, v) in inner {
                        self.values
                            .insert(format!("{section}_{k}").to_lowercase(), scalar(v));
                    }
                }
                v => {
                    self.values.insert(section.to_lowercase(), scalar(v));
                }
            }
        }
    }

    fn load_env(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(rest) = key.strip_prefix("TDDS_") {
                if rest == "CONFIG" {
                    continue;
                }
                self.values.insert(rest.to_lowercase(), value);
            }
        }
    }

    pub fn defined(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_number(&self, key: &str, default: u32) -> u32 {
        match self.values.get(key) {
            Some(v) => v.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %v, "bad numeric configuration value");
                default
            }),
            None => default,
        }
    }

    pub fn get_flag(&self, key: &str) -> bool {
        matches!(
            self.values.get(key).map(String::as_str),
            Some("1") | Some("true") | Some("yes") | Some("on")
        )
    }

    /// A `min:max` pair; a single number sets both ends.
    pub fn get_range(&self, key: &str, default: (usize, usize)) -> (usize, usize) {
        let Some(v) = self.values.get(key) else {
            return default;
        };
        let parse = |s: &str| s.trim().parse::<usize>().ok();
        match v.split_once(':') {
            Some((lo, hi)) => match (parse(lo), parse(hi)) {
                (Some(lo), Some(hi)) if lo <= hi => (lo, hi),
                _ => {
                    warn!(key, value = %v, "bad range configuration value");
                    default
                }
            },
            None => match parse(v) {
                Some(n) => (n, n),
                None => {
                    warn!(key, value = %v, "bad range configuration value");
                    default
                }
            },
        }
    }

    /// Test hook: inject a value directly.
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_lowercase(), value.to_string());
    }
}

fn scalar(v: toml::Value) -> String {
    match v {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn numbers_and_defaults() {
        let mut c = Config::default();
        c.set(keys::UDP_PB, "7500");
        assert_eq!(c.get_number(keys::UDP_PB, 7400), 7500);
        assert_eq!(c.get_number(keys::UDP_DG, 250), 250);
        c.set(keys::UDP_DG, "junk");
        assert_eq!(c.get_number(keys::UDP_DG, 250), 250);
    }

    #[test]
    fn ranges() {
        let mut c = Config::default();
        c.set(keys::POOL_TOPICS, "4:64");
        assert_eq!(c.get_range(keys::POOL_TOPICS, (1, 1)), (4, 64));
        c.set(keys::POOL_READERS, "8");
        assert_eq!(c.get_range(keys::POOL_READERS, (1, 1)), (8, 8));
        c.set(keys::POOL_WRITERS, "9:3");
        assert_eq!(c.get_range(keys::POOL_WRITERS, (2, 5)), (2, 5));
    }

    #[test]
    fn flags() {
        let mut c = Config::default();
        assert!(!c.get_flag(keys::IP_NO_MCAST));
        c.set(keys::IP_NO_MCAST, "1");
        assert!(c.get_flag(keys::IP_NO_MCAST));
    }

    #[test]
    fn file_sections_flatten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tdds.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[udp]\npb = 7600\n[pool]\ntopics = \"2:32\"").unwrap();
        drop(f);
        let mut c = Config::default();
        c.load_file(&path);
        assert_eq!(c.get_number(keys::UDP_PB, 7400), 7600);
        assert_eq!(c.get_range(keys::POOL_TOPICS, (1, 1)), (2, 32));
    }
}
