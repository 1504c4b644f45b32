use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduler configuration. Deserializable so a running scheduler can be
/// reloaded from a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Namespaces for which inbound handshakes may create new downloads
    /// even when the blob is unknown locally.
    pub namespace_whitelist: Vec<String>,
    pub max_open_conns_per_torrent: usize,
    pub max_open_conns_global: usize,
    /// Outstanding piece requests allowed per connection.
    pub pipeline_limit: usize,
    /// Piece upload throttle per connection, bytes per second. Zero
    /// disables throttling.
    pub egress_bytes_per_sec: u64,
    pub handshake_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub announce_interval_secs: u64,
    pub max_announce_interval_secs: u64,
    pub idle_ttl_secs: u64,
    pub blacklist_duration_secs: u64,
    pub blacklist_cleanup_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub download_timeout_secs: u64,
    pub tick_interval_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            namespace_whitelist: Vec::new(),
            max_open_conns_per_torrent: 10,
            max_open_conns_global: 1000,
            pipeline_limit: 3,
            egress_bytes_per_sec: 0,
            handshake_timeout_secs: 5,
            read_timeout_secs: 120,
            write_timeout_secs: 15,
            request_timeout_secs: 30,
            dial_timeout_secs: 5,
            announce_interval_secs: 3,
            max_announce_interval_secs: 60,
            idle_ttl_secs: 10 * 60,
            blacklist_duration_secs: 30,
            blacklist_cleanup_interval_secs: 60,
            probe_interval_secs: 5,
            download_timeout_secs: 120,
            tick_interval_millis: 250,
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn max_announce_interval(&self) -> Duration {
        Duration::from_secs(self.max_announce_interval_secs)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_secs(self.blacklist_duration_secs)
    }

    pub fn blacklist_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.blacklist_cleanup_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_millis.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"pipeline_limit": 7}"#).unwrap();
        assert_eq!(cfg.pipeline_limit, 7);
        assert_eq!(cfg.max_open_conns_per_torrent, Config::default().max_open_conns_per_torrent);
    }
}
