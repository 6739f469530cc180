use std::net::Ipv4Addr;
use std::time::Duration;

pub mod error;
pub mod types;
pub mod config;

pub use error::{DiscoveryError, Result};
pub use types::*;

/// Administratively-scoped group every agent probes and announces on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);
pub const DISCOVERY_PORT: u16 = 9090;
pub const LOOKUP_INTERVAL: Duration = Duration::from_secs(3);
/// Maximum silence before a peer is presumed gone.
pub const HOST_MAX_LIFE: Duration = Duration::from_secs(60);
pub const MAX_DATAGRAM_SIZE: usize = 300;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub multicast_addr: Ipv4Addr,
    pub port: u16,
    /// Local interface used for the group join and outgoing multicast.
    /// `None` falls back to the host's outward-facing address.
    pub interface: Option<Ipv4Addr>,
    pub lookup_interval: Duration,
    pub host_max_life: Duration,
    pub max_packet_size: usize,
    pub multicast_ttl: u32,
    pub multicast_loop: bool,
    pub shutdown_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_addr: MULTICAST_GROUP,
            port: DISCOVERY_PORT,
            interface: None,
            lookup_interval: LOOKUP_INTERVAL,
            host_max_life: HOST_MAX_LIFE,
            max_packet_size: MAX_DATAGRAM_SIZE,
            multicast_ttl: 2,
            multicast_loop: true,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}
