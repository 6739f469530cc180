use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use crate::error::DiscoveryError;
use crate::{DiscoveryConfig, Result};

/// Smallest budget that still fits a PROBE for a one-letter service.
const MIN_PACKET_SIZE: usize = 64;

impl DiscoveryConfig {
    /// Defaults overlaid with `DISCOVERY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parse_var::<Ipv4Addr, _>(&lookup, "DISCOVERY_MULTICAST_ADDR")? {
            config.multicast_addr = addr;
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, "DISCOVERY_PORT")? {
            config.port = port;
        }
        if let Some(iface) = parse_var::<Ipv4Addr, _>(&lookup, "DISCOVERY_INTERFACE")? {
            config.interface = Some(iface);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "DISCOVERY_LOOKUP_INTERVAL_SECS")? {
            config.lookup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "DISCOVERY_HOST_MAX_LIFE_SECS")? {
            config.host_max_life = Duration::from_secs(secs);
        }
        if let Some(ttl) = parse_var::<u32, _>(&lookup, "DISCOVERY_MULTICAST_TTL")? {
            config.multicast_ttl = ttl;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multicast_addr.is_multicast() {
            return Err(DiscoveryError::ConfigError(format!(
                "{} is not an IPv4 multicast address",
                self.multicast_addr
            )));
        }
        if self.lookup_interval.is_zero() {
            return Err(DiscoveryError::ConfigError(
                "lookup interval must be non-zero".to_string(),
            ));
        }
        if self.host_max_life.is_zero() {
            return Err(DiscoveryError::ConfigError(
                "host max life must be non-zero".to_string(),
            ));
        }
        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(DiscoveryError::ConfigError(format!(
                "max packet size {} is below {} bytes",
                self.max_packet_size, MIN_PACKET_SIZE
            )));
        }
        Ok(())
    }

    /// Destination of every group send.
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.multicast_addr, self.port))
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| DiscoveryError::ConfigError(format!("{}={}: {}", key, raw, e))),
        None => Ok(None),
    }
}
