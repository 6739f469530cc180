//! UDP transport for the discovery protocol.
//!
//! Two channels: the group channel is bound to the fixed discovery port and
//! joined to the multicast group, so it receives probes and announcements
//! from other agents. The direct channel sits on an ephemeral port and sends
//! every outbound datagram, which makes unicast replies come back to it.

use common::{DiscoveryConfig, DiscoveryError, Message, Result};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{watch, OnceCell};

use crate::discovery::codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Group,
    Direct,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group => write!(f, "group"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Receiver of decoded datagrams from either channel.
pub trait InboundHandler: Send + Sync {
    fn handle<'a>(&'a self, channel: Channel, message: Message, from: SocketAddr)
        -> BoxFuture<'a, ()>;
}

pub struct Transport {
    group_addr: SocketAddr,
    multicast_addr: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
    direct: Arc<UdpSocket>,
    group: OnceCell<Arc<UdpSocket>>,
    group_ready: watch::Sender<Option<Arc<UdpSocket>>>,
}

impl Transport {
    /// Opens the direct channel. The group channel is joined later, on demand.
    pub async fn bind(config: &DiscoveryConfig) -> Result<Self> {
        let interface = resolve_interface(config);
        let bind_ip = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let direct = open_direct_socket(config, bind_ip, interface).map_err(|e| {
            DiscoveryError::NetworkError(format!("binding direct channel on {}: {}", bind_ip, e))
        })?;
        let direct = UdpSocket::from_std(direct)?;

        info!(
            "Direct channel bound to {} (multicast interface {})",
            direct.local_addr()?,
            interface
        );

        let (group_ready, _) = watch::channel(None);

        Ok(Self {
            group_addr: config.group_addr(),
            multicast_addr: config.multicast_addr,
            port: config.port,
            interface,
            direct: Arc::new(direct),
            group: OnceCell::new(),
            group_ready,
        })
    }

    /// Joins the multicast group at most once. Concurrent callers wait on the
    /// same attempt; a failed attempt leaves the channel unjoined so a later
    /// call can retry.
    pub async fn join_group(&self) -> Result<Arc<UdpSocket>> {
        let socket = self
            .group
            .get_or_try_init(|| async {
                let socket = open_group_socket(self.multicast_addr, self.port, self.interface)
                    .map_err(|e| {
                        DiscoveryError::NetworkError(format!(
                            "joining {}:{} on {}: {}",
                            self.multicast_addr, self.port, self.interface, e
                        ))
                    })?;
                let socket = Arc::new(UdpSocket::from_std(socket)?);

                info!(
                    "Joined multicast group {} on {}, listening on port {}",
                    self.multicast_addr, self.interface, self.port
                );
                self.group_ready.send_replace(Some(Arc::clone(&socket)));
                Ok::<_, DiscoveryError>(socket)
            })
            .await?;

        Ok(Arc::clone(socket))
    }

    pub fn is_joined(&self) -> bool {
        self.group.initialized()
    }

    /// Resolves once the group channel has been joined. Returns `None` only if
    /// the transport is torn down first.
    pub async fn wait_for_group(&self) -> Option<Arc<UdpSocket>> {
        let mut ready = self.group_ready.subscribe();
        let socket = ready.wait_for(Option::is_some).await.ok()?;
        (*socket).clone()
    }

    pub fn leave_group(&self) -> Result<()> {
        if let Some(socket) = self.group.get() {
            socket.leave_multicast_v4(self.multicast_addr, self.interface)?;
            debug!("Left multicast group {}", self.multicast_addr);
        }
        Ok(())
    }

    pub async fn send_group(&self, payload: &[u8]) -> Result<()> {
        self.send_unicast(payload, self.group_addr).await
    }

    pub async fn send_unicast(&self, payload: &[u8], to: SocketAddr) -> Result<()> {
        let sent = self.direct.send_to(payload, to).await?;
        debug!("Sent {} bytes to {}", sent, to);
        Ok(())
    }

    pub fn direct_channel(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.direct)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.direct.local_addr()?)
    }
}

/// Reads datagrams until `shutdown` flips, handing each decoded message to
/// `handler`. Undecodable datagrams are logged and dropped.
pub async fn receive_loop<H>(
    channel: Channel,
    socket: Arc<UdpSocket>,
    max_packet_size: usize,
    handler: &H,
    mut shutdown: watch::Receiver<bool>,
) where
    H: InboundHandler + ?Sized,
{
    debug!("Starting {} channel receive loop", channel);
    let mut buf = vec![0; max_packet_size];

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match codec::decode(&buf[..len]) {
                    Ok(message) => {
                        debug!(
                            "Received {} for '{}' from {} on {} channel",
                            message.kind, message.service, from, channel
                        );
                        handler.handle(channel, message, from).await;
                    }
                    Err(e) => {
                        warn!("Dropping datagram from {} on {} channel: {}", from, channel, e);
                    }
                },
                Err(e) => {
                    error!("Error receiving on {} channel: {}", channel, e);
                }
            }
        }
    }

    debug!("{} channel receive loop stopped", channel);
}

/// Completes when the flag is set or its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Explicit interface first, then the host's outward-facing address.
pub fn resolve_interface(config: &DiscoveryConfig) -> Ipv4Addr {
    if let Some(interface) = config.interface {
        return interface;
    }

    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) => ip,
        Ok(IpAddr::V6(ip)) => {
            warn!("Default address {} is IPv6, using any interface for multicast", ip);
            Ipv4Addr::UNSPECIFIED
        }
        Err(e) => {
            warn!("Could not determine local address ({}), using any interface", e);
            Ipv4Addr::UNSPECIFIED
        }
    }
}

fn open_direct_socket(
    config: &DiscoveryConfig,
    bind_ip: Ipv4Addr,
    interface: Ipv4Addr,
) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(bind_ip, 0));
    socket.bind(&bind_addr.into())?;

    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
    socket.set_multicast_loop_v4(config.multicast_loop)?;
    if !interface.is_unspecified() {
        if let Err(e) = socket.set_multicast_if_v4(&interface) {
            warn!("Could not route multicast through {}: {}", interface, e);
        }
    }

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn open_group_socket(
    group: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // Several agents on one host share the discovery port.
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&group, &interface)?;

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
