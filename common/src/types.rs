use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageKind {
    #[serde(rename = "whos_there")]
    Probe,
    #[serde(rename = "im_here")]
    Announce,
    #[serde(rename = "im_off")]
    Retract,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Probe => write!(f, "whos_there"),
            Self::Announce => write!(f, "im_here"),
            Self::Retract => write!(f, "im_off"),
        }
    }
}

/// A discovery datagram. `reply` carries the advertised address and is
/// present for ANNOUNCE and RETRACT only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub service: String,
    #[serde(rename = "message")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<SocketAddr>,
}

impl Message {
    pub fn probe(service: &str) -> Self {
        Self {
            service: service.to_string(),
            kind: MessageKind::Probe,
            reply: None,
        }
    }

    pub fn announce(service: &str, address: SocketAddr) -> Self {
        Self {
            service: service.to_string(),
            kind: MessageKind::Announce,
            reply: Some(address),
        }
    }

    pub fn retract(service: &str, address: SocketAddr) -> Self {
        Self {
            service: service.to_string(),
            kind: MessageKind::Retract,
            reply: Some(address),
        }
    }
}

/// A remote endpoint known to offer a looked-up service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub service: String,
    pub address: SocketAddr,
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    pub fn ip_address(&self) -> IpAddr {
        self.address.ip()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEvent {
    Found,
    Gone,
}

impl fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found => write!(f, "PeerFound"),
            Self::Gone => write!(f, "PeerGone"),
        }
    }
}
