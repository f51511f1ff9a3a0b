//! Peer records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Presence of a peer on the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Reachable and serving files
    Online,
    /// Left the network; address must not be used
    Offline,
}

impl PeerStatus {
    /// Wire representation stored in the index
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Online => "online",
            PeerStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PeerStatus::Online),
            "offline" => Ok(PeerStatus::Offline),
            other => Err(format!("unknown peer status: {}", other)),
        }
    }
}

/// One participant of the network, keyed by username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Unique username
    pub username: String,
    /// Address other peers connect to
    pub ip: IpAddr,
    /// Transfer server port
    pub port: u16,
    /// Presence
    pub status: PeerStatus,
}

impl PeerRecord {
    /// A record for a peer that just joined.
    pub fn online(username: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            username: username.into(),
            ip,
            port,
            status: PeerStatus::Online,
        }
    }

    /// Socket address of the peer's transfer server
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}
