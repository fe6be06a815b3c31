//! BACnet Network Addressing
//!
//! The transaction engine never opens sockets or parses NPDUs; it only needs a
//! stable, hashable identity for the remote station a transaction talks to.
//! [`Address`] is that identity: an optional remote network number plus the
//! station's MAC on that network.
//!
//! # Address kinds
//!
//! - Local station: no network number, MAC on the local link
//! - Remote station: network number 1..=65534 and a MAC on that network
//! - Local broadcast / global broadcast: empty MAC (network 65535 for global)
//!
//! BACnet/IP MACs are the six bytes of an IPv4 address followed by the UDP port.
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::network::Address;
//!
//! let addr = Address::from_socket_addr("192.168.1.10:47808".parse().unwrap());
//! assert!(addr.is_station());
//! assert_eq!(addr.to_string(), "192.168.1.10:47808");
//! ```

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Network number used for global broadcasts
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

/// Length of a BACnet/IP MAC (IPv4 address + port)
pub const BIP_MAC_LENGTH: usize = 6;

/// Address of a BACnet station or broadcast domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Address {
    /// Remote network number, `None` for the local network
    pub network: Option<u16>,
    /// MAC address on that network, empty for broadcasts
    pub mac: Vec<u8>,
}

impl Address {
    /// A station on the local network
    pub fn local_station(mac: impl Into<Vec<u8>>) -> Self {
        Self {
            network: None,
            mac: mac.into(),
        }
    }

    /// A station on a remote network
    pub fn remote_station(network: u16, mac: impl Into<Vec<u8>>) -> Self {
        Self {
            network: Some(network),
            mac: mac.into(),
        }
    }

    /// Broadcast on the local network
    pub fn local_broadcast() -> Self {
        Self {
            network: None,
            mac: Vec::new(),
        }
    }

    /// Broadcast on every network
    pub fn global_broadcast() -> Self {
        Self {
            network: Some(GLOBAL_BROADCAST_NETWORK),
            mac: Vec::new(),
        }
    }

    /// A BACnet/IP station on the local network. IPv6 sockets are mapped to
    /// the unspecified IPv4 address since BACnet/IP MACs only carry IPv4.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        let mut mac = Vec::with_capacity(BIP_MAC_LENGTH);
        mac.extend_from_slice(&ip.octets());
        mac.extend_from_slice(&addr.port().to_be_bytes());
        Self::local_station(mac)
    }

    /// Interpret the MAC as a BACnet/IP address, if it has the right length
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.mac.len() != BIP_MAC_LENGTH {
            return None;
        }
        let ip = Ipv4Addr::new(self.mac[0], self.mac[1], self.mac[2], self.mac[3]);
        let port = u16::from_be_bytes([self.mac[4], self.mac[5]]);
        Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    /// True for broadcast addresses of either scope
    pub fn is_broadcast(&self) -> bool {
        self.mac.is_empty()
    }

    /// True for addresses naming a single station, the only kind a confirmed
    /// request may be sent to
    pub fn is_station(&self) -> bool {
        !self.mac.is_empty() && self.network != Some(GLOBAL_BROADCAST_NETWORK)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            return match self.network {
                Some(GLOBAL_BROADCAST_NETWORK) => write!(f, "*:*"),
                Some(net) => write!(f, "{}:*", net),
                None => write!(f, "*"),
            };
        }
        if let Some(net) = self.network {
            write!(f, "{}:", net)?;
        }
        match self.socket_addr() {
            Some(sock) => write!(f, "{}", sock),
            None => write!(f, "0x{}", hex::encode(&self.mac)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr_round_trip() {
        let sock: SocketAddr = "10.0.0.7:47809".parse().unwrap();
        let addr = Address::from(sock);
        assert_eq!(addr.mac, vec![10, 0, 0, 7, 0xBA, 0xC1]);
        assert_eq!(addr.socket_addr(), Some(sock));
        assert!(addr.is_station());
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::local_station(vec![0x12]).to_string(), "0x12");
        assert_eq!(
            Address::remote_station(5, vec![0xAB, 0xCD]).to_string(),
            "5:0xabcd"
        );
        assert_eq!(Address::local_broadcast().to_string(), "*");
        assert_eq!(Address::global_broadcast().to_string(), "*:*");
    }

    #[test]
    fn test_broadcasts_are_not_stations() {
        assert!(!Address::local_broadcast().is_station());
        assert!(!Address::global_broadcast().is_station());
        assert!(Address::remote_station(7, vec![1]).is_station());
    }
}
