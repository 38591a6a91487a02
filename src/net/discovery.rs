//! Local peer discovery
//!
//! Nodes on the same LAN find each other over UDP broadcast: the payload
//! is the protocol magic followed by the TCP port the sender listens on.
//! A foreign packet adds the sender to the announced peers; we respond
//! directly at most once per epoch per address so two fresh nodes converge
//! quickly without flooding.

use crate::net::address::Address;
use crate::types::now;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Default local discovery UDP port.
pub const DEFAULT_PORT: u16 = 44302;

/// Seconds before the same address is answered directly again.
const RESPONSE_EPOCH: u32 = 600;

pub const PACKET_SIZE: usize = 8 + 2;

pub fn encode(magic: &[u8; 8], port: u16) -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    packet[0..8].copy_from_slice(magic);
    packet[8..10].copy_from_slice(&port.to_le_bytes());
    packet
}

pub fn decode(magic: &[u8; 8], packet: &[u8]) -> Option<u16> {
    if packet.len() != PACKET_SIZE || &packet[0..8] != magic {
        return None;
    }
    Some(u16::from_le_bytes([packet[8], packet[9]]))
}

pub struct Discovery {
    socket: UdpSocket,
    magic: [u8; 8],
    port: u16,
    /// TCP port we advertise.
    pub announcement: AtomicU16,
    /// Timestamp of our last broadcast.
    pub history: AtomicU32,
    answered: Mutex<HashMap<Address, u32>>,
}

impl Discovery {
    pub async fn bind(magic: [u8; 8], port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            magic,
            port,
            announcement: AtomicU16::new(0),
            history: AtomicU32::new(0),
            answered: Mutex::new(HashMap::new()),
        })
    }

    /// Broadcast our magic and listening port to the local network.
    pub async fn announce(&self) {
        let announcement = self.announcement.load(Ordering::Relaxed);
        if announcement == 0 {
            return;
        }
        let packet = encode(&self.magic, announcement);
        let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.port);
        match self.socket.send_to(&packet, broadcast).await {
            Ok(_) => {
                self.history.store(now(), Ordering::Relaxed);
                debug!(port = announcement, "local discovery announced");
            }
            Err(e) => warn!(error = %e, "local discovery broadcast failed"),
        }
    }

    /// Receive one packet; returns the advertised peer address when valid
    /// and also answers the sender directly, throttled per epoch.
    pub async fn poll(&self) -> Option<Address> {
        let mut buffer = [0u8; 64];
        let (n, from) = self.socket.recv_from(&mut buffer).await.ok()?;
        let port = decode(&self.magic, &buffer[..n])?;

        let peer = Address::new(from.ip(), port);
        let respond = {
            let mut answered = self.answered.lock().unwrap();
            let t = now();
            answered.retain(|_, &mut stamp| t.wrapping_sub(stamp) < RESPONSE_EPOCH);
            match answered.get(&peer) {
                Some(_) => false,
                None => {
                    answered.insert(peer, t);
                    true
                }
            }
        };

        if respond {
            let announcement = self.announcement.load(Ordering::Relaxed);
            if announcement != 0 {
                let packet = encode(&self.magic, announcement);
                let _ = self.socket.send_to(&packet, from).await;
            }
        }
        Some(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let magic = crate::net::protocol::MAGIC;
        let packet = encode(magic, 44303);
        assert_eq!(decode(magic, &packet), Some(44303));

        // foreign magic ignored
        assert_eq!(decode(b"OTHER/1\0", &packet), None);
        // truncated ignored
        assert_eq!(decode(magic, &packet[..9]), None);
    }

    #[tokio::test]
    async fn test_peers_discover_each_other() {
        let magic = *crate::net::protocol::MAGIC;

        // two discovery points on loopback-distinct ports, talking directly
        let a = Discovery::bind(magic, 0).await.unwrap();
        let b = Discovery::bind(magic, 0).await.unwrap();
        a.announcement.store(1111, Ordering::Relaxed);
        b.announcement.store(2222, Ordering::Relaxed);

        let b_addr = b.socket.local_addr().unwrap();
        let packet = encode(&magic, 1111);
        a.socket.send_to(&packet, b_addr).await.unwrap();

        let discovered = b.poll().await.unwrap();
        assert_eq!(discovered.port, 1111);
    }
}
