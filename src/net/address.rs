//! IPv4/6 peer address abstraction

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// What a validity check should accept. Peers on the local network may
/// exchange private addresses; announcements to internet peers must not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Syntactic validity only; private ranges allowed.
    AllowPrivate,
    /// Globally routable addresses only.
    Routable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Check the address can be connected to at all.
    pub fn valid(&self, validation: Validation) -> bool {
        if self.port == 0 || self.ip.is_unspecified() || self.ip.is_multicast() {
            return false;
        }
        match validation {
            Validation::AllowPrivate => true,
            Validation::Routable => self.accessible(Validation::Routable),
        }
    }

    /// Check the address is internet-accessible. Filters private ranges,
    /// loopback, link-local, documentation, broadcast, multicast and
    /// unspecified; keeps address tables from filling with useless
    /// records.
    pub fn accessible(&self, validation: Validation) -> bool {
        if validation == Validation::AllowPrivate {
            return !self.ip.is_unspecified() && !self.ip.is_multicast();
        }
        match self.ip {
            IpAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
                    && !ip.is_unspecified()
            }
            IpAddr::V6(ip) => {
                if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                    return false;
                }
                let segments = ip.segments();

                // fc00::/7 unique local
                if (segments[0] & 0xfe00) == 0xfc00 {
                    return false;
                }
                // fe80::/10 link-local
                if (segments[0] & 0xffc0) == 0xfe80 {
                    return false;
                }
                // 2001:db8::/32 documentation
                if segments[0] == 0x2001 && segments[1] == 0x0db8 {
                    return false;
                }
                // ::ffff:0:0/96 IPv4-mapped, check the embedded address
                if segments[0..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
                    let v4 = Ipv4Addr::new(
                        (segments[6] >> 8) as u8,
                        segments[6] as u8,
                        (segments[7] >> 8) as u8,
                        segments[7] as u8,
                    );
                    return Address::new(IpAddr::V4(v4), self.port)
                        .accessible(Validation::Routable);
                }
                true
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s.trim()).map(Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display_roundtrip() {
        for text in ["1.2.3.4:44303", "[2001:4860::8888]:44303"] {
            let address: Address = text.parse().unwrap();
            assert_eq!(address.to_string(), text);
        }
    }

    #[test]
    fn test_accessibility() {
        let public: Address = "8.8.8.8:44303".parse().unwrap();
        assert!(public.accessible(Validation::Routable));

        for private in [
            "10.1.2.3:44303",
            "192.168.0.1:44303",
            "127.0.0.1:44303",
            "169.254.1.1:44303",
            "[fe80::1]:44303",
            "[fc00::1]:44303",
            "[2001:db8::1]:44303",
        ] {
            let address: Address = private.parse().unwrap();
            assert!(!address.accessible(Validation::Routable), "{private}");
            assert!(address.valid(Validation::AllowPrivate), "{private}");
        }
    }

    #[test]
    fn test_port_zero_invalid() {
        let address: Address = "8.8.8.8:0".parse().unwrap();
        assert!(!address.valid(Validation::AllowPrivate));
        assert!(!address.valid(Validation::Routable));
    }

    #[test]
    fn test_mapped_v4_follows_embedded() {
        let mapped: Address = "[::ffff:10.0.0.1]:44303".parse().unwrap();
        assert!(!mapped.accessible(Validation::Routable));
        let mapped: Address = "[::ffff:8.8.8.8]:44303".parse().unwrap();
        assert!(mapped.accessible(Validation::Routable));
    }
}
