//! Bootstrap record parsing
//!
//! Initial peers come from DNS records and plain-text seed lists fetched
//! over HTTP; both producers are external. This module parses the records
//! into addresses: `dns:` URIs per RFC 4501 with an optional query type,
//! and seed lists of one `IP[:port]` per line.

use crate::net::address::Address;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tokio::net::lookup_host;
use tracing::debug;

/// TCP port assumed when a record does not carry one.
pub const DEFAULT_PORT: u16 = 44303;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRecordType {
    A,
    Aaaa,
    Txt,
}

/// Parsed `dns:[//authority/]name[:port][?type={A|AAAA|TXT}]` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSeed {
    pub name: String,
    pub port: u16,
    pub record: DnsRecordType,
}

impl FromStr for DnsSeed {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix("dns:")
            .ok_or(BootstrapError::Scheme)?;

        // authority (resolver override) is accepted and ignored
        let rest = match rest.strip_prefix("//") {
            Some(with_authority) => with_authority
                .split_once('/')
                .ok_or(BootstrapError::Malformed)?
                .1,
            None => rest,
        };

        let (rest, record) = match rest.split_once('?') {
            Some((name, query)) => {
                let record = match query.strip_prefix("type=") {
                    Some("A") => DnsRecordType::A,
                    Some("AAAA") => DnsRecordType::Aaaa,
                    Some("TXT") => DnsRecordType::Txt,
                    _ => return Err(BootstrapError::Malformed),
                };
                (name, record)
            }
            None => (rest, DnsRecordType::A),
        };

        let (name, port) = match rest.rsplit_once(':') {
            Some((name, port)) => (
                name,
                port.parse::<u16>().map_err(|_| BootstrapError::Malformed)?,
            ),
            None => (rest, DEFAULT_PORT),
        };
        if name.is_empty() || port == 0 || !name.is_ascii() {
            return Err(BootstrapError::Malformed);
        }

        Ok(Self {
            name: name.to_string(),
            port,
            record,
        })
    }
}

impl DnsSeed {
    /// Resolve A/AAAA seeds through the system resolver. TXT seeds cannot
    /// be resolved here; their strings arrive as additional bootstrap
    /// records from the collaborating fetcher.
    pub async fn resolve(&self) -> io::Result<Vec<Address>> {
        if self.record == DnsRecordType::Txt {
            return Ok(Vec::new());
        }
        let mut addresses = Vec::new();
        for resolved in lookup_host((self.name.as_str(), self.port)).await? {
            let keep = match (self.record, resolved) {
                (DnsRecordType::A, SocketAddr::V4(_)) => true,
                (DnsRecordType::Aaaa, SocketAddr::V6(_)) => true,
                _ => false,
            };
            if keep {
                addresses.push(Address::from(resolved));
            }
        }
        debug!(seed = %self.name, count = addresses.len(), "dns seed resolved");
        Ok(addresses)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("not a dns: URI")]
    Scheme,
    #[error("malformed bootstrap record")]
    Malformed,
}

/// Parse a downloaded seed list: one `IP[:port]` per line, whitespace
/// trimmed; non-ASCII lines and port 0 are rejected, the rest skipped
/// silently so one bad line cannot poison a list.
pub fn parse_seed_list(text: &str) -> Vec<Address> {
    let mut addresses = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || !line.is_ascii() {
            continue;
        }
        let address = match line.parse::<SocketAddr>() {
            Ok(resolved) => Address::from(resolved),
            Err(_) => match line.parse::<IpAddr>() {
                Ok(ip) => Address::new(ip, DEFAULT_PORT),
                Err(_) => continue,
            },
        };
        if address.port != 0 {
            addresses.push(address);
        }
    }
    addresses
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_uri_forms() {
        let seed: DnsSeed = "dns:seed.raddi.net".parse().unwrap();
        assert_eq!(seed.name, "seed.raddi.net");
        assert_eq!(seed.port, DEFAULT_PORT);
        assert_eq!(seed.record, DnsRecordType::A);

        let seed: DnsSeed = "dns:seed.raddi.net:999?type=AAAA".parse().unwrap();
        assert_eq!(seed.port, 999);
        assert_eq!(seed.record, DnsRecordType::Aaaa);

        let seed: DnsSeed = "dns://9.9.9.9/seed.raddi.net?type=TXT".parse().unwrap();
        assert_eq!(seed.name, "seed.raddi.net");
        assert_eq!(seed.record, DnsRecordType::Txt);
    }

    #[test]
    fn test_dns_uri_rejects() {
        assert!("http://x".parse::<DnsSeed>().is_err());
        assert!("dns:".parse::<DnsSeed>().is_err());
        assert!("dns:host:0".parse::<DnsSeed>().is_err());
        assert!("dns:host?type=MX".parse::<DnsSeed>().is_err());
    }

    #[test]
    fn test_seed_list_parsing() {
        let text = "  1.2.3.4:44303 \n5.6.7.8\n\nnot-an-ip\n9.9.9.9:0\n[2001:db8::1]:7\n";
        let addresses = parse_seed_list(text);
        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[0], "1.2.3.4:44303".parse().unwrap());
        assert_eq!(addresses[1].port, DEFAULT_PORT);
        assert_eq!(addresses[2], "[2001:db8::1]:7".parse().unwrap());
    }
}
