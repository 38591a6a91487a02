//! Persistent peer address sets
//!
//! The node keeps five levels of peers, each a map from address to a small
//! assessment number. Levels persist as one file per address family under
//! `<db>/network/`, records of `port ‖ address bytes ‖ assessment`, all
//! little-endian; files are rewritten on flush only when changed.

use crate::net::address::Address;
use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Peer tiers, most to least trusted. Blacklisted assessments hold the
/// day number the ban lifts instead of a quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Level {
    Core = 0,
    Established = 1,
    Validated = 2,
    Announced = 3,
    Blacklisted = 4,
}

pub const LEVELS: usize = 5;

impl Level {
    pub const ALL: [Level; LEVELS] = [
        Level::Core,
        Level::Established,
        Level::Validated,
        Level::Announced,
        Level::Blacklisted,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Level::Core => "core",
            Level::Established => "established",
            Level::Validated => "validated",
            Level::Announced => "announced",
            Level::Blacklisted => "blacklisted",
        }
    }
}

/// Assessment given to a freshly learned address.
pub const NEW_RECORD_ASSESSMENT: u16 = 0x40;

pub struct PeerSet {
    level: Level,
    directory: PathBuf,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    addresses: BTreeMap<Address, u16>,
    changed: bool,
}

fn family_tag(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    }
}

impl PeerSet {
    pub fn new(directory: &Path, level: Level) -> Self {
        Self {
            level,
            directory: directory.to_path_buf(),
            state: RwLock::new(State::default()),
        }
    }

    fn file(&self, family: u8) -> PathBuf {
        self.directory
            .join(format!("{:02}L{}", family, self.level as usize))
    }

    pub fn insert(&self, address: Address, assessment: u16) {
        let mut state = self.state.write().unwrap();
        state.addresses.insert(address, assessment);
        state.changed = true;
    }

    pub fn erase(&self, address: &Address) -> bool {
        let mut state = self.state.write().unwrap();
        if state.addresses.remove(address).is_some() {
            state.changed = true;
            true
        } else {
            false
        }
    }

    pub fn count(&self, address: &Address) -> bool {
        self.state.read().unwrap().addresses.contains_key(address)
    }

    /// Any port on this IP present?
    pub fn count_ip(&self, address: &Address) -> bool {
        let state = self.state.read().unwrap();
        state.addresses.keys().any(|a| a.ip == address.ip)
    }

    /// First record sharing the IP, any port.
    pub fn find_ip(&self, address: &Address) -> Option<(Address, u16)> {
        let state = self.state.read().unwrap();
        state
            .addresses
            .iter()
            .find(|(a, _)| a.ip == address.ip)
            .map(|(a, assessment)| (*a, *assessment))
    }

    pub fn assessment(&self, address: &Address) -> Option<u16> {
        self.state.read().unwrap().addresses.get(address).copied()
    }

    pub fn empty(&self) -> bool {
        self.state.read().unwrap().addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().addresses.len()
    }

    /// Adjust an address's assessment, saturating at 0 and 0xFFFF; returns
    /// the new value, or None when the address is unknown.
    pub fn adjust(&self, address: &Address, delta: i32) -> Option<u16> {
        let mut state = self.state.write().unwrap();
        let assessment = state.addresses.get_mut(address)?;
        *assessment = (*assessment as i32 + delta).clamp(0, u16::MAX as i32) as u16;
        let value = *assessment;
        state.changed = true;
        Some(value)
    }

    /// Pick an address by a caller-supplied random index, with its
    /// assessment.
    pub fn select(&self, random: usize) -> Option<(Address, u16)> {
        let state = self.state.read().unwrap();
        if state.addresses.is_empty() {
            return None;
        }
        state
            .addresses
            .iter()
            .nth(random % state.addresses.len())
            .map(|(address, assessment)| (*address, *assessment))
    }

    /// Remove every address assessed at or below the threshold.
    pub fn prune(&self, threshold: u16) {
        let mut state = self.state.write().unwrap();
        let before = state.addresses.len();
        state.addresses.retain(|_, assessment| *assessment > threshold);
        if state.addresses.len() != before {
            state.changed = true;
        }
    }

    pub fn load(&self) -> io::Result<()> {
        let mut state = self.state.write().unwrap();
        for family in [1u8, 2] {
            let path = self.file(family);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            let record = 2 + if family == 1 { 4 } else { 16 } + 2;
            for chunk in bytes.chunks_exact(record) {
                let port = u16::from_le_bytes([chunk[0], chunk[1]]);
                let ip = if family == 1 {
                    IpAddr::from(<[u8; 4]>::try_from(&chunk[2..6]).unwrap())
                } else {
                    IpAddr::from(<[u8; 16]>::try_from(&chunk[2..18]).unwrap())
                };
                let assessment =
                    u16::from_le_bytes([chunk[record - 2], chunk[record - 1]]);
                state.addresses.insert(Address { ip, port }, assessment);
            }
            debug!(level = self.level.name(), family, "peer set loaded");
        }
        state.changed = false;
        Ok(())
    }

    /// Rewrite the backing files, only when something changed.
    pub fn save(&self) {
        let mut state = self.state.write().unwrap();
        if !state.changed {
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&self.directory) {
            warn!(level = self.level.name(), error = %e, "peer set directory");
            return;
        }

        for family in [1u8, 2] {
            let mut bytes = Vec::new();
            for (address, assessment) in state.addresses.iter() {
                if family_tag(&address.ip) != family {
                    continue;
                }
                bytes.extend_from_slice(&address.port.to_le_bytes());
                match address.ip {
                    IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
                    IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
                }
                bytes.extend_from_slice(&assessment.to_le_bytes());
            }
            if let Err(e) = std::fs::write(self.file(family), bytes) {
                warn!(level = self.level.name(), family, error = %e, "peer set save failed");
                return;
            }
        }
        state.changed = false;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> Address {
        Address {
            ip: IpAddr::from([10, 0, 0, last]),
            port,
        }
    }

    #[test]
    fn test_insert_adjust_erase() {
        let dir = std::env::temp_dir().join(format!("raddi-peers-a-{}", std::process::id()));
        let set = PeerSet::new(&dir, Level::Validated);

        set.insert(addr(1, 44303), NEW_RECORD_ASSESSMENT);
        assert!(set.count(&addr(1, 44303)));
        assert!(set.count_ip(&addr(1, 9)));
        assert!(!set.count(&addr(2, 44303)));

        assert_eq!(set.adjust(&addr(1, 44303), -1), Some(0x3F));
        assert_eq!(set.adjust(&addr(1, 44303), -0x7F), Some(0));
        assert_eq!(set.adjust(&addr(2, 1), 1), None);

        assert!(set.erase(&addr(1, 44303)));
        assert!(set.empty());
    }

    #[test]
    fn test_select_by_index() {
        let dir = std::env::temp_dir().join(format!("raddi-peers-b-{}", std::process::id()));
        let set = PeerSet::new(&dir, Level::Announced);
        for i in 0..10 {
            set.insert(addr(i, 44303), NEW_RECORD_ASSESSMENT);
        }
        for random in [0usize, 5, 9, 12345] {
            assert!(set.select(random).is_some());
        }
    }

    #[test]
    fn test_file_roundtrip_mixed_families() {
        let dir = std::env::temp_dir().join(format!("raddi-peers-c-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let set = PeerSet::new(&dir, Level::Core);
        set.insert(addr(7, 44303), 0x80);
        set.insert(
            Address {
                ip: "2001:db8::1".parse().unwrap(),
                port: 44304,
            },
            0x22,
        );
        set.save();

        let loaded = PeerSet::new(&dir, Level::Core);
        loaded.load().unwrap();
        assert_eq!(loaded.assessment(&addr(7, 44303)), Some(0x80));
        assert_eq!(
            loaded.assessment(&Address {
                ip: "2001:db8::1".parse().unwrap(),
                port: 44304,
            }),
            Some(0x22)
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_prune_threshold() {
        let dir = std::env::temp_dir().join(format!("raddi-peers-d-{}", std::process::id()));
        let set = PeerSet::new(&dir, Level::Announced);
        set.insert(addr(1, 1), 0);
        set.insert(addr(2, 1), 5);
        set.prune(0);
        assert!(!set.count(&addr(1, 1)));
        assert!(set.count(&addr(2, 1)));
    }
}
