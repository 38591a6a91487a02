//! Source directory intake
//!
//! Client applications hand entries and commands to the node by dropping
//! files into a watched directory. Files at least as large as the smallest
//! entry are entries; smaller ones are commands. Processed files are
//! overwritten with random bytes before removal so no trace of the
//! original content survives on disk.

use crate::entry;
use crate::net::address::Address;
use crate::net::coordinator::Coordinator;
use crate::net::request::{Download, RequestType};
use crate::types::Eid;
use rand::RngCore;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Poll interval of the directory scan.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Largest file the intake reads: a full entry plus a little slack.
const MAX_FILE_SIZE: usize = entry::MAX_SIZE + 17;

// =============================================================================
// COMMANDS
// =============================================================================

/// Client application commands, u32 type followed by a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Test,
    SetLogLevel(u32),
    SetDisplayLevel(u32),
    Optimize,

    AddPeer(Address),
    RemPeer(Address),
    BanPeer(Address),
    UnbanPeer(Address),
    AddCorePeer(Address),
    ConnectPeer(Address),

    Download(Download),
    Erase(Eid),
    EraseThorough(Eid),

    Subscribe(Uuid, Eid),
    Unsubscribe(Uuid, Eid),
    Blacklist(Uuid, Eid),
    Unblacklist(Uuid, Eid),
    Retain(Uuid, Eid),
    Unretain(Uuid, Eid),
}

fn encode_address(address: &Address, bytes: &mut Vec<u8>) {
    bytes.extend_from_slice(&address.port.to_le_bytes());
    match address.ip {
        IpAddr::V4(ip) => {
            bytes.push(1);
            bytes.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            bytes.push(2);
            bytes.extend_from_slice(&ip.octets());
        }
    }
}

fn decode_address(payload: &[u8]) -> Option<Address> {
    let port = u16::from_le_bytes(payload.get(0..2)?.try_into().ok()?);
    let ip = match payload.get(2)? {
        1 if payload.len() == 7 => IpAddr::from(<[u8; 4]>::try_from(&payload[3..7]).ok()?),
        2 if payload.len() == 19 => IpAddr::from(<[u8; 16]>::try_from(&payload[3..19]).ok()?),
        _ => return None,
    };
    Some(Address::new(ip, port))
}

fn decode_subscription(payload: &[u8]) -> Option<(Uuid, Eid)> {
    if payload.len() != Eid::SIZE + 16 {
        return None;
    }
    let id = Eid::read_from(&payload[0..12]);
    let app = Uuid::from_bytes(payload[12..28].try_into().ok()?);
    Some((app, id))
}

impl Command {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32);
        let (kind, _) = self.wire_parts();
        bytes.extend_from_slice(&kind.to_le_bytes());
        match self {
            Command::Test | Command::Optimize => {}
            Command::SetLogLevel(level) | Command::SetDisplayLevel(level) => {
                bytes.extend_from_slice(&level.to_le_bytes());
            }
            Command::AddPeer(a)
            | Command::RemPeer(a)
            | Command::BanPeer(a)
            | Command::UnbanPeer(a)
            | Command::AddCorePeer(a)
            | Command::ConnectPeer(a) => encode_address(a, &mut bytes),
            Command::Download(download) => bytes.extend_from_slice(&download.to_bytes()),
            Command::Erase(id) | Command::EraseThorough(id) => {
                bytes.extend_from_slice(&id.to_bytes());
            }
            Command::Subscribe(app, id)
            | Command::Unsubscribe(app, id)
            | Command::Blacklist(app, id)
            | Command::Unblacklist(app, id)
            | Command::Retain(app, id)
            | Command::Unretain(app, id) => {
                bytes.extend_from_slice(&id.to_bytes());
                bytes.extend_from_slice(app.as_bytes());
            }
        }
        bytes
    }

    fn wire_parts(&self) -> (u32, &'static str) {
        match self {
            Command::Test => (0x00, "test"),
            Command::SetLogLevel(_) => (0x01, "set log level"),
            Command::SetDisplayLevel(_) => (0x02, "set display level"),
            Command::Optimize => (0x03, "optimize"),
            Command::AddPeer(_) => (0x10, "add peer"),
            Command::RemPeer(_) => (0x11, "remove peer"),
            Command::BanPeer(_) => (0x12, "ban peer"),
            Command::UnbanPeer(_) => (0x13, "unban peer"),
            Command::AddCorePeer(_) => (0x1A, "add core peer"),
            Command::ConnectPeer(_) => (0x1C, "connect peer"),
            Command::Download(_) => (0x20, "download"),
            Command::Erase(_) => (0x21, "erase"),
            Command::EraseThorough(_) => (0x22, "thorough erase"),
            Command::Subscribe(..) => (0x30, "subscribe"),
            Command::Unsubscribe(..) => (0x31, "unsubscribe"),
            Command::Blacklist(..) => (0x32, "blacklist"),
            Command::Unblacklist(..) => (0x33, "unblacklist"),
            Command::Retain(..) => (0x34, "retain"),
            Command::Unretain(..) => (0x35, "unretain"),
        }
    }

    pub fn name(&self) -> &'static str {
        self.wire_parts().1
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let kind = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let payload = &bytes[4..];

        let level = || {
            payload
                .get(0..4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
        };
        let eid = || {
            (payload.len() == Eid::SIZE).then(|| Eid::read_from(payload))
        };

        Some(match kind {
            0x00 => Command::Test,
            0x01 => Command::SetLogLevel(level()?),
            0x02 => Command::SetDisplayLevel(level()?),
            0x03 => Command::Optimize,
            0x10 => Command::AddPeer(decode_address(payload)?),
            0x11 => Command::RemPeer(decode_address(payload)?),
            0x12 => Command::BanPeer(decode_address(payload)?),
            0x13 => Command::UnbanPeer(decode_address(payload)?),
            0x1A => Command::AddCorePeer(decode_address(payload)?),
            0x1C => Command::ConnectPeer(decode_address(payload)?),
            0x20 => Command::Download(Download::parse(payload)?),
            0x21 => Command::Erase(eid()?),
            0x22 => Command::EraseThorough(eid()?),
            0x30 => {
                let (app, id) = decode_subscription(payload)?;
                Command::Subscribe(app, id)
            }
            0x31 => {
                let (app, id) = decode_subscription(payload)?;
                Command::Unsubscribe(app, id)
            }
            0x32 => {
                let (app, id) = decode_subscription(payload)?;
                Command::Blacklist(app, id)
            }
            0x33 => {
                let (app, id) = decode_subscription(payload)?;
                Command::Unblacklist(app, id)
            }
            0x34 => {
                let (app, id) = decode_subscription(payload)?;
                Command::Retain(app, id)
            }
            0x35 => {
                let (app, id) = decode_subscription(payload)?;
                Command::Unretain(app, id)
            }
            _ => return None,
        })
    }
}

// =============================================================================
// SOURCE DIRECTORY
// =============================================================================

pub struct Source {
    path: PathBuf,
    set_log_level: Option<Box<dyn Fn(u32) + Send + Sync>>,
}

impl Source {
    pub fn new(path: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(path)?;
        info!(path = %path.display(), "source directory ready");
        Ok(Self {
            path: path.to_path_buf(),
            set_log_level: None,
        })
    }

    /// Wire up the log-level command to the subscriber reload handle.
    pub fn on_set_log_level(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.set_log_level = Some(Box::new(callback));
        self
    }

    /// Poll loop; runs until the coordinator terminates.
    pub async fn run(self, coordinator: Arc<Coordinator>) {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let entries = match std::fs::read_dir(&self.path) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "source directory unreadable");
                    continue;
                }
            };
            for file in entries.flatten() {
                if file.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    self.process_file(&file.path(), &coordinator).await;
                }
            }
        }
    }

    async fn process_file(&self, path: &Path, coordinator: &Arc<Coordinator>) {
        let mut file = match std::fs::OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                // sharing violation; another writer still has it, re-queue
                debug!(file = %path.display(), "source file busy, retrying");
                return;
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "source file unreadable");
                return;
            }
        };

        let mut message = Vec::with_capacity(4096);
        if std::io::Read::by_ref(&mut file)
            .take(MAX_FILE_SIZE as u64)
            .read_to_end(&mut message)
            .is_err()
        {
            return;
        }

        if message.len() >= entry::MIN_SIZE {
            debug!(file = %path.display(), size = message.len(), "source entry");
            if !coordinator.submit(&message).await {
                error!(file = %path.display(), "source entry refused");
            }
        } else if let Some(command) = Command::parse(&message) {
            debug!(file = %path.display(), command = command.name(), "source command");
            self.dispatch(command, coordinator).await;
        } else {
            debug!(file = %path.display(), "source file too small, ignored");
        }

        // destroy traces before deleting: overwrite the content, then
        // extend to maximum size so all removed files look alike
        let mut noise = vec![0u8; message.len().max(1)];
        rand::rngs::OsRng.fill_bytes(&mut noise);
        let _ = file.seek(SeekFrom::Start(0));
        let _ = file.write_all(&noise);

        let mut noise = vec![0u8; MAX_FILE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut noise);
        let _ = file.seek(SeekFrom::Start(0));
        let _ = file.write_all(&noise);
        let _ = file.sync_all();
        drop(file);

        if let Err(e) = std::fs::remove_file(path) {
            warn!(file = %path.display(), error = %e, "source file removal failed");
        }
    }

    async fn dispatch(&self, command: Command, coordinator: &Arc<Coordinator>) {
        use crate::db::Level;
        match command {
            Command::Test => {}
            Command::SetLogLevel(level) | Command::SetDisplayLevel(level) => {
                match &self.set_log_level {
                    Some(callback) => callback(level),
                    None => warn!(level, "log level command without reload support"),
                }
            }
            Command::Optimize => coordinator.database.optimize(true),

            Command::AddPeer(address) => coordinator.add(Level::Announced, address),
            Command::AddCorePeer(address) => coordinator.add(Level::Core, address),
            Command::RemPeer(address) => {
                for peers in &coordinator.database.peers {
                    peers.erase(&address);
                }
            }
            Command::BanPeer(address) => coordinator.ban(&address, 365),
            Command::UnbanPeer(address) => coordinator.ban(&address, 0),
            Command::ConnectPeer(address) => coordinator.connect(address),

            Command::Download(download) => {
                coordinator
                    .broadcast_request(RequestType::Download, &download.to_bytes())
                    .await;
            }
            Command::Erase(id) => {
                if let Err(e) = coordinator.database.erase(&id, false) {
                    error!(entry = %id, error = %e, "erase failed");
                }
            }
            Command::EraseThorough(id) => {
                if let Err(e) = coordinator.database.erase(&id, true) {
                    error!(entry = %id, error = %e, "thorough erase failed");
                }
            }

            Command::Subscribe(app, id) => coordinator.subscribe(&app, &id).await,
            Command::Unsubscribe(app, id) => {
                coordinator.unsubscribe(&app, &id).await;
            }
            Command::Blacklist(app, id) => coordinator.blacklist.subscribe(&app, &id),
            Command::Unblacklist(app, id) => {
                coordinator.blacklist.unsubscribe(&app, &id);
            }
            Command::Retain(app, id) => coordinator.retained.subscribe(&app, &id),
            Command::Unretain(app, id) => {
                coordinator.retained.unsubscribe(&app, &id);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Iid;

    fn eid() -> Eid {
        Eid {
            timestamp: 1000,
            identity: Iid {
                timestamp: 900,
                nonce: 7,
            },
        }
    }

    #[test]
    fn test_command_roundtrip() {
        let app = Uuid::new_v4();
        let commands = [
            Command::Test,
            Command::SetLogLevel(2),
            Command::Optimize,
            Command::AddPeer("4.3.2.1:44303".parse().unwrap()),
            Command::BanPeer("[2001:db8::5]:44303".parse().unwrap()),
            Command::Download(Download {
                parent: eid(),
                threshold: 555,
            }),
            Command::Erase(eid()),
            Command::Subscribe(app, eid()),
            Command::Unretain(app, eid()),
        ];
        for command in commands {
            let bytes = command.to_bytes();
            assert_eq!(Command::parse(&bytes), Some(command), "{}", command.name());
        }
    }

    #[test]
    fn test_command_rejects_garbage() {
        assert_eq!(Command::parse(&[]), None);
        assert_eq!(Command::parse(&[0xFF, 0, 0, 0]), None);
        // truncated address payload
        let mut bytes = Command::AddPeer("1.1.1.1:1".parse().unwrap()).to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert_eq!(Command::parse(&bytes), None);
    }

    #[test]
    fn test_commands_stay_below_entry_threshold() {
        let app = Uuid::new_v4();
        for command in [
            Command::Download(Download {
                parent: eid(),
                threshold: 1,
            }),
            Command::Subscribe(app, eid()),
            Command::BanPeer("[2001:db8::5]:44303".parse().unwrap()),
        ] {
            assert!(command.to_bytes().len() < entry::MIN_SIZE);
        }
    }
}
