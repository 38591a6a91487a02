//! P2P networking layer

pub mod address;
pub mod bootstrap;
pub mod connection;
pub mod coordinator;
pub mod discovery;
pub mod protocol;
pub mod request;

pub use address::{Address, Validation};
pub use bootstrap::{DnsRecordType, DnsSeed, parse_seed_list};
pub use connection::{Connection, State};
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use discovery::Discovery;
pub use protocol::{AcceptError, CipherKind, CipherMode, CipherPair, InitialHead, MAGIC, Proposal};
pub use request::{Download, NewPeer, RequestType};
