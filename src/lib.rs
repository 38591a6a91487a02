//! RADDI node core
//!
//! A peer-to-peer, append-only discussion network. Every user-facing
//! artifact is a signed, proof-of-work-bearing entry propagating between
//! nodes over encrypted TCP links and stored in a sharded on-disk
//! database.

pub mod consensus;
pub mod crypto;
pub mod db;
pub mod detached;
pub mod entry;
pub mod history;
pub mod net;
pub mod noticed;
pub mod proof;
pub mod source;
pub mod subscriptions;
pub mod types;

pub use db::{Access, Assessment, Db, DbError, DbSettings, Level};
pub use detached::Detached;
pub use entry::Announcement;
pub use net::{Address, CipherMode, Coordinator, CoordinatorSettings, RequestType};
pub use noticed::Noticed;
pub use proof::Requirements;
pub use source::{Command, Source};
pub use subscriptions::{SubscriptionSet, Subscriptions};
pub use types::{Eid, Iid, microtimestamp, now, older};
