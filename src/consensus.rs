//! Network-wide consensus constants
//!
//! Every node on the network must agree on these values. Changing any of
//! them is a breaking protocol change, same as changing the protocol magic.

/// Seconds an entry timestamp may lie in the future.
pub const MAX_ENTRY_SKEW_ALLOWED: u32 = 180;

/// Seconds an entry may be old and still propagate through the network.
/// Older entries are served on explicit request only.
pub const MAX_ENTRY_AGE_ALLOWED: u32 = 600;

/// Seconds a request mark may lie in the future.
pub const MAX_REQUEST_SKEW_ALLOWED: u32 = 180;

/// Seconds a request mark may be old before the request is refused.
pub const MAX_REQUEST_AGE_ALLOWED: u32 = 240;

/// Hard age limit for database insertion, roughly 34 years.
pub const MAX_ENTRY_AGE_STORED: u32 = 0x4000_0000;

// max_xxx_name_size
//  - restricting names of new identities and channels keeps shard indexes
//    small and searches fast

/// Maximum identity display name, bytes.
pub const MAX_IDENTITY_NAME_SIZE: usize = 53;

/// Maximum channel name, bytes.
pub const MAX_CHANNEL_NAME_SIZE: usize = 85;

// proof-of-work requirements
//  - announcements are rarer and more valuable, so they cost more

/// Minimum solver time for an ordinary entry, milliseconds.
pub const MIN_ENTRY_POW_TIME: u64 = 500;

/// Minimum cuckoo-cycle complexity for an ordinary entry.
pub const MIN_ENTRY_POW_COMPLEXITY: u32 = 26;

/// Minimum solver time for an identity/channel announcement, milliseconds.
pub const MIN_ANNOUNCEMENT_POW_TIME: u64 = 1500;

/// Minimum cuckoo-cycle complexity for an identity/channel announcement.
pub const MIN_ANNOUNCEMENT_POW_COMPLEXITY: u32 = 27;
