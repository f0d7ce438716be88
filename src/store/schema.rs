//! Store key prefixes.
//!
//! These constants define the key prefix bytes used in the RocksDB store.
//!
//! ```text
//! +--------------+------------------------+--------------------------+
//! | KeyPrefix::  | Key::                  | Value::                  |
//! +--------------+------------------------+--------------------------+
//! | 0            | ()                     | alias cursor (SCID)      |
//! | 1            | alias SCID (8B)        | base SCID                |
//! | 2            | ChannelId (32B)        | peer alias SCID          |
//! | 16           | incoming CircuitKey    | PaymentCircuit           |
//! | 17           | incoming CircuitKey    | Keystone outgoing key    |
//! | 32           | batch id               | onion batch decisions    |
//! | 33           | secret hash (32B)      | batch id                 |
//! | 48           | u64 seq (8B)           | ForwardingEvent          |
//! | 255          | ()                     | db version               |
//! +--------------+------------------------+--------------------------+
//! ```

pub(crate) const ALIAS_CURSOR_PREFIX: u8 = 0;
pub(crate) const ALIAS_BASE_PREFIX: u8 = 1;
pub(crate) const PEER_ALIAS_PREFIX: u8 = 2;
pub(crate) const CIRCUIT_PREFIX: u8 = 16;
pub(crate) const KEYSTONE_PREFIX: u8 = 17;
pub(crate) const ONION_BATCH_PREFIX: u8 = 32;
pub(crate) const SHARED_SECRET_PREFIX: u8 = 33;
pub(crate) const FWD_EVENT_PREFIX: u8 = 48;
pub(crate) const DB_VERSION_PREFIX: u8 = 255;

/// Bumped when the layout of any persisted value changes incompatibly.
pub(crate) const DB_VERSION: u32 = 1;
