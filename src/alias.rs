//! The alias manager: allocates short-channel-id aliases from the reserved
//! range and tracks alias→base and peer-alias mappings.

use crate::store::Store;
use crate::types::{ChannelId, ShortChannelId, ALIAS_START_BLOCK_HEIGHT};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// The first alias ever issued.
pub const STARTING_ALIAS: ShortChannelId = ShortChannelId::new(ALIAS_START_BLOCK_HEIGHT, 0, 0);

/// The next alias in the sequence: tx position rolls into tx index, tx index
/// rolls into block height.
pub fn get_next_scid(current: ShortChannelId) -> ShortChannelId {
    let (tx_position, carry) = match current.tx_position {
        0xffff => (0, true),
        position => (position + 1, false),
    };
    let (tx_index, carry) = match (current.tx_index, carry) {
        (index, false) => (index, false),
        (0x00ff_ffff, true) => (0, true),
        (index, true) => (index + 1, false),
    };
    let block_height = if carry {
        current.block_height + 1
    } else {
        current.block_height
    };
    ShortChannelId {
        block_height,
        tx_index,
        tx_position,
    }
}

/// Persistence operations of the alias manager. Implemented by the rocksdb
/// [`Store`]; tests may substitute an in-memory variant.
pub trait AliasStore: Send + Sync {
    fn get_alias_cursor(&self) -> Option<ShortChannelId>;
    fn put_alias_cursor(&self, alias: ShortChannelId);
    fn put_local_alias(&self, alias: ShortChannelId, base: ShortChannelId);
    fn delete_local_alias(&self, alias: ShortChannelId);
    fn list_local_aliases(&self) -> Vec<(ShortChannelId, ShortChannelId)>;
    fn put_peer_alias(&self, channel_id: ChannelId, alias: ShortChannelId);
    fn get_peer_alias(&self, channel_id: ChannelId) -> Option<ShortChannelId>;
}

#[derive(Default)]
struct AliasState {
    /// The last alias issued, if any.
    cursor: Option<ShortChannelId>,
    /// Each alias maps to at most one base.
    alias_to_base: HashMap<u64, ShortChannelId>,
    base_to_aliases: HashMap<u64, HashSet<ShortChannelId>>,
}

/// Allocates and resolves SCID aliases. All operations serialize on an
/// internal lock; issuance is monotonic and survives restarts through the
/// store cursor.
pub struct AliasManager<S> {
    store: S,
    state: Mutex<AliasState>,
}

impl<S: AliasStore> AliasManager<S> {
    pub fn new(store: S) -> Self {
        let mut state = AliasState {
            cursor: store.get_alias_cursor(),
            ..Default::default()
        };
        for (alias, base) in store.list_local_aliases() {
            state.alias_to_base.insert(alias.to_u64(), base);
            state
                .base_to_aliases
                .entry(base.to_u64())
                .or_default()
                .insert(alias);
        }
        Self {
            store,
            state: Mutex::new(state),
        }
    }

    /// The next alias in the alias SCID space. Persists the cursor before
    /// returning so a restart never re-issues an alias.
    pub fn request_alias(&self) -> ShortChannelId {
        let mut state = self.state.lock().expect("alias lock");
        let alias = match state.cursor {
            Some(current) => get_next_scid(current),
            None => STARTING_ALIAS,
        };
        self.store.put_alias_cursor(alias);
        state.cursor = Some(alias);
        debug!("issued alias {}", alias);
        alias
    }

    /// Register an alias→base mapping. Multiple aliases per base are allowed.
    /// `gossip` marks aliases that may appear in announcements; the manager
    /// records both kinds identically.
    pub fn add_local_alias(
        &self,
        alias: ShortChannelId,
        base: ShortChannelId,
        _gossip: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("alias lock");
        if let Some(existing) = state.alias_to_base.get(&alias.to_u64()) {
            if *existing != base {
                return Err(Error::InvalidParameter(format!(
                    "alias {} already maps to {}",
                    alias, existing
                )));
            }
        }
        self.store.put_local_alias(alias, base);
        state.alias_to_base.insert(alias.to_u64(), base);
        state
            .base_to_aliases
            .entry(base.to_u64())
            .or_default()
            .insert(alias);
        Ok(())
    }

    /// Remove an alias→base pair. Fails when the pair is absent; removing the
    /// last alias leaves an empty set.
    pub fn delete_local_alias(&self, alias: ShortChannelId, base: ShortChannelId) -> Result<()> {
        let mut state = self.state.lock().expect("alias lock");
        match state.alias_to_base.get(&alias.to_u64()) {
            Some(existing) if *existing == base => {}
            _ => return Err(Error::AliasNotFound),
        }
        self.store.delete_local_alias(alias);
        state.alias_to_base.remove(&alias.to_u64());
        if let Some(aliases) = state.base_to_aliases.get_mut(&base.to_u64()) {
            aliases.remove(&alias);
        }
        Ok(())
    }

    /// All aliases registered for a base, order-independent.
    pub fn get_aliases(&self, base: ShortChannelId) -> HashSet<ShortChannelId> {
        let state = self.state.lock().expect("alias lock");
        state
            .base_to_aliases
            .get(&base.to_u64())
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve an alias to its base, if registered.
    pub fn find_base_scid(&self, alias: ShortChannelId) -> Option<ShortChannelId> {
        let state = self.state.lock().expect("alias lock");
        state.alias_to_base.get(&alias.to_u64()).copied()
    }

    /// Record the alias the peer asked us to use for a channel.
    pub fn put_peer_alias(&self, channel_id: ChannelId, alias: ShortChannelId) {
        self.store.put_peer_alias(channel_id, alias);
    }

    pub fn get_peer_alias(&self, channel_id: ChannelId) -> Option<ShortChannelId> {
        self.store.get_peer_alias(channel_id)
    }
}

// The production implementation over rocksdb.
impl AliasStore for Store {
    fn get_alias_cursor(&self) -> Option<ShortChannelId> {
        self.get([crate::store::ALIAS_CURSOR_PREFIX])
            .map(|raw| crate::store::deserialize_from(&raw, "alias cursor"))
    }

    fn put_alias_cursor(&self, alias: ShortChannelId) {
        self.put(
            [crate::store::ALIAS_CURSOR_PREFIX],
            crate::store::serialize_to_vec(&alias, "alias cursor"),
        );
    }

    fn put_local_alias(&self, alias: ShortChannelId, base: ShortChannelId) {
        let mut key = vec![crate::store::ALIAS_BASE_PREFIX];
        key.extend_from_slice(&alias.to_u64().to_be_bytes());
        self.put(key, crate::store::serialize_to_vec(&base, "alias base"));
    }

    fn delete_local_alias(&self, alias: ShortChannelId) {
        let mut key = vec![crate::store::ALIAS_BASE_PREFIX];
        key.extend_from_slice(&alias.to_u64().to_be_bytes());
        self.delete(key);
    }

    fn list_local_aliases(&self) -> Vec<(ShortChannelId, ShortChannelId)> {
        self.prefix_iterator(&[crate::store::ALIAS_BASE_PREFIX])
            .map(|(key, value)| {
                let scid_bytes: [u8; 8] = key[1..9].try_into().expect("alias key length");
                (
                    ShortChannelId::from_u64(u64::from_be_bytes(scid_bytes)),
                    crate::store::deserialize_from(&value, "alias base"),
                )
            })
            .collect()
    }

    fn put_peer_alias(&self, channel_id: ChannelId, alias: ShortChannelId) {
        let mut key = vec![crate::store::PEER_ALIAS_PREFIX];
        key.extend_from_slice(channel_id.as_ref());
        self.put(key, crate::store::serialize_to_vec(&alias, "peer alias"));
    }

    fn get_peer_alias(&self, channel_id: ChannelId) -> Option<ShortChannelId> {
        let mut key = vec![crate::store::PEER_ALIAS_PREFIX];
        key.extend_from_slice(channel_id.as_ref());
        self.get(key)
            .map(|raw| crate::store::deserialize_from(&raw, "peer alias"))
    }
}
