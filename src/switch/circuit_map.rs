//! The persistent payment circuit map.
//!
//! All mutations are funneled through the switch actor, which keeps the
//! uniqueness invariants: one open circuit per incoming key and per outgoing
//! key. The in-memory indexes are a cache over the store; every transition is
//! durable before the in-memory state advances.

use super::circuit::{CircuitKey, Keystone, PaymentCircuit};
use crate::store::Store;
use crate::types::{Hash256, ShortChannelId};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitError {
    #[error("duplicate add for incoming key {0}")]
    DuplicateAdd(CircuitKey),
    #[error("unknown circuit for key {0}")]
    UnknownCircuit(CircuitKey),
    #[error("circuit for key {0} already closed")]
    AlreadyClosed(CircuitKey),
    #[error("circuit persistence failed: {0}")]
    Persistence(String),
}

/// The outcome of a `commit_circuits` batch.
#[derive(Debug, Default)]
pub struct CircuitFwdActions {
    /// Circuits committed as pending; forward these.
    pub adds: Vec<PaymentCircuit>,
    /// Duplicate incoming keys with conflicting contents; fail these.
    pub drops: Vec<PaymentCircuit>,
    /// Retransmissions of an existing circuit; ack them, do not forward
    /// twice.
    pub dups: Vec<PaymentCircuit>,
}

/// Persistence operations of the circuit map, batch-atomic per call.
pub trait CircuitStore: Send + Sync {
    fn load_circuits(&self) -> Vec<PaymentCircuit>;
    fn load_keystones(&self) -> Vec<Keystone>;
    fn put_circuits(&self, circuits: &[PaymentCircuit]) -> Result<(), String>;
    fn put_keystones(&self, keystones: &[Keystone]) -> Result<(), String>;
    fn delete_keystones(&self, in_keys: &[CircuitKey]) -> Result<(), String>;
    /// Remove circuits and their keystones.
    fn delete_circuits(&self, in_keys: &[CircuitKey]) -> Result<(), String>;
}

#[derive(Default)]
struct CircuitMapState {
    /// Every live circuit, keyed by incoming key. Pending and open alike.
    circuits: HashMap<CircuitKey, PaymentCircuit>,
    /// Open circuits: outgoing key back to incoming key.
    opened: HashMap<CircuitKey, CircuitKey>,
    /// Incoming keys whose teardown is in flight.
    closing: HashSet<CircuitKey>,
    hash_index: HashMap<Hash256, HashSet<CircuitKey>>,
}

impl CircuitMapState {
    fn index_insert(&mut self, circuit: &PaymentCircuit) {
        self.hash_index
            .entry(circuit.payment_hash)
            .or_default()
            .insert(circuit.incoming);
    }

    fn index_remove(&mut self, circuit: &PaymentCircuit) {
        if let Some(keys) = self.hash_index.get_mut(&circuit.payment_hash) {
            keys.remove(&circuit.incoming);
            if keys.is_empty() {
                self.hash_index.remove(&circuit.payment_hash);
            }
        }
    }
}

/// The crash-safe many-to-one index from incoming HTLCs to committed
/// outgoing HTLCs.
pub struct CircuitMap<S> {
    store: S,
    state: RwLock<CircuitMapState>,
}

impl<S: CircuitStore> CircuitMap<S> {
    /// Rebuild the in-memory indexes from the persistent records. A keystone
    /// whose circuit is gone is a torn teardown; it is dropped here so a
    /// replayed response cannot resurrect it.
    pub fn new(store: S) -> Result<Self, CircuitError> {
        let mut state = CircuitMapState::default();
        for circuit in store.load_circuits() {
            state.index_insert(&circuit);
            state.circuits.insert(circuit.incoming, circuit);
        }

        let mut orphans = Vec::new();
        for keystone in store.load_keystones() {
            match state.circuits.get_mut(&keystone.in_key) {
                Some(circuit) => {
                    circuit.outgoing = Some(keystone.out_key);
                    state.opened.insert(keystone.out_key, keystone.in_key);
                }
                None => {
                    warn!(
                        "dropping keystone without circuit: {} -> {}",
                        keystone.in_key, keystone.out_key
                    );
                    orphans.push(keystone.in_key);
                }
            }
        }
        if !orphans.is_empty() {
            store
                .delete_keystones(&orphans)
                .map_err(CircuitError::Persistence)?;
        }

        Ok(Self {
            store,
            state: RwLock::new(state),
        })
    }

    /// Commit a batch of circuits. The batch persists atomically: either all
    /// fresh adds are durable or none are, in which case the whole batch
    /// fails with a persistence error.
    pub fn commit_circuits(
        &self,
        circuits: Vec<PaymentCircuit>,
    ) -> Result<CircuitFwdActions, CircuitError> {
        let mut actions = CircuitFwdActions::default();
        let mut state = self.state.write().expect("circuit map lock");

        let mut batch_keys = HashSet::new();
        for circuit in circuits {
            let existing = state.circuits.get(&circuit.incoming);
            let duplicate_in_batch = batch_keys.contains(&circuit.incoming);
            match existing {
                Some(existing)
                    if !duplicate_in_batch
                        && existing.matches(
                            circuit.payment_hash,
                            circuit.incoming_amount,
                            circuit.outgoing_amount,
                        ) =>
                {
                    // Same add seen again: replay after restart. The caller
                    // acks it without forwarding a second time.
                    actions.dups.push(circuit);
                }
                Some(_) => {
                    actions.drops.push(circuit);
                }
                None if duplicate_in_batch => {
                    actions.drops.push(circuit);
                }
                None => {
                    batch_keys.insert(circuit.incoming);
                    actions.adds.push(circuit);
                }
            }
        }

        if !actions.adds.is_empty() {
            self.store
                .put_circuits(&actions.adds)
                .map_err(CircuitError::Persistence)?;
            for circuit in &actions.adds {
                state.index_insert(circuit);
                state.circuits.insert(circuit.incoming, circuit.clone());
            }
        }
        debug!(
            "committed circuit batch: {} adds, {} drops, {} dups",
            actions.adds.len(),
            actions.drops.len(),
            actions.dups.len()
        );
        Ok(actions)
    }

    /// Attach outgoing keys to pending circuits, transitioning them to open.
    /// Every keystone must reference a pending circuit, and outgoing keys
    /// must be fresh across open circuits.
    pub fn open_circuits(&self, keystones: Vec<Keystone>) -> Result<(), CircuitError> {
        let mut state = self.state.write().expect("circuit map lock");

        for keystone in &keystones {
            let circuit = state
                .circuits
                .get(&keystone.in_key)
                .ok_or(CircuitError::UnknownCircuit(keystone.in_key))?;
            match circuit.outgoing {
                // Replays of the same keystone are no-ops below.
                Some(existing) if existing == keystone.out_key => {}
                Some(_) => return Err(CircuitError::DuplicateAdd(keystone.in_key)),
                None => {
                    if state.opened.contains_key(&keystone.out_key) {
                        return Err(CircuitError::DuplicateAdd(keystone.out_key));
                    }
                }
            }
        }

        self.store
            .put_keystones(&keystones)
            .map_err(CircuitError::Persistence)?;

        for keystone in keystones {
            if let Some(circuit) = state.circuits.get_mut(&keystone.in_key) {
                circuit.outgoing = Some(keystone.out_key);
            }
            state.opened.insert(keystone.out_key, keystone.in_key);
        }
        Ok(())
    }

    /// Roll back the keystones of open circuits whose outgoing id is at or
    /// beyond `start_id` on the given channel. Used after a commitment sign
    /// failure to discard speculative outgoing adds.
    pub fn trim_open_circuits(
        &self,
        chan_id: ShortChannelId,
        start_id: u64,
    ) -> Result<(), CircuitError> {
        let mut state = self.state.write().expect("circuit map lock");
        let trimmed: Vec<(CircuitKey, CircuitKey)> = state
            .opened
            .iter()
            .filter(|(out_key, _)| out_key.chan_id == chan_id && out_key.htlc_id >= start_id)
            .map(|(out_key, in_key)| (*out_key, *in_key))
            .collect();
        if trimmed.is_empty() {
            return Ok(());
        }

        let in_keys: Vec<CircuitKey> = trimmed.iter().map(|(_, in_key)| *in_key).collect();
        self.store
            .delete_keystones(&in_keys)
            .map_err(CircuitError::Persistence)?;

        for (out_key, in_key) in trimmed {
            state.opened.remove(&out_key);
            if let Some(circuit) = state.circuits.get_mut(&in_key) {
                circuit.outgoing = None;
            }
        }
        Ok(())
    }

    /// Mark the circuit behind an outgoing key as in-flight for teardown and
    /// return it. Calling again for the same circuit returns it unchanged.
    pub fn close_circuit(&self, out_key: CircuitKey) -> Result<PaymentCircuit, CircuitError> {
        let mut state = self.state.write().expect("circuit map lock");
        let in_key = *state
            .opened
            .get(&out_key)
            .ok_or(CircuitError::UnknownCircuit(out_key))?;
        let circuit = state
            .circuits
            .get(&in_key)
            .cloned()
            .ok_or(CircuitError::UnknownCircuit(in_key))?;
        state.closing.insert(in_key);
        Ok(circuit)
    }

    /// Teardown for a circuit that never produced an outgoing add.
    pub fn fail_circuit(&self, in_key: CircuitKey) -> Result<PaymentCircuit, CircuitError> {
        let mut state = self.state.write().expect("circuit map lock");
        let circuit = state
            .circuits
            .get(&in_key)
            .cloned()
            .ok_or(CircuitError::UnknownCircuit(in_key))?;
        if state.closing.contains(&in_key) {
            return Err(CircuitError::AlreadyClosed(in_key));
        }
        state.closing.insert(in_key);
        Ok(circuit)
    }

    /// Terminal removal once the response has been delivered and acked.
    pub fn delete_circuits(&self, in_keys: &[CircuitKey]) -> Result<(), CircuitError> {
        self.store
            .delete_circuits(in_keys)
            .map_err(CircuitError::Persistence)?;
        let mut state = self.state.write().expect("circuit map lock");
        for in_key in in_keys {
            if let Some(circuit) = state.circuits.remove(in_key) {
                state.index_remove(&circuit);
                if let Some(out_key) = circuit.outgoing {
                    state.opened.remove(&out_key);
                }
            }
            state.closing.remove(in_key);
        }
        Ok(())
    }

    pub fn lookup_circuit(&self, in_key: CircuitKey) -> Option<PaymentCircuit> {
        self.state
            .read()
            .expect("circuit map lock")
            .circuits
            .get(&in_key)
            .cloned()
    }

    pub fn lookup_open_circuit(&self, out_key: CircuitKey) -> Option<PaymentCircuit> {
        let state = self.state.read().expect("circuit map lock");
        let in_key = state.opened.get(&out_key)?;
        state.circuits.get(in_key).cloned()
    }

    pub fn lookup_by_payment_hash(&self, hash: Hash256) -> Vec<PaymentCircuit> {
        let state = self.state.read().expect("circuit map lock");
        state
            .hash_index
            .get(&hash)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| state.circuits.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn num_pending(&self) -> usize {
        let state = self.state.read().expect("circuit map lock");
        state.circuits.len() - state.opened.len()
    }

    pub fn num_open(&self) -> usize {
        self.state.read().expect("circuit map lock").opened.len()
    }
}

// The production implementation over rocksdb.
impl CircuitStore for Store {
    fn load_circuits(&self) -> Vec<PaymentCircuit> {
        self.prefix_iterator(&[crate::store::CIRCUIT_PREFIX])
            .map(|(_, value)| crate::store::deserialize_from(&value, "payment circuit"))
            .collect()
    }

    fn load_keystones(&self) -> Vec<Keystone> {
        self.prefix_iterator(&[crate::store::KEYSTONE_PREFIX])
            .map(|(key, value)| Keystone {
                in_key: CircuitKey::from_bytes(&key[1..]).expect("keystone key length"),
                out_key: crate::store::deserialize_from(&value, "keystone"),
            })
            .collect()
    }

    fn put_circuits(&self, circuits: &[PaymentCircuit]) -> Result<(), String> {
        let mut batch = self.batch();
        for circuit in circuits {
            let mut key = vec![crate::store::CIRCUIT_PREFIX];
            key.extend_from_slice(&circuit.incoming.to_bytes());
            batch.put(key, crate::store::serialize_to_vec(circuit, "payment circuit"));
        }
        batch.commit()
    }

    fn put_keystones(&self, keystones: &[Keystone]) -> Result<(), String> {
        let mut batch = self.batch();
        for keystone in keystones {
            let mut key = vec![crate::store::KEYSTONE_PREFIX];
            key.extend_from_slice(&keystone.in_key.to_bytes());
            batch.put(key, crate::store::serialize_to_vec(&keystone.out_key, "keystone"));

            // Keep the stored circuit in sync so a restart sees the open
            // state directly.
            let mut circuit_key = vec![crate::store::CIRCUIT_PREFIX];
            circuit_key.extend_from_slice(&keystone.in_key.to_bytes());
            if let Some(raw) = batch.get(&circuit_key) {
                let mut circuit: PaymentCircuit =
                    crate::store::deserialize_from(&raw, "payment circuit");
                circuit.outgoing = Some(keystone.out_key);
                batch.put(
                    circuit_key,
                    crate::store::serialize_to_vec(&circuit, "payment circuit"),
                );
            }
        }
        batch.commit()
    }

    fn delete_keystones(&self, in_keys: &[CircuitKey]) -> Result<(), String> {
        let mut batch = self.batch();
        for in_key in in_keys {
            let mut key = vec![crate::store::KEYSTONE_PREFIX];
            key.extend_from_slice(&in_key.to_bytes());
            batch.delete(key);

            let mut circuit_key = vec![crate::store::CIRCUIT_PREFIX];
            circuit_key.extend_from_slice(&in_key.to_bytes());
            if let Some(raw) = batch.get(&circuit_key) {
                let mut circuit: PaymentCircuit =
                    crate::store::deserialize_from(&raw, "payment circuit");
                circuit.outgoing = None;
                batch.put(
                    circuit_key,
                    crate::store::serialize_to_vec(&circuit, "payment circuit"),
                );
            }
        }
        batch.commit()
    }

    fn delete_circuits(&self, in_keys: &[CircuitKey]) -> Result<(), String> {
        let mut batch = self.batch();
        for in_key in in_keys {
            let mut key = vec![crate::store::CIRCUIT_PREFIX];
            key.extend_from_slice(&in_key.to_bytes());
            batch.delete(key);
            let mut key = vec![crate::store::KEYSTONE_PREFIX];
            key.extend_from_slice(&in_key.to_bytes());
            batch.delete(key);
        }
        batch.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circuit(in_scid: u64, in_id: u64, hash: u8) -> PaymentCircuit {
        PaymentCircuit::new(
            [hash; 32].into(),
            CircuitKey::new(ShortChannelId::from_u64(in_scid), in_id),
            1_000,
            990,
            ShortChannelId::from_u64(99),
            None,
        )
    }

    fn temp_map() -> (tempfile::TempDir, CircuitMap<Store>) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::new(dir.path()).expect("open store");
        let map = CircuitMap::new(store).expect("open circuit map");
        (dir, map)
    }

    #[test]
    fn test_commit_dedup_and_drop() {
        let (_dir, map) = temp_map();
        let first = circuit(1, 0, 7);

        let actions = map.commit_circuits(vec![first.clone()]).expect("commit");
        assert_eq!(actions.adds.len(), 1);

        // Same add again: dedup, not a second forward.
        let actions = map.commit_circuits(vec![first.clone()]).expect("commit");
        assert!(actions.adds.is_empty());
        assert_eq!(actions.dups.len(), 1);

        // Same incoming key, different contents: dropped.
        let mut conflicting = circuit(1, 0, 8);
        conflicting.incoming_amount = 5;
        let actions = map.commit_circuits(vec![conflicting]).expect("commit");
        assert!(actions.adds.is_empty());
        assert_eq!(actions.drops.len(), 1);
    }

    #[test]
    fn test_two_identical_adds_in_one_batch() {
        let (_dir, map) = temp_map();
        let add = circuit(1, 0, 7);
        let actions = map
            .commit_circuits(vec![add.clone(), add])
            .expect("commit");
        assert_eq!(actions.adds.len(), 1);
        assert_eq!(actions.drops.len(), 1);
    }

    #[test]
    fn test_open_requires_pending_circuit() {
        let (_dir, map) = temp_map();
        let keystone = Keystone {
            in_key: CircuitKey::new(ShortChannelId::from_u64(1), 0),
            out_key: CircuitKey::new(ShortChannelId::from_u64(2), 0),
        };
        assert!(matches!(
            map.open_circuits(vec![keystone]),
            Err(CircuitError::UnknownCircuit(_))
        ));
    }

    #[test]
    fn test_open_close_delete_flow() {
        let (_dir, map) = temp_map();
        let add = circuit(1, 0, 7);
        map.commit_circuits(vec![add.clone()]).expect("commit");

        let out_key = CircuitKey::new(ShortChannelId::from_u64(2), 5);
        map.open_circuits(vec![Keystone {
            in_key: add.incoming,
            out_key,
        }])
        .expect("open");
        assert_eq!(map.num_open(), 1);

        let closed = map.close_circuit(out_key).expect("close");
        assert_eq!(closed.incoming, add.incoming);
        // Closing again is idempotent.
        let closed_again = map.close_circuit(out_key).expect("close again");
        assert_eq!(closed_again.incoming, add.incoming);

        map.delete_circuits(&[add.incoming]).expect("delete");
        assert_eq!(map.num_open(), 0);
        assert_eq!(map.lookup_circuit(add.incoming), None);
        assert!(matches!(
            map.close_circuit(out_key),
            Err(CircuitError::UnknownCircuit(_))
        ));
    }

    #[test]
    fn test_outgoing_key_unique_across_open_circuits() {
        let (_dir, map) = temp_map();
        let first = circuit(1, 0, 7);
        let second = circuit(1, 1, 8);
        map.commit_circuits(vec![first.clone(), second.clone()])
            .expect("commit");

        let out_key = CircuitKey::new(ShortChannelId::from_u64(2), 5);
        map.open_circuits(vec![Keystone {
            in_key: first.incoming,
            out_key,
        }])
        .expect("open");

        assert!(matches!(
            map.open_circuits(vec![Keystone {
                in_key: second.incoming,
                out_key,
            }]),
            Err(CircuitError::DuplicateAdd(_))
        ));
    }

    #[test]
    fn test_trim_open_circuits() {
        let (_dir, map) = temp_map();
        let out_chan = ShortChannelId::from_u64(2);
        let mut keystones = Vec::new();
        for i in 0..3 {
            let add = circuit(1, i, i as u8);
            map.commit_circuits(vec![add.clone()]).expect("commit");
            keystones.push(Keystone {
                in_key: add.incoming,
                out_key: CircuitKey::new(out_chan, i),
            });
        }
        map.open_circuits(keystones).expect("open");
        assert_eq!(map.num_open(), 3);

        map.trim_open_circuits(out_chan, 1).expect("trim");
        assert_eq!(map.num_open(), 1);
        assert!(map
            .lookup_open_circuit(CircuitKey::new(out_chan, 0))
            .is_some());
        assert!(map
            .lookup_open_circuit(CircuitKey::new(out_chan, 2))
            .is_none());
    }

    #[test]
    fn test_lookup_by_payment_hash() {
        let (_dir, map) = temp_map();
        let add = circuit(1, 0, 7);
        map.commit_circuits(vec![add.clone()]).expect("commit");
        let found = map.lookup_by_payment_hash([7u8; 32].into());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].incoming, add.incoming);
    }

    #[test]
    fn test_restart_rebuilds_state() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let add = circuit(1, 0, 7);
        let out_key = CircuitKey::new(ShortChannelId::from_u64(2), 5);
        {
            let store = Store::new(dir.path()).expect("open store");
            let map = CircuitMap::new(store).expect("open circuit map");
            map.commit_circuits(vec![add.clone()]).expect("commit");
            map.open_circuits(vec![Keystone {
                in_key: add.incoming,
                out_key,
            }])
            .expect("open");
        }

        let store = Store::new(dir.path()).expect("reopen store");
        let map = CircuitMap::new(store).expect("reopen circuit map");
        assert_eq!(map.num_open(), 1);
        let reopened = map.lookup_open_circuit(out_key).expect("open circuit");
        assert_eq!(reopened.incoming, add.incoming);
        assert_eq!(reopened.outgoing, Some(out_key));
    }

    #[test]
    fn test_crash_idempotent_replay_suffix() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let add = circuit(1, 0, 7);
        let out_key = CircuitKey::new(ShortChannelId::from_u64(2), 5);
        {
            let store = Store::new(dir.path()).expect("open store");
            let map = CircuitMap::new(store).expect("open circuit map");
            map.commit_circuits(vec![add.clone()]).expect("commit");
            map.open_circuits(vec![Keystone {
                in_key: add.incoming,
                out_key,
            }])
            .expect("open");
        }

        // Replay the suffix after a restart: commit (dedup) then open (same
        // keystone) must land in the same final state.
        let store = Store::new(dir.path()).expect("reopen store");
        let map = CircuitMap::new(store).expect("reopen circuit map");
        let actions = map.commit_circuits(vec![add.clone()]).expect("commit");
        assert_eq!(actions.dups.len(), 1);
        map.open_circuits(vec![Keystone {
            in_key: add.incoming,
            out_key,
        }])
        .expect("re-open is a no-op");
        assert_eq!(map.num_open(), 1);

        map.delete_circuits(&[add.incoming]).expect("delete");
        map.delete_circuits(&[add.incoming]).expect("delete twice");
        assert_eq!(map.num_open(), 0);
    }

    #[test]
    fn test_fail_circuit() {
        let (_dir, map) = temp_map();
        let add = circuit(1, 0, 7);
        map.commit_circuits(vec![add.clone()]).expect("commit");

        let failed = map.fail_circuit(add.incoming).expect("fail");
        assert_eq!(failed.incoming, add.incoming);
        assert!(matches!(
            map.fail_circuit(add.incoming),
            Err(CircuitError::AlreadyClosed(_))
        ));
    }
}
