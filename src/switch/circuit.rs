//! Payment circuits: the pairing of an incoming HTLC with its committed
//! outgoing HTLC.

use crate::onion::SealedEncrypter;
use crate::types::{Hash256, ShortChannelId};
use serde::{Deserialize, Serialize};

/// Identifies one half of a circuit: the channel an HTLC rides on and its
/// per-side id.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default,
)]
pub struct CircuitKey {
    pub chan_id: ShortChannelId,
    pub htlc_id: u64,
}

impl CircuitKey {
    pub fn new(chan_id: ShortChannelId, htlc_id: u64) -> Self {
        Self { chan_id, htlc_id }
    }

    /// The fixed-width store key encoding: SCID then HTLC id, big endian.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.chan_id.to_u64().to_be_bytes());
        out[8..].copy_from_slice(&self.htlc_id.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let scid = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        let htlc_id = u64::from_be_bytes(bytes[8..].try_into().unwrap());
        Some(Self {
            chan_id: ShortChannelId::from_u64(scid),
            htlc_id,
        })
    }
}

impl std::fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.chan_id, self.htlc_id)
    }
}

/// The durable record of the outgoing half of a circuit, written when the
/// outgoing add is committed to a local commitment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystone {
    pub in_key: CircuitKey,
    pub out_key: CircuitKey,
}

/// A payment circuit. Created pending at commit time, opened when its
/// keystone is written, closed when the resolution has been delivered and
/// acked. These transitions are monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCircuit {
    pub payment_hash: Hash256,
    pub incoming: CircuitKey,
    /// Unset until the keystone is written.
    pub outgoing: Option<CircuitKey>,
    pub incoming_amount: u64,
    pub outgoing_amount: u64,
    /// The error encrypter for the incoming hop, sealed for persistence and
    /// re-armed with the onion processor after a restart.
    pub encrypter: Option<SealedEncrypter>,
    /// The next hop the onion asked us to forward to.
    pub destination: ShortChannelId,
    /// When the circuit was committed, for resolution-time accounting.
    pub created_ms: u64,
    /// Whether the incoming add carried the endorsement signal.
    pub endorsed: bool,
}

impl PaymentCircuit {
    pub fn new(
        payment_hash: Hash256,
        incoming: CircuitKey,
        incoming_amount: u64,
        outgoing_amount: u64,
        destination: ShortChannelId,
        encrypter: Option<SealedEncrypter>,
    ) -> Self {
        Self {
            payment_hash,
            incoming,
            outgoing: None,
            incoming_amount,
            outgoing_amount,
            encrypter,
            destination,
            created_ms: 0,
            endorsed: false,
        }
    }

    pub fn has_keystone(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Whether a second add with these parameters is a retransmission of
    /// this circuit rather than a conflicting add.
    pub fn matches(&self, payment_hash: Hash256, incoming_amount: u64, outgoing_amount: u64) -> bool {
        self.payment_hash == payment_hash
            && self.incoming_amount == incoming_amount
            && self.outgoing_amount == outgoing_amount
    }
}
