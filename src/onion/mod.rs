//! The onion processor: batched packet decryption, persistent replay
//! detection, and hop-iterator production.
//!
//! The Sphinx cryptography itself lives behind the [`SphinxRouter`]
//! capability trait; this module owns the packet framing, the batch replay
//! log and the iterator the link consumes.

pub mod payload;

pub use crate::blinded::{BlindingKit, BlindingProcessor, ForwardingInfo};

use crate::types::{Hash256, Pubkey};
use crate::wire::{FailureCode, ONION_PACKET_SIZE};
use payload::{
    validate_parsed_payload_types, ErrPayloadDecode, HopPayload, LegacyPayload, TlvPayload,
};
use secp256k1::hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// The size of the per-hop routing info inside an onion packet.
pub const ROUTING_INFO_SIZE: usize = 1300;

/// The only onion packet version currently defined.
pub const ONION_PACKET_VERSION: u8 = 0;

// ============================================================
// Packet
// ============================================================

/// A fixed-size onion packet: version byte, 33-byte ephemeral key, 1300 bytes
/// of routing info and a 32-byte HMAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionPacket {
    pub version: u8,
    pub ephemeral_key: Pubkey,
    pub routing_info: Vec<u8>,
    pub hmac: [u8; 32],
}

impl OnionPacket {
    pub fn decode(bytes: &[u8]) -> Result<Self, SphinxError> {
        if bytes.len() != ONION_PACKET_SIZE {
            return Err(SphinxError::InvalidKey);
        }
        let version = bytes[0];
        if version != ONION_PACKET_VERSION {
            return Err(SphinxError::InvalidVersion);
        }
        let ephemeral_key =
            Pubkey::from_slice(&bytes[1..34]).map_err(|_| SphinxError::InvalidKey)?;
        let routing_info = bytes[34..34 + ROUTING_INFO_SIZE].to_vec();
        let hmac: [u8; 32] = bytes[34 + ROUTING_INFO_SIZE..].try_into().unwrap();
        Ok(Self {
            version,
            ephemeral_key,
            routing_info,
            hmac,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ONION_PACKET_SIZE);
        out.push(self.version);
        out.extend_from_slice(&self.ephemeral_key.serialize());
        out.extend_from_slice(&self.routing_info);
        out.extend_from_slice(&self.hmac);
        out
    }
}

// ============================================================
// Sphinx capability interface
// ============================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SphinxError {
    #[error("invalid onion version")]
    InvalidVersion,
    #[error("invalid onion key")]
    InvalidKey,
    #[error("invalid onion hmac")]
    InvalidHmac,
    #[error("sphinx failure: {0}")]
    Internal(String),
}

impl SphinxError {
    pub fn fail_code(&self) -> FailureCode {
        match self {
            SphinxError::InvalidVersion => FailureCode::InvalidOnionVersion,
            SphinxError::InvalidHmac => FailureCode::InvalidOnionHmac,
            SphinxError::InvalidKey | SphinxError::Internal(_) => FailureCode::InvalidOnionKey,
        }
    }
}

/// What position the processed packet says we occupy in the route.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketAction {
    MoreHops,
    ExitNode,
}

/// The raw payload peeled for this hop, still tagged by format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeeledPayload {
    Legacy(Vec<u8>),
    Tlv(Vec<u8>),
}

/// The outcome of processing one onion packet.
#[derive(Debug, Clone)]
pub struct ProcessedPacket {
    pub action: PacketAction,
    pub payload: PeeledPayload,
    /// The packet for the next hop; absent at the exit node.
    pub next_packet: Option<OnionPacket>,
    pub shared_secret: [u8; 32],
}

/// The Sphinx operations this crate consumes as a library interface.
pub trait SphinxRouter: Send + Sync {
    /// Verify the packet HMAC and peel one layer, producing the payload and
    /// the packet for the next hop. The payment hash rides along as
    /// associated data so a replayed packet is forced to reuse it.
    fn process_onion_packet(
        &self,
        packet: &OnionPacket,
        assoc_data: &[u8],
        blinding_point: Option<Pubkey>,
    ) -> Result<ProcessedPacket, SphinxError>;

    /// Derive the shared secret for an ephemeral key, as used when building
    /// an error encrypter for a hop.
    fn shared_secret(&self, ephemeral_key: &Pubkey) -> Result<[u8; 32], SphinxError>;
}

// ============================================================
// Error encrypters
// ============================================================

/// Tag distinguishing encrypter implementations across a restart.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncrypterKind {
    Sphinx,
    Mock,
}

/// Failure-reason encryption toward the payment source. One production
/// variant backed by the Sphinx shared secret, plus mock variants in tests.
pub trait ErrorEncrypter: Send + Sync {
    fn kind(&self) -> EncrypterKind;

    /// The ephemeral key this encrypter was derived from; enough to re-derive
    /// the encrypter after a restart.
    fn ephemeral_key(&self) -> Pubkey;

    /// Encrypt a failure reason we originate.
    fn encrypt_first_hop(&self, reason: &[u8]) -> Vec<u8>;

    /// Re-encrypt a failure blob travelling back through us.
    fn reencrypt(&self, data: &[u8]) -> Vec<u8>;
}

/// The production encrypter: an XOR stream keyed by the Sphinx shared
/// secret, applied symmetrically at each hop on the return path.
pub struct SphinxErrorEncrypter {
    pub ephemeral_key: Pubkey,
    pub shared_secret: [u8; 32],
}

impl SphinxErrorEncrypter {
    fn cipher_stream(&self, len: usize) -> Vec<u8> {
        let mut stream = Vec::with_capacity(len);
        let mut counter = 0u64;
        while stream.len() < len {
            let mut block = self.shared_secret.to_vec();
            block.extend_from_slice(&counter.to_be_bytes());
            let digest = sha256::Hash::hash(&block);
            stream.extend_from_slice(digest.as_byte_array());
            counter += 1;
        }
        stream.truncate(len);
        stream
    }

    fn xor(&self, data: &[u8]) -> Vec<u8> {
        let stream = self.cipher_stream(data.len());
        data.iter().zip(stream).map(|(b, s)| b ^ s).collect()
    }
}

impl ErrorEncrypter for SphinxErrorEncrypter {
    fn kind(&self) -> EncrypterKind {
        EncrypterKind::Sphinx
    }

    fn ephemeral_key(&self) -> Pubkey {
        self.ephemeral_key
    }

    fn encrypt_first_hop(&self, reason: &[u8]) -> Vec<u8> {
        self.xor(reason)
    }

    fn reencrypt(&self, data: &[u8]) -> Vec<u8> {
        self.xor(data)
    }
}

/// The persistable form of an error encrypter: the type tag and the
/// ephemeral key it can be re-derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEncrypter {
    pub kind: EncrypterKind,
    pub ephemeral_key: Pubkey,
}

impl SealedEncrypter {
    pub fn seal(encrypter: &dyn ErrorEncrypter) -> Self {
        Self {
            kind: encrypter.kind(),
            ephemeral_key: encrypter.ephemeral_key(),
        }
    }
}

// ============================================================
// Shared-secret log
// ============================================================

/// Persistence for the batched replay log. A batch commits atomically; the
/// decisions for a committed batch are stored so that re-decoding the same
/// batch yields bit-identical results.
pub trait SharedSecretLogStore: Send + Sync {
    /// The replay decisions of an already-committed batch, if any.
    fn get_batch_decisions(&self, batch_id: &[u8]) -> Option<Vec<u16>>;

    /// Atomically log the shared secrets of a batch, returning the indexes
    /// that were detected as replays. Committing the same batch id again
    /// returns the stored decisions unchanged.
    fn commit_batch(
        &self,
        batch_id: &[u8],
        secrets: &[(u16, [u8; 32])],
    ) -> Result<Vec<u16>, String>;
}

/// Key under which a shared secret is logged: its sha256, so raw secrets
/// never hit disk.
pub(crate) fn shared_secret_hash(secret: &[u8; 32]) -> [u8; 32] {
    *sha256::Hash::hash(secret).as_byte_array()
}

impl SharedSecretLogStore for crate::store::Store {
    fn get_batch_decisions(&self, batch_id: &[u8]) -> Option<Vec<u16>> {
        let mut key = vec![crate::store::ONION_BATCH_PREFIX];
        key.extend_from_slice(batch_id);
        self.get(key)
            .map(|raw| crate::store::deserialize_from(&raw, "onion batch decisions"))
    }

    fn commit_batch(
        &self,
        batch_id: &[u8],
        secrets: &[(u16, [u8; 32])],
    ) -> Result<Vec<u16>, String> {
        // Re-committing a batch returns the stored decisions untouched, which
        // is what makes decode idempotent across restarts.
        if let Some(decisions) = self.get_batch_decisions(batch_id) {
            return Ok(decisions);
        }

        let mut batch = self.batch();
        let mut replays = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (seq, secret) in secrets {
            let hash = shared_secret_hash(secret);
            let mut secret_key = vec![crate::store::SHARED_SECRET_PREFIX];
            secret_key.extend_from_slice(&hash);
            // A secret already present in the log, or duplicated within this
            // batch, marks the entry as a replay.
            if !seen.insert(hash) || batch.get(&secret_key).is_some() {
                replays.push(*seq);
                continue;
            }
            batch.put(secret_key, batch_id);
        }

        let mut batch_key = vec![crate::store::ONION_BATCH_PREFIX];
        batch_key.extend_from_slice(batch_id);
        batch.put(
            batch_key,
            crate::store::serialize_to_vec(&replays, "onion batch decisions"),
        );
        batch.commit()?;
        Ok(replays)
    }
}

// ============================================================
// Hop iterator
// ============================================================

/// Iterator over the remaining route of a processed onion packet. One layer
/// deep: `hop_payload` interprets this hop, `encode_next_hop` re-wraps the
/// remainder for the next.
pub struct HopIterator {
    og_packet: OnionPacket,
    processed: ProcessedPacket,
    blinding_kit: BlindingKit,
}

impl HopIterator {
    fn new(og_packet: OnionPacket, processed: ProcessedPacket, blinding_kit: BlindingKit) -> Self {
        Self {
            og_packet,
            processed,
            blinding_kit,
        }
    }

    /// Interpret the payload for this hop. TLV payloads are validated against
    /// the presence rules for their route position.
    pub fn hop_payload(&self) -> Result<HopPayload, ErrPayloadDecode> {
        match &self.processed.payload {
            PeeledPayload::Legacy(raw) => {
                let mut reader = crate::wire::Reader::new(raw);
                let legacy = LegacyPayload::read(&mut reader).map_err(ErrPayloadDecode::Wire)?;
                Ok(HopPayload::Legacy(legacy))
            }
            PeeledPayload::Tlv(raw) => {
                let parsed = TlvPayload::from_bytes(raw)?;
                validate_parsed_payload_types(&parsed.parsed_types, self.is_final_hop()).map_err(
                    |err| {
                        warn!("onion payload position violation: {}", err);
                        ErrPayloadDecode::Violation(err)
                    },
                )?;
                Ok(HopPayload::Tlv(parsed))
            }
        }
    }

    pub fn is_final_hop(&self) -> bool {
        self.processed.action == PacketAction::ExitNode
    }

    /// Serialize the onion packet destined for the next hop.
    pub fn encode_next_hop(&self, w: &mut Vec<u8>) -> Result<(), SphinxError> {
        match &self.processed.next_packet {
            Some(packet) => {
                w.extend_from_slice(&packet.encode());
                Ok(())
            }
            None => Err(SphinxError::Internal(
                "no next packet at exit node".to_string(),
            )),
        }
    }

    /// The blinding kit for this hop, used lazily by the link when the
    /// payload carries an encrypted blob.
    pub fn blinding_kit(&self) -> &BlindingKit {
        &self.blinding_kit
    }

    pub fn shared_secret(&self) -> [u8; 32] {
        self.processed.shared_secret
    }

    /// Build the error encrypter for this hop from the packet's ephemeral
    /// key.
    pub fn extract_error_encrypter(
        &self,
        extracter: &dyn Fn(&Pubkey) -> Result<Arc<dyn ErrorEncrypter>, FailureCode>,
    ) -> Result<Arc<dyn ErrorEncrypter>, FailureCode> {
        extracter(&self.og_packet.ephemeral_key)
    }
}

// ============================================================
// Processor
// ============================================================

/// One entry of a decode batch.
pub struct DecodeHopIteratorRequest {
    pub onion_blob: Vec<u8>,
    pub rhash: Hash256,
    pub incoming_cltv: u32,
    pub incoming_amount: u64,
    pub blinding_point: Option<Pubkey>,
}

/// The outcome for one entry of a decode batch. The iterator is only valid
/// when `fail_code` is `None`.
pub struct DecodeHopIteratorResponse {
    pub hop_iterator: Option<HopIterator>,
    pub fail_code: Option<FailureCode>,
}

/// Keeps all Sphinx-dependent parts behind one decoding surface so the link
/// and switch never depend on the router directly.
pub struct OnionProcessor<S> {
    router: Arc<dyn SphinxRouter>,
    blinding: Arc<dyn BlindingProcessor>,
    store: S,
}

impl<S: SharedSecretLogStore + Clone> OnionProcessor<S> {
    pub fn new(router: Arc<dyn SphinxRouter>, blinding: Arc<dyn BlindingProcessor>, store: S) -> Self {
        Self {
            router,
            blinding,
            store,
        }
    }

    fn make_iterator(
        &self,
        og_packet: OnionPacket,
        processed: ProcessedPacket,
        req_blinding: Option<Pubkey>,
        incoming_cltv: u32,
        incoming_amount: u64,
    ) -> HopIterator {
        let kit = BlindingKit {
            processor: Arc::clone(&self.blinding),
            update_add_blinding: req_blinding,
            incoming_cltv,
            incoming_amount,
        };
        HopIterator::new(og_packet, processed, kit)
    }

    /// Batched decode with replay detection. For the same `batch_id` and the
    /// same request ordering this returns bit-identical responses, which
    /// links rely on when they replay decoding after a restart.
    pub async fn decode_hop_iterators(
        &self,
        batch_id: &[u8],
        reqs: Vec<DecodeHopIteratorRequest>,
    ) -> Vec<DecodeHopIteratorResponse> {
        struct Decoded {
            packet: OnionPacket,
            processed: ProcessedPacket,
        }

        // cpu-heavy onion decoding runs on the blocking pool, one task per
        // packet.
        let mut handles = Vec::with_capacity(reqs.len());
        for req in &reqs {
            let router = Arc::clone(&self.router);
            let onion_blob = req.onion_blob.clone();
            let rhash = req.rhash;
            let blinding_point = req.blinding_point;
            handles.push(tokio::task::spawn_blocking(move || {
                let packet = OnionPacket::decode(&onion_blob)?;
                let processed =
                    router.process_onion_packet(&packet, rhash.as_ref(), blinding_point)?;
                Ok::<_, SphinxError>(Decoded { packet, processed })
            }));
        }

        let mut decoded: Vec<Result<Decoded, SphinxError>> = Vec::with_capacity(reqs.len());
        for handle in handles {
            match handle.await {
                Ok(result) => decoded.push(result),
                Err(err) => {
                    error!("onion decode task panicked: {}", err);
                    decoded.push(Err(SphinxError::Internal(err.to_string())));
                }
            }
        }

        // Now commit the batch: the shared secrets of every successfully
        // decoded packet go into the replay log in one atomic write.
        let secrets: Vec<(u16, [u8; 32])> = decoded
            .iter()
            .enumerate()
            .filter_map(|(i, result)| {
                result
                    .as_ref()
                    .ok()
                    .map(|d| (i as u16, d.processed.shared_secret))
            })
            .collect();

        let replays = match self.store.commit_batch(batch_id, &secrets) {
            Ok(replays) => replays,
            Err(err) => {
                error!(
                    "unable to process onion packet batch {}: {}",
                    hex::encode(batch_id),
                    err
                );
                // The secret log could not be flushed; everything that had
                // not already failed decoding gets a temporary failure.
                return decoded
                    .into_iter()
                    .map(|result| match result {
                        Ok(_) => DecodeHopIteratorResponse {
                            hop_iterator: None,
                            fail_code: Some(FailureCode::TemporaryChannelFailure),
                        },
                        Err(err) => DecodeHopIteratorResponse {
                            hop_iterator: None,
                            fail_code: Some(err.fail_code()),
                        },
                    })
                    .collect();
            }
        };

        decoded
            .into_iter()
            .zip(reqs)
            .enumerate()
            .map(|(i, (result, req))| match result {
                Ok(d) => {
                    if replays.contains(&(i as u16)) {
                        warn!(
                            "onion packet {} of batch {} is a replay",
                            i,
                            hex::encode(batch_id)
                        );
                        DecodeHopIteratorResponse {
                            hop_iterator: None,
                            fail_code: Some(FailureCode::TemporaryChannelFailure),
                        }
                    } else {
                        DecodeHopIteratorResponse {
                            hop_iterator: Some(self.make_iterator(
                                d.packet,
                                d.processed,
                                req.blinding_point,
                                req.incoming_cltv,
                                req.incoming_amount,
                            )),
                            fail_code: None,
                        }
                    }
                }
                Err(err) => DecodeHopIteratorResponse {
                    hop_iterator: None,
                    fail_code: Some(err.fail_code()),
                },
            })
            .collect()
    }

    /// Re-derive the iterator for an already-seen packet, bypassing the
    /// replay log. Used by contract resolution to replay-safely reinterpret
    /// a payload.
    pub fn reconstruct_hop_iterator(
        &self,
        onion_blob: &[u8],
        rhash: Hash256,
        blinding_point: Option<Pubkey>,
    ) -> Result<HopIterator, SphinxError> {
        let packet = OnionPacket::decode(onion_blob)?;
        let processed = self
            .router
            .process_onion_packet(&packet, rhash.as_ref(), blinding_point)?;
        Ok(self.make_iterator(packet, processed, blinding_point, 0, 0))
    }

    /// Build the error encrypter for a hop from its ephemeral key.
    pub fn extract_error_encrypter(
        &self,
        ephemeral_key: &Pubkey,
    ) -> Result<Arc<dyn ErrorEncrypter>, FailureCode> {
        match self.router.shared_secret(ephemeral_key) {
            Ok(shared_secret) => Ok(Arc::new(SphinxErrorEncrypter {
                ephemeral_key: *ephemeral_key,
                shared_secret,
            })),
            Err(err) => {
                error!("unable to derive error encrypter: {}", err);
                Err(err.fail_code())
            }
        }
    }

    /// Re-arm a sealed encrypter loaded from the circuit store.
    pub fn reextract_encrypter(
        &self,
        sealed: &SealedEncrypter,
    ) -> Result<Arc<dyn ErrorEncrypter>, FailureCode> {
        match sealed.kind {
            EncrypterKind::Sphinx => self.extract_error_encrypter(&sealed.ephemeral_key),
            EncrypterKind::Mock => Err(FailureCode::TemporaryChannelFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onion_packet_roundtrip() {
        let (_, pk) = secp256k1::generate_keypair(&mut rand::thread_rng());
        let packet = OnionPacket {
            version: 0,
            ephemeral_key: pk.into(),
            routing_info: vec![0x5a; ROUTING_INFO_SIZE],
            hmac: [0x77; 32],
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), ONION_PACKET_SIZE);
        assert_eq!(OnionPacket::decode(&bytes).expect("decode"), packet);
    }

    #[test]
    fn test_onion_packet_rejects_bad_version() {
        let (_, pk) = secp256k1::generate_keypair(&mut rand::thread_rng());
        let mut bytes = OnionPacket {
            version: 0,
            ephemeral_key: pk.into(),
            routing_info: vec![0; ROUTING_INFO_SIZE],
            hmac: [0; 32],
        }
        .encode();
        bytes[0] = 1;
        assert_eq!(
            OnionPacket::decode(&bytes),
            Err(SphinxError::InvalidVersion)
        );
    }

    #[test]
    fn test_onion_packet_rejects_bad_key() {
        let mut bytes = vec![0u8; ONION_PACKET_SIZE];
        bytes[1] = 0xde;
        assert_eq!(OnionPacket::decode(&bytes), Err(SphinxError::InvalidKey));
    }

    #[test]
    fn test_sphinx_error_fail_codes() {
        assert_eq!(
            SphinxError::InvalidVersion.fail_code(),
            FailureCode::InvalidOnionVersion
        );
        assert_eq!(
            SphinxError::InvalidHmac.fail_code(),
            FailureCode::InvalidOnionHmac
        );
        assert_eq!(
            SphinxError::InvalidKey.fail_code(),
            FailureCode::InvalidOnionKey
        );
    }

    #[test]
    fn test_error_encrypter_xor_is_symmetric() {
        let (_, pk) = secp256k1::generate_keypair(&mut rand::thread_rng());
        let encrypter = SphinxErrorEncrypter {
            ephemeral_key: pk.into(),
            shared_secret: [9u8; 32],
        };
        let reason = b"fee insufficient".to_vec();
        let encrypted = encrypter.encrypt_first_hop(&reason);
        assert_ne!(encrypted, reason);
        assert_eq!(encrypter.reencrypt(&encrypted), reason);
    }
}
