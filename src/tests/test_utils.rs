//! Shared test fixtures: mock router, blinding processor, peer transport,
//! signer and invoice registry.

use crate::blinded::BlindingProcessor;
use crate::onion::{
    OnionPacket, PacketAction, PeeledPayload, ProcessedPacket, SphinxError, SphinxRouter,
    ROUTING_INFO_SIZE,
};
use crate::onion::payload::TlvPayload;
use crate::switch::link::{CommitmentVerifier, InvoiceRegistry, PeerLink};
use crate::types::{ChannelId, Hash256, Pubkey, ShortChannelId};
use crate::wire::messages::SignatureBytes;
use crate::wire::{CommitSig, Message};
use once_cell::sync::OnceCell;
use secp256k1::hashes::{sha256, Hash};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn gen_rand_pubkey() -> Pubkey {
    let (_, pk) = secp256k1::generate_keypair(&mut rand::thread_rng());
    pk.into()
}

pub fn gen_rand_sha256_hash() -> Hash256 {
    let mut bytes = [0u8; 32];
    use rand::Rng;
    rand::thread_rng().fill(&mut bytes);
    bytes.into()
}

/// Poll an assertion until it holds or the deadline passes.
pub async fn retry_until(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time: {}", what);
}

// ============================================================
// Mock sphinx router
// ============================================================

/// What the mock router scripts for the next peel.
#[derive(Clone)]
pub enum ScriptedHop {
    Relay {
        next_hop: ShortChannelId,
        amount: u64,
        outgoing_cltv: u32,
    },
    Final {
        amount: u64,
        outgoing_cltv: u32,
    },
}

/// A router whose "decryption" derives the shared secret by hashing the
/// routing info together with the associated data, which preserves the
/// replay characteristics the processor cares about.
pub struct MockSphinxRouter {
    pub script: Mutex<ScriptedHop>,
}

impl MockSphinxRouter {
    pub fn new(script: ScriptedHop) -> Self {
        Self {
            script: Mutex::new(script),
        }
    }

    fn derive_secret(packet: &OnionPacket, assoc_data: &[u8]) -> [u8; 32] {
        let mut input = packet.routing_info.clone();
        input.extend_from_slice(assoc_data);
        *sha256::Hash::hash(&input).as_byte_array()
    }
}

impl SphinxRouter for MockSphinxRouter {
    fn process_onion_packet(
        &self,
        packet: &OnionPacket,
        assoc_data: &[u8],
        _blinding_point: Option<Pubkey>,
    ) -> Result<ProcessedPacket, SphinxError> {
        let shared_secret = Self::derive_secret(packet, assoc_data);
        let script = self.script.lock().unwrap().clone();
        let (action, payload, next_packet) = match script {
            ScriptedHop::Relay {
                next_hop,
                amount,
                outgoing_cltv,
            } => {
                let payload = TlvPayload {
                    amt_to_forward: Some(amount),
                    outgoing_cltv: Some(outgoing_cltv),
                    next_hop: Some(next_hop),
                    ..Default::default()
                };
                let next = OnionPacket {
                    version: 0,
                    ephemeral_key: packet.ephemeral_key,
                    routing_info: vec![0u8; ROUTING_INFO_SIZE],
                    hmac: [0u8; 32],
                };
                (
                    PacketAction::MoreHops,
                    PeeledPayload::Tlv(payload.to_bytes()),
                    Some(next),
                )
            }
            ScriptedHop::Final {
                amount,
                outgoing_cltv,
            } => {
                let payload = TlvPayload {
                    amt_to_forward: Some(amount),
                    outgoing_cltv: Some(outgoing_cltv),
                    ..Default::default()
                };
                (
                    PacketAction::ExitNode,
                    PeeledPayload::Tlv(payload.to_bytes()),
                    None,
                )
            }
        };
        Ok(ProcessedPacket {
            action,
            payload,
            next_packet,
            shared_secret,
        })
    }

    fn shared_secret(&self, ephemeral_key: &Pubkey) -> Result<[u8; 32], SphinxError> {
        Ok(*sha256::Hash::hash(&ephemeral_key.serialize()).as_byte_array())
    }
}

/// A router that always fails with the given error.
pub struct FailingSphinxRouter(pub SphinxError);

impl SphinxRouter for FailingSphinxRouter {
    fn process_onion_packet(
        &self,
        _packet: &OnionPacket,
        _assoc_data: &[u8],
        _blinding_point: Option<Pubkey>,
    ) -> Result<ProcessedPacket, SphinxError> {
        Err(self.0.clone())
    }

    fn shared_secret(&self, _ephemeral_key: &Pubkey) -> Result<[u8; 32], SphinxError> {
        Err(self.0.clone())
    }
}

pub struct NoopBlindingProcessor;

impl BlindingProcessor for NoopBlindingProcessor {
    fn decrypt_blinded_hop_data(
        &self,
        _ephemeral: &Pubkey,
        encrypted_data: &[u8],
    ) -> Result<Vec<u8>, String> {
        Ok(encrypted_data.to_vec())
    }

    fn next_ephemeral(&self, ephemeral: &Pubkey) -> Result<Pubkey, String> {
        Ok(*ephemeral)
    }
}

/// Build a syntactically valid onion blob whose routing info embeds `seed`
/// so different payments produce different shared secrets.
pub fn test_onion_blob(seed: u8) -> Vec<u8> {
    static KEY: OnceCell<Pubkey> = OnceCell::new();
    let key = KEY.get_or_init(gen_rand_pubkey);
    OnionPacket {
        version: 0,
        ephemeral_key: *key,
        routing_info: vec![seed; ROUTING_INFO_SIZE],
        hmac: [0u8; 32],
    }
    .encode()
}

// ============================================================
// Link collaborators
// ============================================================

#[derive(Clone, Default)]
pub struct MockPeer {
    pub sent: Arc<Mutex<Vec<Message>>>,
}

impl MockPeer {
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count<P: Fn(&Message) -> bool>(&self, pred: P) -> usize {
        self.sent.lock().unwrap().iter().filter(|m| pred(m)).count()
    }
}

impl PeerLink for MockPeer {
    fn send_message(&self, msg: Message) -> Result<(), String> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

pub struct MockSigner {
    revocation_point: Pubkey,
}

impl Default for MockSigner {
    fn default() -> Self {
        Self {
            revocation_point: gen_rand_pubkey(),
        }
    }
}

impl CommitmentVerifier for MockSigner {
    fn sign_commitment(&self, _channel_id: &ChannelId, commitment_number: u64) -> SignatureBytes {
        let mut sig = [0u8; 64];
        sig[..8].copy_from_slice(&commitment_number.to_be_bytes());
        SignatureBytes(sig)
    }

    fn verify_commitment(
        &self,
        _channel_id: &ChannelId,
        _commitment_number: u64,
        _sig: &CommitSig,
    ) -> Result<(), String> {
        Ok(())
    }

    fn revoke_commitment(
        &self,
        channel_id: &ChannelId,
        commitment_number: u64,
    ) -> (Hash256, Pubkey) {
        let mut input = channel_id.as_ref().to_vec();
        input.extend_from_slice(&commitment_number.to_be_bytes());
        (
            (*sha256::Hash::hash(&input).as_byte_array()).into(),
            self.revocation_point,
        )
    }
}

#[derive(Default)]
pub struct MockInvoiceRegistry {
    pub preimages: Mutex<HashMap<Hash256, Hash256>>,
}

impl MockInvoiceRegistry {
    pub fn insert_preimage(&self, preimage: Hash256) -> Hash256 {
        let hash: Hash256 =
            (*sha256::Hash::hash(preimage.as_ref()).as_byte_array()).into();
        self.preimages.lock().unwrap().insert(hash, preimage);
        hash
    }
}

impl InvoiceRegistry for MockInvoiceRegistry {
    fn resolve_invoice(&self, payment_hash: Hash256, _amount_msat: u64) -> Option<Hash256> {
        self.preimages.lock().unwrap().get(&payment_hash).copied()
    }
}
