//! Route-blinding data: the per-hop encrypted blob, its validation against
//! the incoming HTLC, the blinded forwarding derivation, and the route hints
//! a blinded payment contributes to pathfinding.

use crate::onion::payload::{
    validate_payload_with_blinded, ErrInvalidPayload, TlvPayload, Violation,
    BLINDING_POINT_ONION_TYPE,
};
use crate::types::{Pubkey, ShortChannelId};
use crate::wire::tlv::{Reader, TlvStream};
use crate::wire::WireError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

// TLV types inside the decrypted route-blinding blob.
const SHORT_CHANNEL_ID_TYPE: u64 = 2;
const NEXT_NODE_ID_TYPE: u64 = 4;
const PATH_ID_TYPE: u64 = 6;
const NEXT_BLINDING_OVERRIDE_TYPE: u64 = 8;
const PAYMENT_RELAY_TYPE: u64 = 10;
const PAYMENT_CONSTRAINTS_TYPE: u64 = 12;

/// The forwarding parameters derived for the next hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingInfo {
    pub next_hop: ShortChannelId,
    pub amount_to_forward: u64,
    pub outgoing_cltv: u32,
    /// The ephemeral blinding point to hand the next hop, when this hop is
    /// part of a blinded route.
    pub next_blinding: Option<Pubkey>,
}

// ============================================================
// Blob contents
// ============================================================

/// Relay parameters for a blinded hop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRelayInfo {
    /// The per-htlc fee charged, in millisatoshis.
    pub base_fee: u32,
    /// The fee charged per millionth of the forwarded amount.
    pub fee_proportional: u32,
    pub cltv_delta: u16,
}

/// Restrictions placed on a blinded payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConstraints {
    pub max_cltv: u32,
    pub htlc_minimum_msat: u64,
    pub allowed_features: Vec<u8>,
}

/// The contents of a per-hop encrypted blob. Decode is permissive: a hop
/// without relay info or constraints is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlindedRouteData {
    pub short_channel_id: Option<ShortChannelId>,
    pub next_node_id: Option<Pubkey>,
    pub path_id: Option<Vec<u8>>,
    pub next_blinding_override: Option<Pubkey>,
    pub relay_info: Option<PaymentRelayInfo>,
    pub constraints: Option<PaymentConstraints>,
}

impl BlindedRouteData {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut stream = TlvStream::from_bytes(bytes)?;
        let mut data = BlindedRouteData::default();

        if let Some(raw) = stream.remove(SHORT_CHANNEL_ID_TYPE) {
            let bytes: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| WireError::InvalidLength)?;
            data.short_channel_id = Some(ShortChannelId::from_u64(u64::from_be_bytes(bytes)));
        }
        if let Some(raw) = stream.remove(NEXT_NODE_ID_TYPE) {
            data.next_node_id =
                Some(Pubkey::from_slice(&raw).map_err(|_| WireError::InvalidLength)?);
        }
        if let Some(raw) = stream.remove(PATH_ID_TYPE) {
            data.path_id = Some(raw);
        }
        if let Some(raw) = stream.remove(NEXT_BLINDING_OVERRIDE_TYPE) {
            data.next_blinding_override =
                Some(Pubkey::from_slice(&raw).map_err(|_| WireError::InvalidLength)?);
        }
        if let Some(raw) = stream.remove(PAYMENT_RELAY_TYPE) {
            if raw.len() != 10 {
                return Err(WireError::InvalidLength);
            }
            let mut r = Reader::new(&raw);
            data.relay_info = Some(PaymentRelayInfo {
                base_fee: r.read_u32()?,
                fee_proportional: r.read_u32()?,
                cltv_delta: r.read_u16()?,
            });
        }
        if let Some(raw) = stream.remove(PAYMENT_CONSTRAINTS_TYPE) {
            if raw.len() < 12 {
                return Err(WireError::InvalidLength);
            }
            let mut r = Reader::new(&raw);
            data.constraints = Some(PaymentConstraints {
                max_cltv: r.read_u32()?,
                htlc_minimum_msat: r.read_u64()?,
                allowed_features: r.read_rest().to_vec(),
            });
        }
        Ok(data)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = TlvStream::new();
        if let Some(scid) = self.short_channel_id {
            stream
                .insert(SHORT_CHANNEL_ID_TYPE, scid.to_u64().to_be_bytes().to_vec())
                .expect("fresh stream");
        }
        if let Some(node_id) = &self.next_node_id {
            stream
                .insert(NEXT_NODE_ID_TYPE, node_id.serialize().to_vec())
                .expect("fresh stream");
        }
        if let Some(path_id) = &self.path_id {
            stream
                .insert(PATH_ID_TYPE, path_id.clone())
                .expect("fresh stream");
        }
        if let Some(point) = &self.next_blinding_override {
            stream
                .insert(NEXT_BLINDING_OVERRIDE_TYPE, point.serialize().to_vec())
                .expect("fresh stream");
        }
        if let Some(relay) = &self.relay_info {
            let mut value = Vec::with_capacity(10);
            value.extend_from_slice(&relay.base_fee.to_be_bytes());
            value.extend_from_slice(&relay.fee_proportional.to_be_bytes());
            value.extend_from_slice(&relay.cltv_delta.to_be_bytes());
            stream
                .insert(PAYMENT_RELAY_TYPE, value)
                .expect("fresh stream");
        }
        if let Some(constraints) = &self.constraints {
            let mut value = Vec::with_capacity(12 + constraints.allowed_features.len());
            value.extend_from_slice(&constraints.max_cltv.to_be_bytes());
            value.extend_from_slice(&constraints.htlc_minimum_msat.to_be_bytes());
            value.extend_from_slice(&constraints.allowed_features);
            stream
                .insert(PAYMENT_CONSTRAINTS_TYPE, value)
                .expect("fresh stream");
        }
        stream.to_bytes()
    }

    /// Validate the fields required for payment forwarding at an intermediate
    /// blinded hop.
    pub fn validate_for_payment(&self) -> Result<(), BlindedForwardError> {
        // MUST set short_channel_id.
        if self.short_channel_id.is_none() {
            return Err(BlindedForwardError::MissingField("short_channel_id"));
        }
        // MUST set payment_relay.
        if self.relay_info.is_none() {
            return Err(BlindedForwardError::MissingField("payment_relay"));
        }
        // MUST NOT set path_id for intermediate nodes.
        if self.path_id.is_some() {
            return Err(BlindedForwardError::UnexpectedField("path_id"));
        }
        Ok(())
    }
}

// ============================================================
// Errors
// ============================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlindedForwardError {
    #[error("invalid blinding: {0}")]
    InvalidBlinding(ErrInvalidPayload),
    #[error("could not decrypt blob: {0}")]
    Decrypt(String),
    #[error("could not decode blinded data: {0}")]
    DecodeFailed(WireError),
    #[error("invalid route data: {0} required for blinded payments")]
    MissingField(&'static str),
    #[error("invalid route data: {0} not allowed for intermediate hops")]
    UnexpectedField(&'static str),
    #[error("payload not valid for blinded hop: {0}")]
    Payload(ErrInvalidPayload),
    #[error("amount {amount} below blinded route minimum {minimum}")]
    InsufficientAmount { amount: u64, minimum: u64 },
    #[error("expiry {cltv} exceeds blinded route maximum {max}")]
    MaxCltvExceeded { cltv: u32, max: u32 },
    #[error("incoming expiry {cltv} below relay delta {delta}")]
    InsufficientExpiry { cltv: u32, delta: u16 },
    #[error("unsupported features in blinded route")]
    UnsupportedFeatures,
    #[error("incoming amount: {incoming} < base fee: {base}")]
    FeeOverflow { incoming: u64, base: u32 },
    #[error("next ephemeral derivation failed: {0}")]
    NextEphemeral(String),
}

// ============================================================
// Blinding processor
// ============================================================

/// Cryptographic operations required for processing blinded hops. Extracted
/// to allow granular testing of blinded forwarding calculations.
pub trait BlindingProcessor: Send + Sync {
    /// Decrypt a blinded blob of data using the ephemeral key provided.
    fn decrypt_blinded_hop_data(
        &self,
        ephemeral: &Pubkey,
        encrypted_data: &[u8],
    ) -> Result<Vec<u8>, String>;

    /// The next hop's ephemeral key, calculated from the current one.
    fn next_ephemeral(&self, ephemeral: &Pubkey) -> Result<Pubkey, String>;
}

// ============================================================
// BlindingKit
// ============================================================

/// The components required to extract forwarding information for hops in a
/// blinded route. Carried lazily by the hop iterator so the link decides when
/// decryption happens.
#[derive(Clone)]
pub struct BlindingKit {
    pub processor: Arc<dyn BlindingProcessor>,
    /// A blinding point passed via `update_add_htlc`'s TLVs, if any.
    pub update_add_blinding: Option<Pubkey>,
    pub incoming_cltv: u32,
    pub incoming_amount: u64,
}

impl BlindingKit {
    /// Exactly one blinding point must be present for the hop: either the one
    /// relayed in `update_add_htlc` or the one in the payload.
    fn validate_blinding_point(
        &self,
        payload_blinding: Option<Pubkey>,
        is_final: bool,
    ) -> Result<Pubkey, BlindedForwardError> {
        let payload_set = payload_blinding.is_some();
        let update_set = self.update_add_blinding.is_some();
        match (payload_set, update_set) {
            (false, false) => Err(BlindedForwardError::InvalidBlinding(ErrInvalidPayload {
                tlv_type: BLINDING_POINT_ONION_TYPE,
                violation: Violation::Omitted,
                final_hop: is_final,
            })),
            (true, true) => Err(BlindedForwardError::InvalidBlinding(ErrInvalidPayload {
                tlv_type: BLINDING_POINT_ONION_TYPE,
                violation: Violation::Included,
                final_hop: is_final,
            })),
            (true, false) => Ok(payload_blinding.expect("checked above")),
            (false, true) => Ok(self.update_add_blinding.expect("checked above")),
        }
    }

    /// Perform all operations required to decrypt and validate a blinded hop:
    /// pick the blinding point, decrypt the blob, decode and cross-validate
    /// it, then derive the forwarding amount, expiry and next ephemeral key.
    pub fn decrypt_and_validate_fwd_info(
        &self,
        payload: &TlvPayload,
        is_final: bool,
        parsed_types: &BTreeSet<u64>,
    ) -> Result<ForwardingInfo, BlindedForwardError> {
        let blinding_point = self.validate_blinding_point(payload.blinding_point, is_final)?;

        let encrypted_data = payload.encrypted_data.as_deref().unwrap_or_default();
        let decrypted = self
            .processor
            .decrypt_blinded_hop_data(&blinding_point, encrypted_data)
            .map_err(BlindedForwardError::Decrypt)?;

        let route_data =
            BlindedRouteData::decode(&decrypted).map_err(BlindedForwardError::DecodeFailed)?;
        route_data.validate_for_payment()?;

        // Validate the payload against the blinded permitted set, then the
        // blob against the incoming HTLC.
        validate_payload_with_blinded(parsed_types, is_final)
            .map_err(BlindedForwardError::Payload)?;
        validate_blinded_route_data(&route_data, self.incoming_amount, self.incoming_cltv)?;

        let relay = route_data.relay_info.expect("validated above");
        let fwd_amount = calculate_forwarding_amount(
            self.incoming_amount,
            relay.base_fee,
            relay.fee_proportional,
        )?;
        let outgoing_cltv = self
            .incoming_cltv
            .checked_sub(relay.cltv_delta as u32)
            .ok_or(BlindedForwardError::InsufficientExpiry {
                cltv: self.incoming_cltv,
                delta: relay.cltv_delta,
            })?;

        // A blinding override replaces our tweak wholesale: the sender
        // intended the next hop to switch to that point directly.
        let next_blinding = match route_data.next_blinding_override {
            Some(point) => point,
            None => self
                .processor
                .next_ephemeral(&blinding_point)
                .map_err(BlindedForwardError::NextEphemeral)?,
        };

        Ok(ForwardingInfo {
            next_hop: route_data.short_channel_id.expect("validated above"),
            amount_to_forward: fwd_amount,
            outgoing_cltv,
            next_blinding: Some(next_blinding),
        })
    }
}

/// Validate the decrypted blob against the incoming HTLC's parameters.
pub fn validate_blinded_route_data(
    data: &BlindedRouteData,
    incoming_amount: u64,
    incoming_cltv: u32,
) -> Result<(), BlindedForwardError> {
    if let Some(constraints) = &data.constraints {
        if incoming_amount < constraints.htlc_minimum_msat {
            return Err(BlindedForwardError::InsufficientAmount {
                amount: incoming_amount,
                minimum: constraints.htlc_minimum_msat,
            });
        }
        if incoming_cltv > constraints.max_cltv {
            return Err(BlindedForwardError::MaxCltvExceeded {
                cltv: incoming_cltv,
                max: constraints.max_cltv,
            });
        }
        // We advertise no feature bits, so any required feature is
        // unsupported.
        if constraints.allowed_features.iter().any(|b| *b != 0) {
            return Err(BlindedForwardError::UnsupportedFeatures);
        }
    }
    Ok(())
}

/// The amount to forward for a blinded hop.
///
/// The sender does not give us the amount to forward, so it has to be solved
/// for from the incoming amount:
///
/// `amt_to_forward = ceil((incoming_amount - base_fee) * 1e6 / (1e6 + fee_rate))`
///
/// using `ceil(a/b) = (a + b - 1)/b` so that rounding never shorts the
/// receiver.
pub fn calculate_forwarding_amount(
    incoming_amount: u64,
    base_fee: u32,
    proportional_fee: u32,
) -> Result<u64, BlindedForwardError> {
    if incoming_amount < base_fee as u64 {
        return Err(BlindedForwardError::FeeOverflow {
            incoming: incoming_amount,
            base: base_fee,
        });
    }
    let numerator = (incoming_amount - base_fee as u64) as u128 * 1_000_000;
    let denominator = 1_000_000 + proportional_fee as u128;
    let ceiling = (numerator + denominator - 1) / denominator;
    Ok(ceiling as u64)
}

// ============================================================
// Blinded payments and route hints
// ============================================================

/// One hop of a blinded path as handed to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedHop {
    /// The blinded node pubkey (unblinded for the introduction node).
    pub node_pub: Pubkey,
    pub encrypted_payload: Vec<u8>,
}

/// The path and aggregate parameters required to pay into a blinded route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedPayment {
    /// The unblinded introduction point followed by the blinded hops.
    pub introduction_point: Pubkey,
    pub blinded_hops: Vec<BlindedHop>,
    /// Aggregate relay parameters for the whole blinded section.
    pub relay_info: Option<PaymentRelayInfo>,
    /// Aggregate constraints for the blinded section.
    pub constraints: Option<PaymentConstraints>,
    pub features: Vec<u8>,
}

/// A pathfinding hint contributed by a blinded payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHint {
    pub to_node: Pubkey,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
}

impl BlindedPayment {
    pub fn validate(&self) -> Result<(), BlindedForwardError> {
        if self.relay_info.is_none() {
            return Err(BlindedForwardError::MissingField("relay_info"));
        }
        if self.constraints.is_none() {
            return Err(BlindedForwardError::MissingField("constraints"));
        }
        // The introduction node is counted as the first hop, so at least one
        // entry is expected.
        if self.blinded_hops.is_empty() {
            return Err(BlindedForwardError::MissingField("blinded_hops"));
        }
        Ok(())
    }

    /// Produce chained route hints for pathfinding. The hint out of the
    /// introduction node carries the aggregate policy so pathfinding budgets
    /// enough fee and delay for the whole blinded section; hints between
    /// blinded hops are zero-cost because their real parameters live in the
    /// encrypted blobs.
    pub fn to_route_hints(&self) -> HashMap<Pubkey, Vec<RouteHint>> {
        // A single-hop path contains only the introduction node, which
        // pathfinding can already locate in the graph.
        if self.blinded_hops.len() <= 1 {
            return HashMap::new();
        }

        let relay = self.relay_info.expect("validated");
        let constraints = self.constraints.as_ref().expect("validated");

        let mut hints = HashMap::new();
        hints.insert(
            self.introduction_point,
            vec![RouteHint {
                to_node: self.blinded_hops[1].node_pub,
                cltv_expiry_delta: relay.cltv_delta,
                htlc_minimum_msat: constraints.htlc_minimum_msat,
                fee_base_msat: relay.base_fee,
                fee_proportional_millionths: relay.fee_proportional,
            }],
        );

        for window in self.blinded_hops[1..].windows(2) {
            hints.insert(
                window[0].node_pub,
                vec![RouteHint {
                    to_node: window[1].node_pub,
                    cltv_expiry_delta: 0,
                    htlc_minimum_msat: 0,
                    fee_base_msat: 0,
                    fee_proportional_millionths: 0,
                }],
            );
        }
        hints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProcessor {
        decrypted: Vec<u8>,
        next: Pubkey,
    }

    impl BlindingProcessor for StaticProcessor {
        fn decrypt_blinded_hop_data(
            &self,
            _ephemeral: &Pubkey,
            _encrypted_data: &[u8],
        ) -> Result<Vec<u8>, String> {
            Ok(self.decrypted.clone())
        }

        fn next_ephemeral(&self, _ephemeral: &Pubkey) -> Result<Pubkey, String> {
            Ok(self.next)
        }
    }

    fn rand_pubkey() -> Pubkey {
        let (_, pk) = secp256k1::generate_keypair(&mut rand::thread_rng());
        pk.into()
    }

    fn relay_data(base: u32, prop: u32, delta: u16) -> BlindedRouteData {
        BlindedRouteData {
            short_channel_id: Some(ShortChannelId::from_u64(1)),
            relay_info: Some(PaymentRelayInfo {
                base_fee: base,
                fee_proportional: prop,
                cltv_delta: delta,
            }),
            constraints: Some(PaymentConstraints {
                max_cltv: 1_000_000,
                htlc_minimum_msat: 0,
                allowed_features: Vec::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_blinded_route_data_roundtrip() {
        let data = BlindedRouteData {
            short_channel_id: Some(ShortChannelId::new(100, 2, 3)),
            next_node_id: Some(rand_pubkey()),
            path_id: None,
            next_blinding_override: Some(rand_pubkey()),
            relay_info: Some(PaymentRelayInfo {
                base_fee: 1_000,
                fee_proportional: 500,
                cltv_delta: 40,
            }),
            constraints: Some(PaymentConstraints {
                max_cltv: 800_000,
                htlc_minimum_msat: 1_000,
                allowed_features: vec![0, 0],
            }),
        };
        let decoded = BlindedRouteData::decode(&data.encode()).expect("decode");
        assert_eq!(data, decoded);
    }

    #[test]
    fn test_terminal_blob_decodes_without_relay_info() {
        let data = BlindedRouteData {
            path_id: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        let decoded = BlindedRouteData::decode(&data.encode()).expect("decode");
        assert_eq!(decoded.relay_info, None);
        assert_eq!(decoded.constraints, None);
        assert_eq!(decoded.path_id, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_validate_for_payment() {
        let valid = relay_data(1, 1, 10);
        valid.validate_for_payment().expect("valid");

        let mut missing_scid = relay_data(1, 1, 10);
        missing_scid.short_channel_id = None;
        assert_eq!(
            missing_scid.validate_for_payment(),
            Err(BlindedForwardError::MissingField("short_channel_id"))
        );

        let mut with_path_id = relay_data(1, 1, 10);
        with_path_id.path_id = Some(vec![0]);
        assert_eq!(
            with_path_id.validate_for_payment(),
            Err(BlindedForwardError::UnexpectedField("path_id"))
        );
    }

    #[test]
    fn test_forwarding_amount_formula() {
        assert_eq!(
            calculate_forwarding_amount(10_002_020, 1_000, 1).expect("amount"),
            10_001_010
        );
        assert_eq!(
            calculate_forwarding_amount(100_000, 1_000, 10).expect("amount"),
            99_000
        );
        assert!(matches!(
            calculate_forwarding_amount(100, 1_000, 10),
            Err(BlindedForwardError::FeeOverflow { .. })
        ));
    }

    #[test]
    fn test_derive_forwarding_info() {
        let next = rand_pubkey();
        let kit = BlindingKit {
            processor: Arc::new(StaticProcessor {
                decrypted: relay_data(20, 0, 40).encode(),
                next,
            }),
            update_add_blinding: Some(rand_pubkey()),
            incoming_cltv: 50,
            incoming_amount: 100,
        };
        let payload = TlvPayload {
            encrypted_data: Some(vec![0xaa; 50]),
            ..Default::default()
        };
        let parsed: BTreeSet<u64> = [crate::onion::payload::ENCRYPTED_DATA_ONION_TYPE]
            .into_iter()
            .collect();

        let info = kit
            .decrypt_and_validate_fwd_info(&payload, false, &parsed)
            .expect("derive");
        assert_eq!(info.next_hop, ShortChannelId::from_u64(1));
        assert_eq!(info.amount_to_forward, 80);
        assert_eq!(info.outgoing_cltv, 10);
        assert_eq!(info.next_blinding, Some(next));
    }

    #[test]
    fn test_both_blinding_points_rejected() {
        let kit = BlindingKit {
            processor: Arc::new(StaticProcessor {
                decrypted: Vec::new(),
                next: rand_pubkey(),
            }),
            update_add_blinding: Some(rand_pubkey()),
            incoming_cltv: 50,
            incoming_amount: 100,
        };
        let payload = TlvPayload {
            encrypted_data: Some(vec![0xaa; 10]),
            blinding_point: Some(rand_pubkey()),
            ..Default::default()
        };
        let err = kit
            .decrypt_and_validate_fwd_info(&payload, false, &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            BlindedForwardError::InvalidBlinding(ErrInvalidPayload {
                violation: Violation::Included,
                ..
            })
        ));
    }

    #[test]
    fn test_no_blinding_point_rejected() {
        let kit = BlindingKit {
            processor: Arc::new(StaticProcessor {
                decrypted: Vec::new(),
                next: rand_pubkey(),
            }),
            update_add_blinding: None,
            incoming_cltv: 50,
            incoming_amount: 100,
        };
        let payload = TlvPayload {
            encrypted_data: Some(vec![0xaa; 10]),
            ..Default::default()
        };
        let err = kit
            .decrypt_and_validate_fwd_info(&payload, false, &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            BlindedForwardError::InvalidBlinding(ErrInvalidPayload {
                violation: Violation::Omitted,
                ..
            })
        ));
    }

    #[test]
    fn test_blinding_override_wins() {
        let next = rand_pubkey();
        let override_point = rand_pubkey();
        let mut data = relay_data(0, 0, 0);
        data.next_blinding_override = Some(override_point);
        let kit = BlindingKit {
            processor: Arc::new(StaticProcessor {
                decrypted: data.encode(),
                next,
            }),
            update_add_blinding: Some(rand_pubkey()),
            incoming_cltv: 50,
            incoming_amount: 100,
        };
        let payload = TlvPayload {
            encrypted_data: Some(vec![0xaa; 10]),
            ..Default::default()
        };
        let info = kit
            .decrypt_and_validate_fwd_info(&payload, false, &BTreeSet::new())
            .expect("derive");
        assert_eq!(info.next_blinding, Some(override_point));
    }

    #[test]
    fn test_constraint_violations() {
        let mut data = relay_data(0, 0, 0);
        data.constraints = Some(PaymentConstraints {
            max_cltv: 40,
            htlc_minimum_msat: 1_000,
            allowed_features: Vec::new(),
        });

        assert!(matches!(
            validate_blinded_route_data(&data, 100, 30),
            Err(BlindedForwardError::InsufficientAmount { .. })
        ));
        assert!(matches!(
            validate_blinded_route_data(&data, 2_000, 50),
            Err(BlindedForwardError::MaxCltvExceeded { .. })
        ));
        validate_blinded_route_data(&data, 2_000, 30).expect("valid");
    }

    #[test]
    fn test_route_hints() {
        let intro = rand_pubkey();
        let hop1 = rand_pubkey();
        let hop2 = rand_pubkey();
        let payment = BlindedPayment {
            introduction_point: intro,
            blinded_hops: vec![
                BlindedHop {
                    node_pub: intro,
                    encrypted_payload: vec![1],
                },
                BlindedHop {
                    node_pub: hop1,
                    encrypted_payload: vec![2],
                },
                BlindedHop {
                    node_pub: hop2,
                    encrypted_payload: vec![3],
                },
            ],
            relay_info: Some(PaymentRelayInfo {
                base_fee: 1_500,
                fee_proportional: 100,
                cltv_delta: 125,
            }),
            constraints: Some(PaymentConstraints {
                max_cltv: 800_000,
                htlc_minimum_msat: 1_000,
                allowed_features: Vec::new(),
            }),
            features: Vec::new(),
        };
        payment.validate().expect("valid");

        let hints = payment.to_route_hints();
        assert_eq!(hints.len(), 2);

        let intro_hint = &hints[&intro][0];
        assert_eq!(intro_hint.to_node, hop1);
        assert_eq!(intro_hint.fee_base_msat, 1_500);
        assert_eq!(intro_hint.cltv_expiry_delta, 125);

        let inner_hint = &hints[&hop1][0];
        assert_eq!(inner_hint.to_node, hop2);
        assert_eq!(inner_hint.fee_base_msat, 0);
        assert_eq!(inner_hint.cltv_expiry_delta, 0);
    }

    #[test]
    fn test_single_hop_path_needs_no_hints() {
        let intro = rand_pubkey();
        let payment = BlindedPayment {
            introduction_point: intro,
            blinded_hops: vec![BlindedHop {
                node_pub: intro,
                encrypted_payload: vec![1],
            }],
            relay_info: Some(PaymentRelayInfo {
                base_fee: 0,
                fee_proportional: 0,
                cltv_delta: 0,
            }),
            constraints: Some(PaymentConstraints {
                max_cltv: 0,
                htlc_minimum_msat: 0,
                allowed_features: Vec::new(),
            }),
            features: Vec::new(),
        };
        assert!(payment.to_route_hints().is_empty());
    }
}
