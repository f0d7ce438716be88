//! Per-hop payloads peeled out of the onion.
//!
//! A payload is either a legacy fixed tuple or a TLV stream; the two are kept
//! as a tagged variant and never conflated.

use crate::types::{Hash256, Pubkey, ShortChannelId};
use crate::wire::tlv::{read_tu32, read_tu64, write_tu32, write_tu64, Reader, TlvStream,
    MIN_CUSTOM_RECORDS_TLV_TYPE};
use crate::wire::{CustomRecords, FailureCode, WireError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

/// TLV types inside a hop payload.
pub const AMT_ONION_TYPE: u64 = 2;
pub const LOCK_TIME_ONION_TYPE: u64 = 4;
pub const NEXT_HOP_ONION_TYPE: u64 = 6;
pub const PAYMENT_DATA_ONION_TYPE: u64 = 8;
pub const ENCRYPTED_DATA_ONION_TYPE: u64 = 10;
pub const BLINDING_POINT_ONION_TYPE: u64 = 12;
pub const METADATA_ONION_TYPE: u64 = 16;
pub const TOTAL_AMT_MSAT_BLINDED_TYPE: u64 = 18;

/// The size of a legacy (realm 0) hop data tuple: 8-byte next SCID, 8-byte
/// amount, 4-byte expiry and 12 bytes of padding.
pub const LEGACY_HOP_DATA_SIZE: usize = 32;

/// How a hop payload violated the payload rules for its position.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    /// A required record was omitted.
    Omitted,
    /// A forbidden record was included.
    Included,
}

/// A violation of the onion payload rules, naming the offending TLV type.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("onion payload violation: type {tlv_type} {violation:?} (final hop: {final_hop})")]
pub struct ErrInvalidPayload {
    pub tlv_type: u64,
    pub violation: Violation,
    pub final_hop: bool,
}

impl ErrInvalidPayload {
    /// The wire failure code for this violation on an unblinded hop. Blinded
    /// hops map every failure to `InvalidOnionBlinding` instead.
    pub fn fail_code(&self) -> FailureCode {
        FailureCode::InvalidOnionPayload
    }
}

// ============================================================
// Legacy payload
// ============================================================

/// The fixed realm-0 forwarding tuple.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyPayload {
    pub next_hop: ShortChannelId,
    pub amt_to_forward: u64,
    pub outgoing_cltv: u32,
}

impl LegacyPayload {
    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        let next_hop = ShortChannelId::from_u64(r.read_u64()?);
        let amt_to_forward = r.read_u64()?;
        let outgoing_cltv = r.read_u32()?;
        // Padding reserved for future use.
        r.take(12)?;
        Ok(Self {
            next_hop,
            amt_to_forward,
            outgoing_cltv,
        })
    }

    pub fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.next_hop.to_u64().to_be_bytes());
        w.extend_from_slice(&self.amt_to_forward.to_be_bytes());
        w.extend_from_slice(&self.outgoing_cltv.to_be_bytes());
        w.extend_from_slice(&[0u8; 12]);
    }
}

// ============================================================
// TLV payload
// ============================================================

/// Payment data for the final hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentData {
    pub payment_secret: Hash256,
    pub total_msat: u64,
}

/// A TLV hop payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlvPayload {
    pub amt_to_forward: Option<u64>,
    pub outgoing_cltv: Option<u32>,
    pub next_hop: Option<ShortChannelId>,
    pub payment_data: Option<PaymentData>,
    /// The route-blinding blob, still encrypted at parse time.
    pub encrypted_data: Option<Vec<u8>>,
    /// The current blinding point, set by the sender on the introduction hop.
    pub blinding_point: Option<Pubkey>,
    pub metadata: Option<Vec<u8>>,
    pub total_amt_msat: Option<u64>,
    pub custom_records: CustomRecords,
    /// Every TLV type that was present, including ones we do not interpret.
    pub parsed_types: BTreeSet<u64>,
}

impl TlvPayload {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ErrPayloadDecode> {
        let mut stream =
            TlvStream::from_bytes(bytes).map_err(ErrPayloadDecode::Wire)?;
        let parsed_types: BTreeSet<u64> = stream.parsed_types().collect();

        // The even/odd rule applies inside the onion too.
        stream
            .ensure_understood(|t| {
                matches!(
                    t,
                    AMT_ONION_TYPE
                        | LOCK_TIME_ONION_TYPE
                        | NEXT_HOP_ONION_TYPE
                        | PAYMENT_DATA_ONION_TYPE
                        | ENCRYPTED_DATA_ONION_TYPE
                        | BLINDING_POINT_ONION_TYPE
                        | METADATA_ONION_TYPE
                        | TOTAL_AMT_MSAT_BLINDED_TYPE
                ) || t >= MIN_CUSTOM_RECORDS_TLV_TYPE
            })
            .map_err(|err| match err {
                WireError::UnknownRequiredType(t) => ErrPayloadDecode::UnknownRequiredType(t),
                other => ErrPayloadDecode::Wire(other),
            })?;

        let mut payload = TlvPayload {
            parsed_types,
            ..Default::default()
        };

        if let Some(raw) = stream.remove(AMT_ONION_TYPE) {
            payload.amt_to_forward = Some(read_tu64(&raw).map_err(ErrPayloadDecode::Wire)?);
        }
        if let Some(raw) = stream.remove(LOCK_TIME_ONION_TYPE) {
            payload.outgoing_cltv = Some(read_tu32(&raw).map_err(ErrPayloadDecode::Wire)?);
        }
        if let Some(raw) = stream.remove(NEXT_HOP_ONION_TYPE) {
            let bytes: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| ErrPayloadDecode::Wire(WireError::InvalidLength))?;
            payload.next_hop = Some(ShortChannelId::from_u64(u64::from_be_bytes(bytes)));
        }
        if let Some(raw) = stream.remove(PAYMENT_DATA_ONION_TYPE) {
            let mut r = Reader::new(&raw);
            let payment_secret: Hash256 = r
                .read_bytes32()
                .map_err(ErrPayloadDecode::Wire)?
                .into();
            let total_msat = read_tu64(r.read_rest()).map_err(ErrPayloadDecode::Wire)?;
            payload.payment_data = Some(PaymentData {
                payment_secret,
                total_msat,
            });
        }
        if let Some(raw) = stream.remove(ENCRYPTED_DATA_ONION_TYPE) {
            payload.encrypted_data = Some(raw);
        }
        if let Some(raw) = stream.remove(BLINDING_POINT_ONION_TYPE) {
            payload.blinding_point = Some(
                Pubkey::from_slice(&raw)
                    .map_err(|_| ErrPayloadDecode::Wire(WireError::InvalidLength))?,
            );
        }
        if let Some(raw) = stream.remove(METADATA_ONION_TYPE) {
            payload.metadata = Some(raw);
        }
        if let Some(raw) = stream.remove(TOTAL_AMT_MSAT_BLINDED_TYPE) {
            payload.total_amt_msat = Some(read_tu64(&raw).map_err(ErrPayloadDecode::Wire)?);
        }
        payload.custom_records = stream.split_custom_records(&HashSet::new());
        Ok(payload)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut stream = TlvStream::new();
        if let Some(amt) = self.amt_to_forward {
            let mut value = Vec::new();
            write_tu64(&mut value, amt);
            stream.insert(AMT_ONION_TYPE, value).expect("fresh stream");
        }
        if let Some(cltv) = self.outgoing_cltv {
            let mut value = Vec::new();
            write_tu32(&mut value, cltv);
            stream
                .insert(LOCK_TIME_ONION_TYPE, value)
                .expect("fresh stream");
        }
        if let Some(next_hop) = self.next_hop {
            stream
                .insert(NEXT_HOP_ONION_TYPE, next_hop.to_u64().to_be_bytes().to_vec())
                .expect("fresh stream");
        }
        if let Some(payment_data) = &self.payment_data {
            let mut value = Vec::new();
            value.extend_from_slice(payment_data.payment_secret.as_ref());
            write_tu64(&mut value, payment_data.total_msat);
            stream
                .insert(PAYMENT_DATA_ONION_TYPE, value)
                .expect("fresh stream");
        }
        if let Some(encrypted_data) = &self.encrypted_data {
            stream
                .insert(ENCRYPTED_DATA_ONION_TYPE, encrypted_data.clone())
                .expect("fresh stream");
        }
        if let Some(blinding_point) = &self.blinding_point {
            stream
                .insert(BLINDING_POINT_ONION_TYPE, blinding_point.serialize().to_vec())
                .expect("fresh stream");
        }
        if let Some(metadata) = &self.metadata {
            stream
                .insert(METADATA_ONION_TYPE, metadata.clone())
                .expect("fresh stream");
        }
        if let Some(total) = self.total_amt_msat {
            let mut value = Vec::new();
            write_tu64(&mut value, total);
            stream
                .insert(TOTAL_AMT_MSAT_BLINDED_TYPE, value)
                .expect("fresh stream");
        }
        for (key, value) in &self.custom_records.0 {
            stream.insert(*key, value.clone()).expect("validated keys");
        }
        stream.to_bytes()
    }
}

/// Failures while decoding a hop payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrPayloadDecode {
    #[error("payload codec error: {0}")]
    Wire(WireError),
    #[error("unknown required payload type: {0}")]
    UnknownRequiredType(u64),
    #[error("{0}")]
    Violation(ErrInvalidPayload),
}

// ============================================================
// HopPayload
// ============================================================

/// A hop payload: legacy fixed tuple or TLV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopPayload {
    Legacy(LegacyPayload),
    Tlv(TlvPayload),
}

impl HopPayload {
    pub fn next_hop(&self) -> Option<ShortChannelId> {
        match self {
            HopPayload::Legacy(p) => Some(p.next_hop),
            HopPayload::Tlv(p) => p.next_hop,
        }
    }

    pub fn amt_to_forward(&self) -> Option<u64> {
        match self {
            HopPayload::Legacy(p) => Some(p.amt_to_forward),
            HopPayload::Tlv(p) => p.amt_to_forward,
        }
    }

    pub fn outgoing_cltv(&self) -> Option<u32> {
        match self {
            HopPayload::Legacy(p) => Some(p.outgoing_cltv),
            HopPayload::Tlv(p) => p.outgoing_cltv,
        }
    }

    pub fn encrypted_data(&self) -> Option<&[u8]> {
        match self {
            HopPayload::Legacy(_) => None,
            HopPayload::Tlv(p) => p.encrypted_data.as_deref(),
        }
    }

    pub fn blinding_point(&self) -> Option<Pubkey> {
        match self {
            HopPayload::Legacy(_) => None,
            HopPayload::Tlv(p) => p.blinding_point,
        }
    }

    pub fn custom_records(&self) -> Option<&CustomRecords> {
        match self {
            HopPayload::Legacy(_) => None,
            HopPayload::Tlv(p) => Some(&p.custom_records),
        }
    }

    pub fn parsed_types(&self) -> BTreeSet<u64> {
        match self {
            HopPayload::Legacy(_) => BTreeSet::new(),
            HopPayload::Tlv(p) => p.parsed_types.clone(),
        }
    }
}

// ============================================================
// Position validation
// ============================================================

/// Validate the presence rules for an unblinded hop payload.
pub fn validate_parsed_payload_types(
    parsed: &BTreeSet<u64>,
    is_final: bool,
) -> Result<(), ErrInvalidPayload> {
    let has = |t: u64| parsed.contains(&t);

    // A blinded payload has its own rule set.
    if has(ENCRYPTED_DATA_ONION_TYPE) {
        return Ok(());
    }

    if !has(AMT_ONION_TYPE) {
        return Err(ErrInvalidPayload {
            tlv_type: AMT_ONION_TYPE,
            violation: Violation::Omitted,
            final_hop: is_final,
        });
    }
    if !has(LOCK_TIME_ONION_TYPE) {
        return Err(ErrInvalidPayload {
            tlv_type: LOCK_TIME_ONION_TYPE,
            violation: Violation::Omitted,
            final_hop: is_final,
        });
    }

    if is_final {
        if has(NEXT_HOP_ONION_TYPE) {
            return Err(ErrInvalidPayload {
                tlv_type: NEXT_HOP_ONION_TYPE,
                violation: Violation::Included,
                final_hop: true,
            });
        }
    } else {
        if !has(NEXT_HOP_ONION_TYPE) {
            return Err(ErrInvalidPayload {
                tlv_type: NEXT_HOP_ONION_TYPE,
                violation: Violation::Omitted,
                final_hop: false,
            });
        }
        if has(PAYMENT_DATA_ONION_TYPE) {
            return Err(ErrInvalidPayload {
                tlv_type: PAYMENT_DATA_ONION_TYPE,
                violation: Violation::Included,
                final_hop: false,
            });
        }
        if has(METADATA_ONION_TYPE) {
            return Err(ErrInvalidPayload {
                tlv_type: METADATA_ONION_TYPE,
                violation: Violation::Included,
                final_hop: false,
            });
        }
    }
    Ok(())
}

/// Validate that every non-custom type present is permitted for a blinded
/// hop. The permitted set differs between intermediate and final hops.
pub fn validate_payload_with_blinded(
    parsed: &BTreeSet<u64>,
    is_final: bool,
) -> Result<(), ErrInvalidPayload> {
    let permitted: &[u64] = if is_final {
        &[
            AMT_ONION_TYPE,
            LOCK_TIME_ONION_TYPE,
            ENCRYPTED_DATA_ONION_TYPE,
            BLINDING_POINT_ONION_TYPE,
            TOTAL_AMT_MSAT_BLINDED_TYPE,
        ]
    } else {
        &[ENCRYPTED_DATA_ONION_TYPE, BLINDING_POINT_ONION_TYPE]
    };

    for tlv_type in parsed {
        if *tlv_type >= MIN_CUSTOM_RECORDS_TLV_TYPE {
            continue;
        }
        if !permitted.contains(tlv_type) {
            return Err(ErrInvalidPayload {
                tlv_type: *tlv_type,
                violation: Violation::Included,
                final_hop: is_final,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rand_pubkey() -> Pubkey {
        let (_, pk) = secp256k1::generate_keypair(&mut rand::thread_rng());
        pk.into()
    }

    #[test]
    fn test_legacy_payload_roundtrip() {
        let payload = LegacyPayload {
            next_hop: ShortChannelId::new(500_000, 10, 1),
            amt_to_forward: 123_456,
            outgoing_cltv: 800_000,
        };
        let mut buf = Vec::new();
        payload.write(&mut buf);
        assert_eq!(buf.len(), LEGACY_HOP_DATA_SIZE);
        let decoded = LegacyPayload::read(&mut Reader::new(&buf)).expect("read");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_tlv_payload_roundtrip() {
        let mut custom_records = CustomRecords::new();
        custom_records.insert(MIN_CUSTOM_RECORDS_TLV_TYPE + 7, vec![1, 2, 3]);
        let payload = TlvPayload {
            amt_to_forward: Some(100_000),
            outgoing_cltv: Some(800_100),
            next_hop: Some(ShortChannelId::new(500_000, 10, 1)),
            custom_records,
            ..Default::default()
        };
        let bytes = payload.to_bytes();
        let decoded = TlvPayload::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded.amt_to_forward, payload.amt_to_forward);
        assert_eq!(decoded.outgoing_cltv, payload.outgoing_cltv);
        assert_eq!(decoded.next_hop, payload.next_hop);
        assert_eq!(decoded.custom_records, payload.custom_records);
    }

    #[test]
    fn test_tlv_payload_rejects_unknown_even_type() {
        let mut stream = TlvStream::new();
        stream.insert(14, vec![0]).expect("insert");
        let result = TlvPayload::from_bytes(&stream.to_bytes());
        assert_eq!(result, Err(ErrPayloadDecode::UnknownRequiredType(14)));
    }

    #[test]
    fn test_intermediate_requires_next_hop() {
        let parsed: BTreeSet<u64> = [AMT_ONION_TYPE, LOCK_TIME_ONION_TYPE].into_iter().collect();
        let err = validate_parsed_payload_types(&parsed, false).unwrap_err();
        assert_eq!(err.tlv_type, NEXT_HOP_ONION_TYPE);
        assert_eq!(err.violation, Violation::Omitted);
    }

    #[test]
    fn test_final_forbids_next_hop() {
        let parsed: BTreeSet<u64> = [AMT_ONION_TYPE, LOCK_TIME_ONION_TYPE, NEXT_HOP_ONION_TYPE]
            .into_iter()
            .collect();
        let err = validate_parsed_payload_types(&parsed, true).unwrap_err();
        assert_eq!(err.tlv_type, NEXT_HOP_ONION_TYPE);
        assert_eq!(err.violation, Violation::Included);
        assert!(err.final_hop);
    }

    #[test]
    fn test_blinded_intermediate_permitted_set() {
        let parsed: BTreeSet<u64> = [ENCRYPTED_DATA_ONION_TYPE, BLINDING_POINT_ONION_TYPE]
            .into_iter()
            .collect();
        validate_payload_with_blinded(&parsed, false).expect("permitted");

        let parsed: BTreeSet<u64> = [ENCRYPTED_DATA_ONION_TYPE, AMT_ONION_TYPE]
            .into_iter()
            .collect();
        let err = validate_payload_with_blinded(&parsed, false).unwrap_err();
        assert_eq!(err.tlv_type, AMT_ONION_TYPE);
        assert_eq!(err.violation, Violation::Included);
    }

    #[test]
    fn test_blinded_final_permits_amounts() {
        let parsed: BTreeSet<u64> = [
            AMT_ONION_TYPE,
            LOCK_TIME_ONION_TYPE,
            ENCRYPTED_DATA_ONION_TYPE,
            TOTAL_AMT_MSAT_BLINDED_TYPE,
        ]
        .into_iter()
        .collect();
        validate_payload_with_blinded(&parsed, true).expect("permitted");
    }

    #[test]
    fn test_blinded_custom_records_permitted() {
        let parsed: BTreeSet<u64> =
            [ENCRYPTED_DATA_ONION_TYPE, MIN_CUSTOM_RECORDS_TLV_TYPE + 1]
                .into_iter()
                .collect();
        validate_payload_with_blinded(&parsed, false).expect("custom records pass through");
    }

    #[test]
    fn test_payload_with_blinding_point() {
        let payload = TlvPayload {
            encrypted_data: Some(vec![9; 40]),
            blinding_point: Some(rand_pubkey()),
            ..Default::default()
        };
        let decoded = TlvPayload::from_bytes(&payload.to_bytes()).expect("decode");
        assert_eq!(decoded.encrypted_data, payload.encrypted_data);
        assert_eq!(decoded.blinding_point, payload.blinding_point);
    }
}
