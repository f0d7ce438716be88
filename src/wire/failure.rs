//! HTLC failure codes and failure reasons as carried in `update_fail_htlc`
//! reason blobs and `update_fail_malformed_htlc` codes.

use super::messages::ChannelUpdate;
use super::tlv::Reader;
use super::WireError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

// The onion packet is invalid
const BADONION: u16 = 0x8000;
// Permanent errors (otherwise transient)
const PERM: u16 = 0x4000;
// Node related errors (otherwise channels)
const NODE: u16 = 0x2000;
// Channel forwarding parameter was violated
const UPDATE: u16 = 0x1000;

/// Failure codes for HTLC resolution.
#[repr(u16)]
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumString,
    TryFromPrimitive,
    IntoPrimitive,
)]
pub enum FailureCode {
    TemporaryNodeFailure = NODE | 2,
    PermanentNodeFailure = PERM | NODE | 2,
    RequiredNodeFeatureMissing = PERM | NODE | 3,
    InvalidOnionVersion = BADONION | PERM | 4,
    InvalidOnionHmac = BADONION | PERM | 5,
    InvalidOnionKey = BADONION | PERM | 6,
    TemporaryChannelFailure = UPDATE | 7,
    PermanentChannelFailure = PERM | 8,
    RequiredChannelFeatureMissing = PERM | 9,
    UnknownNextPeer = PERM | 10,
    AmountBelowMinimum = UPDATE | 11,
    FeeInsufficient = UPDATE | 12,
    IncorrectCltvExpiry = UPDATE | 13,
    ExpiryTooSoon = UPDATE | 14,
    IncorrectOrUnknownPaymentDetails = PERM | 15,
    FinalIncorrectCltvExpiry = 18,
    FinalIncorrectHtlcAmount = 19,
    ChannelDisabled = UPDATE | 20,
    ExpiryTooFar = 21,
    InvalidOnionPayload = PERM | 22,
    MppTimeout = 23,
    InvalidOnionBlinding = BADONION | PERM | 24,
}

impl FailureCode {
    pub fn is_node(&self) -> bool {
        *self as u16 & NODE != 0
    }

    pub fn is_bad_onion(&self) -> bool {
        *self as u16 & BADONION != 0
    }

    pub fn is_perm(&self) -> bool {
        *self as u16 & PERM != 0
    }

    pub fn is_update(&self) -> bool {
        *self as u16 & UPDATE != 0
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// A decoded failure reason: the failure code plus whatever context that code
/// carries. UPDATE-class codes attach the reporting channel's current policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Codes that carry no additional context.
    Code(FailureCode),
    TemporaryChannelFailure {
        update: Option<ChannelUpdate>,
    },
    AmountBelowMinimum {
        htlc_msat: u64,
        update: ChannelUpdate,
    },
    FeeInsufficient {
        htlc_msat: u64,
        update: ChannelUpdate,
    },
    IncorrectCltvExpiry {
        cltv_expiry: u32,
        update: ChannelUpdate,
    },
    ExpiryTooSoon {
        update: ChannelUpdate,
    },
    ChannelDisabled {
        flags: u16,
        update: ChannelUpdate,
    },
    FinalIncorrectCltvExpiry {
        cltv_expiry: u32,
    },
    FinalIncorrectHtlcAmount {
        htlc_msat: u64,
    },
    InvalidOnionPayload {
        tlv_type: u64,
        offset: u16,
    },
}

impl FailureReason {
    pub fn code(&self) -> FailureCode {
        match self {
            FailureReason::Code(code) => *code,
            FailureReason::TemporaryChannelFailure { .. } => FailureCode::TemporaryChannelFailure,
            FailureReason::AmountBelowMinimum { .. } => FailureCode::AmountBelowMinimum,
            FailureReason::FeeInsufficient { .. } => FailureCode::FeeInsufficient,
            FailureReason::IncorrectCltvExpiry { .. } => FailureCode::IncorrectCltvExpiry,
            FailureReason::ExpiryTooSoon { .. } => FailureCode::ExpiryTooSoon,
            FailureReason::ChannelDisabled { .. } => FailureCode::ChannelDisabled,
            FailureReason::FinalIncorrectCltvExpiry { .. } => {
                FailureCode::FinalIncorrectCltvExpiry
            }
            FailureReason::FinalIncorrectHtlcAmount { .. } => {
                FailureCode::FinalIncorrectHtlcAmount
            }
            FailureReason::InvalidOnionPayload { .. } => FailureCode::InvalidOnionPayload,
        }
    }

    pub fn channel_update(&self) -> Option<&ChannelUpdate> {
        match self {
            FailureReason::TemporaryChannelFailure { update } => update.as_ref(),
            FailureReason::AmountBelowMinimum { update, .. }
            | FailureReason::FeeInsufficient { update, .. }
            | FailureReason::IncorrectCltvExpiry { update, .. }
            | FailureReason::ExpiryTooSoon { update }
            | FailureReason::ChannelDisabled { update, .. } => Some(update),
            _ => None,
        }
    }

    /// Serialize as `code u16 | context`. Channel updates are written with a
    /// u16 length prefix, matching how the codes carry them on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&u16::from(self.code()).to_be_bytes());
        match self {
            FailureReason::Code(_) => {}
            FailureReason::TemporaryChannelFailure { update } => match update {
                Some(update) => write_update(&mut out, update),
                None => out.extend_from_slice(&0u16.to_be_bytes()),
            },
            FailureReason::AmountBelowMinimum { htlc_msat, update }
            | FailureReason::FeeInsufficient { htlc_msat, update } => {
                out.extend_from_slice(&htlc_msat.to_be_bytes());
                write_update(&mut out, update);
            }
            FailureReason::IncorrectCltvExpiry {
                cltv_expiry,
                update,
            } => {
                out.extend_from_slice(&cltv_expiry.to_be_bytes());
                write_update(&mut out, update);
            }
            FailureReason::ExpiryTooSoon { update } => write_update(&mut out, update),
            FailureReason::ChannelDisabled { flags, update } => {
                out.extend_from_slice(&flags.to_be_bytes());
                write_update(&mut out, update);
            }
            FailureReason::FinalIncorrectCltvExpiry { cltv_expiry } => {
                out.extend_from_slice(&cltv_expiry.to_be_bytes());
            }
            FailureReason::FinalIncorrectHtlcAmount { htlc_msat } => {
                out.extend_from_slice(&htlc_msat.to_be_bytes());
            }
            FailureReason::InvalidOnionPayload { tlv_type, offset } => {
                super::tlv::write_bigsize(&mut out, *tlv_type);
                out.extend_from_slice(&offset.to_be_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);
        let raw_code = r.read_u16()?;
        let code =
            FailureCode::try_from(raw_code).map_err(|_| WireError::UnknownFailureCode(raw_code))?;
        let reason = match code {
            FailureCode::TemporaryChannelFailure => FailureReason::TemporaryChannelFailure {
                update: read_update_opt(&mut r)?,
            },
            FailureCode::AmountBelowMinimum => FailureReason::AmountBelowMinimum {
                htlc_msat: r.read_u64()?,
                update: read_update(&mut r)?,
            },
            FailureCode::FeeInsufficient => FailureReason::FeeInsufficient {
                htlc_msat: r.read_u64()?,
                update: read_update(&mut r)?,
            },
            FailureCode::IncorrectCltvExpiry => FailureReason::IncorrectCltvExpiry {
                cltv_expiry: r.read_u32()?,
                update: read_update(&mut r)?,
            },
            FailureCode::ExpiryTooSoon => FailureReason::ExpiryTooSoon {
                update: read_update(&mut r)?,
            },
            FailureCode::ChannelDisabled => FailureReason::ChannelDisabled {
                flags: r.read_u16()?,
                update: read_update(&mut r)?,
            },
            FailureCode::FinalIncorrectCltvExpiry => FailureReason::FinalIncorrectCltvExpiry {
                cltv_expiry: r.read_u32()?,
            },
            FailureCode::FinalIncorrectHtlcAmount => FailureReason::FinalIncorrectHtlcAmount {
                htlc_msat: r.read_u64()?,
            },
            FailureCode::InvalidOnionPayload => FailureReason::InvalidOnionPayload {
                tlv_type: super::tlv::read_bigsize(&mut r)?,
                offset: r.read_u16()?,
            },
            other => FailureReason::Code(other),
        };
        if !r.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(reason)
    }
}

fn write_update(w: &mut Vec<u8>, update: &ChannelUpdate) {
    let encoded = update.to_bytes();
    w.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
    w.extend_from_slice(&encoded);
}

fn read_update(r: &mut Reader) -> Result<ChannelUpdate, WireError> {
    let len = r.read_u16()? as usize;
    ChannelUpdate::from_bytes(r.take(len)?)
}

fn read_update_opt(r: &mut Reader) -> Result<Option<ChannelUpdate>, WireError> {
    let len = r.read_u16()? as usize;
    if len == 0 {
        return Ok(None);
    }
    Ok(Some(ChannelUpdate::from_bytes(r.take(len)?)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash256, ShortChannelId};
    use crate::wire::messages::SignatureBytes;

    fn test_update() -> ChannelUpdate {
        ChannelUpdate {
            signature: SignatureBytes([0x55; 64]),
            chain_hash: Hash256::default(),
            short_channel_id: ShortChannelId::new(100, 5, 2),
            timestamp: 1_700_000_000,
            message_flags: 1,
            channel_flags: 0,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 1_000,
            fee_base_msat: 1_000,
            fee_proportional_millionths: 100,
            htlc_maximum_msat: 100_000_000,
        }
    }

    #[test]
    fn test_failure_code_bits() {
        assert!(FailureCode::InvalidOnionVersion.is_bad_onion());
        assert!(FailureCode::InvalidOnionBlinding.is_bad_onion());
        assert!(FailureCode::InvalidOnionBlinding.is_perm());
        assert!(FailureCode::FeeInsufficient.is_update());
        assert!(!FailureCode::FeeInsufficient.is_perm());
        assert!(FailureCode::TemporaryNodeFailure.is_node());
        assert!(!FailureCode::TemporaryChannelFailure.is_node());
    }

    #[test]
    fn test_failure_reason_roundtrip() {
        let reasons = vec![
            FailureReason::Code(FailureCode::UnknownNextPeer),
            FailureReason::Code(FailureCode::MppTimeout),
            FailureReason::Code(FailureCode::InvalidOnionBlinding),
            FailureReason::TemporaryChannelFailure { update: None },
            FailureReason::TemporaryChannelFailure {
                update: Some(test_update()),
            },
            FailureReason::AmountBelowMinimum {
                htlc_msat: 100,
                update: test_update(),
            },
            FailureReason::FeeInsufficient {
                htlc_msat: 5_000,
                update: test_update(),
            },
            FailureReason::IncorrectCltvExpiry {
                cltv_expiry: 800_123,
                update: test_update(),
            },
            FailureReason::ExpiryTooSoon {
                update: test_update(),
            },
            FailureReason::ChannelDisabled {
                flags: 2,
                update: test_update(),
            },
            FailureReason::FinalIncorrectCltvExpiry {
                cltv_expiry: 800_200,
            },
            FailureReason::FinalIncorrectHtlcAmount { htlc_msat: 42 },
            FailureReason::InvalidOnionPayload {
                tlv_type: 10,
                offset: 12,
            },
        ];
        for reason in reasons {
            let encoded = reason.encode();
            let decoded = FailureReason::decode(&encoded).expect("decode");
            assert_eq!(reason, decoded);
        }
    }

    #[test]
    fn test_unknown_failure_code() {
        let bytes = 0x0042u16.to_be_bytes();
        assert_eq!(
            FailureReason::decode(&bytes),
            Err(WireError::UnknownFailureCode(0x42))
        );
    }
}
