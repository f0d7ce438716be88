//! Machine-readable peer errors.
//!
//! A peer `error` message may carry structured context in its extra data:
//! either a field-precise error (TLV type 1 naming the message and field that
//! caused the failure, optionally TLV type 3 suggesting an acceptable value)
//! or a coded error (TLV type 5: a `u16` code from a closed enum followed by
//! a length-prefixed nested TLV stream with per-code context). The two forms
//! are mutually exclusive; an error code precludes field-precise records.

use super::messages::ErrorMessage;
use super::tlv::{read_bigsize, write_bigsize, Reader, TlvStream};
use super::WireError;
use crate::types::ChannelId;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

/// TLV type for a message type, field number and erroneous value.
pub const TYPE_ERRONEOUS_FIELD: u64 = 1;

/// TLV type for a suggested value for the field that caused an error.
pub const TYPE_SUGGESTED_VALUE: u64 = 3;

/// TLV type for an error code that is not tied to a message/field pair.
pub const TYPE_ERROR_CODE: u64 = 5;

// Nested TLV types carried inside a coded error's context stream.
const TYPE_NESTED_COMMIT_HEIGHT: u64 = 1;
const TYPE_NESTED_COMMIT_SIG: u64 = 3;
const TYPE_NESTED_SIG_HASH: u64 = 5;
const TYPE_NESTED_COMMIT_TX: u64 = 7;
const TYPE_NESTED_HTLC_INDEX: u64 = 9;
const TYPE_NESTED_HTLC_SIG: u64 = 11;

/// Wire message types referenced by field-precise errors.
pub const MSG_OPEN_CHANNEL: u16 = 32;
pub const MSG_ACCEPT_CHANNEL: u16 = 33;

// ============================================================
// ErrorCode
// ============================================================

/// Validation error codes understood by both peers.
#[repr(u16)]
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    AsRefStr,
    TryFromPrimitive,
    IntoPrimitive,
)]
pub enum ErrorCode {
    /// The number of active pending channels exceeds their policy limit.
    MaxPendingChannels = 1,
    /// The peer is still busy syncing the latest state of the blockchain.
    SynchronizingChain = 3,
    /// The remote peer added more htlcs than the local commitment allows.
    MaxPendingHtlcsExceeded = 5,
    /// The remote peer exceeded the pending amount in flight limit.
    MaxPendingAmountExceeded = 7,
    InternalError = 9,
    RemoteError = 11,
    SyncError = 13,
    /// The channel was unable to be resumed; the remote party needs to force
    /// close the channel out on chain.
    RecoveryError = 15,
    InvalidUpdate = 17,
    InvalidRevocation = 19,
    InvalidCommitSig = 21,
    InvalidHtlcSig = 23,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let detail = match self {
            ErrorCode::MaxPendingChannels => "number of pending channels exceed maximum",
            ErrorCode::SynchronizingChain => "synchronizing blockchain",
            ErrorCode::MaxPendingHtlcsExceeded => "commitment exceeds max htlcs",
            ErrorCode::MaxPendingAmountExceeded => "commitment exceeds max in flight value",
            ErrorCode::InternalError => "internal error",
            ErrorCode::RemoteError => "remote error",
            ErrorCode::SyncError => "sync error",
            ErrorCode::RecoveryError => "unable to resume channel, recovery required",
            ErrorCode::InvalidUpdate => "invalid update",
            ErrorCode::InvalidRevocation => "invalid revocation",
            ErrorCode::InvalidCommitSig => "invalid commit sig",
            ErrorCode::InvalidHtlcSig => "invalid htlc sig",
        };
        write!(f, "Error code: {}: {}", u16::from(*self), detail)
    }
}

// ============================================================
// Coded errors
// ============================================================

/// Context records nested under a coded error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorContext {
    InvalidCommitSig {
        commit_height: u64,
        commit_sig: Vec<u8>,
        sig_hash: Vec<u8>,
        commit_tx: Vec<u8>,
    },
    InvalidHtlcSig {
        commit_height: u64,
        htlc_index: u64,
        htlc_sig: Vec<u8>,
        sig_hash: Vec<u8>,
        commit_tx: Vec<u8>,
    },
}

impl ErrorContext {
    fn to_stream(&self) -> TlvStream {
        let mut stream = TlvStream::new();
        match self {
            ErrorContext::InvalidCommitSig {
                commit_height,
                commit_sig,
                sig_hash,
                commit_tx,
            } => {
                stream
                    .insert(TYPE_NESTED_COMMIT_HEIGHT, commit_height.to_be_bytes().to_vec())
                    .expect("fresh stream");
                stream
                    .insert(TYPE_NESTED_COMMIT_SIG, commit_sig.clone())
                    .expect("fresh stream");
                stream
                    .insert(TYPE_NESTED_SIG_HASH, sig_hash.clone())
                    .expect("fresh stream");
                stream
                    .insert(TYPE_NESTED_COMMIT_TX, commit_tx.clone())
                    .expect("fresh stream");
            }
            ErrorContext::InvalidHtlcSig {
                commit_height,
                htlc_index,
                htlc_sig,
                sig_hash,
                commit_tx,
            } => {
                stream
                    .insert(TYPE_NESTED_COMMIT_HEIGHT, commit_height.to_be_bytes().to_vec())
                    .expect("fresh stream");
                stream
                    .insert(TYPE_NESTED_SIG_HASH, sig_hash.clone())
                    .expect("fresh stream");
                stream
                    .insert(TYPE_NESTED_COMMIT_TX, commit_tx.clone())
                    .expect("fresh stream");
                stream
                    .insert(TYPE_NESTED_HTLC_INDEX, htlc_index.to_be_bytes().to_vec())
                    .expect("fresh stream");
                stream
                    .insert(TYPE_NESTED_HTLC_SIG, htlc_sig.clone())
                    .expect("fresh stream");
            }
        }
        stream
    }

    fn from_stream(code: ErrorCode, stream: &TlvStream) -> Result<Option<Self>, WireError> {
        let read_u64_record = |tlv_type: u64| -> Result<u64, WireError> {
            let raw = stream.get(tlv_type).ok_or(WireError::UnexpectedEof)?;
            let bytes: [u8; 8] = raw.try_into().map_err(|_| WireError::InvalidLength)?;
            Ok(u64::from_be_bytes(bytes))
        };
        let read_bytes_record = |tlv_type: u64| -> Result<Vec<u8>, WireError> {
            Ok(stream
                .get(tlv_type)
                .ok_or(WireError::UnexpectedEof)?
                .to_vec())
        };
        match code {
            ErrorCode::InvalidCommitSig => Ok(Some(ErrorContext::InvalidCommitSig {
                commit_height: read_u64_record(TYPE_NESTED_COMMIT_HEIGHT)?,
                commit_sig: read_bytes_record(TYPE_NESTED_COMMIT_SIG)?,
                sig_hash: read_bytes_record(TYPE_NESTED_SIG_HASH)?,
                commit_tx: read_bytes_record(TYPE_NESTED_COMMIT_TX)?,
            })),
            ErrorCode::InvalidHtlcSig => Ok(Some(ErrorContext::InvalidHtlcSig {
                commit_height: read_u64_record(TYPE_NESTED_COMMIT_HEIGHT)?,
                htlc_index: read_u64_record(TYPE_NESTED_HTLC_INDEX)?,
                htlc_sig: read_bytes_record(TYPE_NESTED_HTLC_SIG)?,
                sig_hash: read_bytes_record(TYPE_NESTED_SIG_HASH)?,
                commit_tx: read_bytes_record(TYPE_NESTED_COMMIT_TX)?,
            })),
            // Codes without known nested context: extra records are allowed
            // for forwards compatibility, we just do not read them.
            _ => Ok(None),
        }
    }
}

/// An error enriched with a code and optional code-specific context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedError {
    pub code: ErrorCode,
    pub context: Option<ErrorContext>,
}

impl CodedError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            context: None,
        }
    }

    pub fn new_invalid_commit_sig(
        commit_height: u64,
        commit_sig: Vec<u8>,
        sig_hash: Vec<u8>,
        commit_tx: Vec<u8>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidCommitSig,
            context: Some(ErrorContext::InvalidCommitSig {
                commit_height,
                commit_sig,
                sig_hash,
                commit_tx,
            }),
        }
    }

    pub fn new_invalid_htlc_sig(
        commit_height: u64,
        htlc_index: u64,
        htlc_sig: Vec<u8>,
        sig_hash: Vec<u8>,
        commit_tx: Vec<u8>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidHtlcSig,
            context: Some(ErrorContext::InvalidHtlcSig {
                commit_height,
                htlc_index,
                htlc_sig,
                sig_hash,
                commit_tx,
            }),
        }
    }

    /// Value bytes of the TLV type 5 record: `code u16 | BigSize nested_len |
    /// nested TLV stream`.
    fn record_value(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&u16::from(self.code).to_be_bytes());
        let nested = match &self.context {
            Some(context) => context.to_stream().to_bytes(),
            None => Vec::new(),
        };
        write_bigsize(&mut out, nested.len() as u64);
        out.extend_from_slice(&nested);
        out
    }

    fn from_record_value(value: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(value);
        let raw_code = r.read_u16()?;
        let code =
            ErrorCode::try_from(raw_code).map_err(|_| WireError::UnknownErrorCode(raw_code))?;
        let nested_len = read_bigsize(&mut r)? as usize;
        let nested = r.take(nested_len)?;
        let context = if nested.is_empty() {
            None
        } else {
            let stream = TlvStream::from_bytes(nested)?;
            ErrorContext::from_stream(code, &stream)?
        };
        Ok(Self { code, context })
    }

    pub fn to_wire_error(&self, channel_id: ChannelId) -> Result<ErrorMessage, WireError> {
        let mut extra_data = TlvStream::new();
        extra_data.insert(TYPE_ERROR_CODE, self.record_value())?;
        Ok(ErrorMessage {
            channel_id,
            data: self.code.to_string().into_bytes(),
            extra_data,
        })
    }
}

// ============================================================
// Field-precise errors
// ============================================================

/// Field numbering: for fixed fields the 0-based index of the field in the
/// message; for TLV fields the number of fixed fields plus the TLV type.
fn field_name(message_type: u16, field_number: u16) -> Option<&'static str> {
    match (message_type, field_number) {
        (MSG_OPEN_CHANNEL, 0) => Some("chain hash"),
        (MSG_OPEN_CHANNEL, 1) => Some("channel id"),
        (MSG_OPEN_CHANNEL, 2) => Some("funding sats"),
        (MSG_OPEN_CHANNEL, 3) => Some("push amount"),
        (MSG_OPEN_CHANNEL, 4) => Some("dust limit"),
        (MSG_OPEN_CHANNEL, 5) => Some("max htlc value in flight msat"),
        (MSG_OPEN_CHANNEL, 6) => Some("channel reserve"),
        (MSG_OPEN_CHANNEL, 7) => Some("htlc minimum msat"),
        (MSG_OPEN_CHANNEL, 8) => Some("feerate per kw"),
        (MSG_OPEN_CHANNEL, 9) => Some("to self delay"),
        (MSG_OPEN_CHANNEL, 10) => Some("max accepted htlcs"),
        (MSG_ACCEPT_CHANNEL, 5) => Some("min depth"),
        _ => None,
    }
}

/// An error naming the exact message field a peer objects to, with the
/// offending value and optionally a value the peer would accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    pub message_type: u16,
    pub field_number: u16,
    pub value: Vec<u8>,
    pub suggested_value: Option<Vec<u8>>,
}

impl StructuredError {
    pub fn new(message_type: u16, field_number: u16, value: Vec<u8>) -> Self {
        Self {
            message_type,
            field_number,
            value,
            suggested_value: None,
        }
    }

    pub fn with_suggested_value(mut self, suggested_value: Vec<u8>) -> Self {
        self.suggested_value = Some(suggested_value);
        self
    }

    pub fn field_name(&self) -> Option<&'static str> {
        field_name(self.message_type, self.field_number)
    }

    fn description(&self) -> String {
        let mut out = format!("Message: {} failed", self.message_type);
        match self.field_name() {
            Some(name) => out.push_str(&format!(", field: {} ({})", name, self.field_number)),
            None => out.push_str(&format!(", field: {}", self.field_number)),
        }
        if !self.value.is_empty() {
            out.push_str(&format!(", erroneous value: {}", hex::encode(&self.value)));
        }
        if let Some(suggested) = &self.suggested_value {
            out.push_str(&format!(", suggested value: {}", hex::encode(suggested)));
        }
        out
    }

    pub fn to_wire_error(&self, channel_id: ChannelId) -> Result<ErrorMessage, WireError> {
        let mut record = Vec::new();
        record.extend_from_slice(&self.message_type.to_be_bytes());
        record.extend_from_slice(&self.field_number.to_be_bytes());
        record.extend_from_slice(&self.value);

        let mut extra_data = TlvStream::new();
        extra_data.insert(TYPE_ERRONEOUS_FIELD, record)?;
        if let Some(suggested) = &self.suggested_value {
            extra_data.insert(TYPE_SUGGESTED_VALUE, suggested.clone())?;
        }
        Ok(ErrorMessage {
            channel_id,
            data: self.description().into_bytes(),
            extra_data,
        })
    }

    fn from_records(
        erroneous: &[u8],
        suggested_value: Option<Vec<u8>>,
    ) -> Result<Self, WireError> {
        if erroneous.len() < 4 {
            return Err(WireError::InvalidLength);
        }
        let mut r = Reader::new(erroneous);
        let message_type = r.read_u16()?;
        let field_number = r.read_u16()?;
        let value = r.read_rest().to_vec();
        Ok(Self {
            message_type,
            field_number,
            value,
            suggested_value,
        })
    }
}

// ============================================================
// Extraction
// ============================================================

/// A machine-readable error extracted from a peer `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtendedError {
    Coded(CodedError),
    Structured(StructuredError),
}

/// Extract a structured error from an error's extra data, if present.
/// Returns `None` when the message carries no machine-readable records.
pub fn structured_error_from_wire(
    err: &ErrorMessage,
) -> Result<Option<ExtendedError>, WireError> {
    if err.extra_data.is_empty() {
        return Ok(None);
    }

    // An error code precludes field-precise records.
    if let Some(value) = err.extra_data.get(TYPE_ERROR_CODE) {
        return Ok(Some(ExtendedError::Coded(CodedError::from_record_value(
            value,
        )?)));
    }

    let Some(erroneous) = err.extra_data.get(TYPE_ERRONEOUS_FIELD) else {
        return Ok(None);
    };
    let suggested = err
        .extra_data
        .get(TYPE_SUGGESTED_VALUE)
        .map(|v| v.to_vec());
    Ok(Some(ExtendedError::Structured(
        StructuredError::from_records(erroneous, suggested)?,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_error_roundtrip() {
        // open_channel, max accepted htlcs, value 5 suggested 10.
        let err = StructuredError::new(MSG_OPEN_CHANNEL, 10, 5u16.to_be_bytes().to_vec())
            .with_suggested_value(10u16.to_be_bytes().to_vec());
        let wire = err.to_wire_error(ChannelId([1u8; 32])).expect("to wire");

        let extracted = structured_error_from_wire(&wire)
            .expect("extract")
            .expect("present");
        assert_eq!(extracted, ExtendedError::Structured(err));
    }

    #[test]
    fn test_coded_error_roundtrip_without_context() {
        let err = CodedError::new(ErrorCode::SynchronizingChain);
        let wire = err.to_wire_error(ChannelId([2u8; 32])).expect("to wire");

        let extracted = structured_error_from_wire(&wire)
            .expect("extract")
            .expect("present");
        match extracted {
            ExtendedError::Coded(coded) => {
                assert_eq!(coded.code, ErrorCode::SynchronizingChain);
                assert_eq!(coded.context, None);
            }
            other => panic!("expected coded error, got {:?}", other),
        }
    }

    #[test]
    fn test_coded_error_roundtrip_with_nested_context() {
        let err = CodedError::new_invalid_commit_sig(
            1_000,
            vec![1; 64],
            vec![2; 32],
            vec![3; 100],
        );
        let wire = err.to_wire_error(ChannelId([3u8; 32])).expect("to wire");

        let extracted = structured_error_from_wire(&wire)
            .expect("extract")
            .expect("present");
        assert_eq!(extracted, ExtendedError::Coded(err));
    }

    #[test]
    fn test_htlc_sig_error_roundtrip() {
        let err = CodedError::new_invalid_htlc_sig(7, 3, vec![4; 64], vec![5; 32], vec![6; 80]);
        let wire = err.to_wire_error(ChannelId([4u8; 32])).expect("to wire");

        let extracted = structured_error_from_wire(&wire)
            .expect("extract")
            .expect("present");
        assert_eq!(extracted, ExtendedError::Coded(err));
    }

    #[test]
    fn test_error_without_records() {
        let wire = ErrorMessage {
            channel_id: ChannelId([5u8; 32]),
            data: b"free form".to_vec(),
            extra_data: TlvStream::new(),
        };
        assert_eq!(structured_error_from_wire(&wire).expect("extract"), None);
    }

    #[test]
    fn test_error_code_precludes_field_records() {
        // Both records present: the code wins.
        let structured = StructuredError::new(MSG_OPEN_CHANNEL, 2, vec![0, 1]);
        let mut wire = structured
            .to_wire_error(ChannelId([6u8; 32]))
            .expect("to wire");
        wire.extra_data
            .insert(
                TYPE_ERROR_CODE,
                CodedError::new(ErrorCode::MaxPendingChannels).record_value(),
            )
            .expect("insert");

        let extracted = structured_error_from_wire(&wire)
            .expect("extract")
            .expect("present");
        assert!(matches!(extracted, ExtendedError::Coded(_)));
    }

    #[test]
    fn test_unknown_error_code_rejected() {
        let mut extra_data = TlvStream::new();
        let mut value = 999u16.to_be_bytes().to_vec();
        value.push(0);
        extra_data.insert(TYPE_ERROR_CODE, value).expect("insert");
        let wire = ErrorMessage {
            channel_id: ChannelId([7u8; 32]),
            data: Vec::new(),
            extra_data,
        };
        assert_eq!(
            structured_error_from_wire(&wire),
            Err(WireError::UnknownErrorCode(999))
        );
    }
}
