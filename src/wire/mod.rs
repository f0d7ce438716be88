//! Peer wire codec: message framing, TLV streams, failure codes and
//! structured peer errors.

pub mod coded_error;
pub mod failure;
pub mod messages;
pub mod tlv;

pub use coded_error::{
    structured_error_from_wire, CodedError, ErrorCode, ExtendedError, StructuredError,
};
pub use failure::{FailureCode, FailureReason};
pub use messages::{
    ChannelReady, ChannelReestablish, ChannelUpdate, CommitSig, ErrorMessage, Message, MessageType,
    RevokeAndAck, Stfu, UpdateAddHtlc, UpdateAddHtlcBuilder, UpdateFailHtlc,
    UpdateFailMalformedHtlc, UpdateFee, UpdateFulfillHtlc, ONION_PACKET_SIZE,
};
pub use tlv::{CustomRecords, Reader, TlvStream, MIN_CUSTOM_RECORDS_TLV_TYPE};

use thiserror::Error;

/// Errors surfaced by the wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid version: {0}")]
    InvalidVersion(u8),
    #[error("invalid length")]
    InvalidLength,
    #[error("duplicate TLV type: {0}")]
    DuplicateType(u64),
    #[error("TLV type out of range: {0}")]
    TypeOutOfRange(u64),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("non-canonical BigSize encoding")]
    NonCanonicalBigSize,
    #[error("unknown required TLV type: {0}")]
    UnknownRequiredType(u64),
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),
    #[error("custom record collides with message record: {0}")]
    CustomRecordCollision(u64),
    #[error("custom record type below minimum: {0}")]
    CustomRecordOutOfRange(u64),
    #[error("unknown failure code: {0}")]
    UnknownFailureCode(u16),
    #[error("unknown error code: {0}")]
    UnknownErrorCode(u16),
    #[error("trailing bytes after message body")]
    TrailingBytes,
}
