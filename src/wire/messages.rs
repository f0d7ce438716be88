//! Peer messages and their bit-exact codecs.
//!
//! Every message is framed as a two-byte big-endian message type followed by
//! the message body. Trailing bytes after the fixed fields form the extra
//! data of the message and must parse as a TLV stream when present.

use super::tlv::{Reader, TlvStream};
use super::{CustomRecords, WireError};
use crate::serde_utils::SliceHex;
use crate::types::{ChannelId, Hash256, Pubkey, ShortChannelId};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::HashSet;

/// The size of the serialized onion packet carried in each `update_add_htlc`:
/// 1-byte version, 33-byte ephemeral public key, 1300 bytes of per-hop
/// routing info and a 32-byte HMAC over the routing info.
pub const ONION_PACKET_SIZE: usize = 1366;

/// TLV type of the optional ephemeral blinding point on `update_add_htlc`.
pub const BLINDING_POINT_TLV_TYPE: u64 = 0;

/// TLV type of the optional SCID alias on `channel_ready`.
pub const CHANNEL_READY_ALIAS_TLV_TYPE: u64 = 1;

// ============================================================
// MessageType
// ============================================================

#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Stfu = 2,
    Error = 17,
    ChannelReady = 36,
    UpdateAddHtlc = 128,
    UpdateFulfillHtlc = 130,
    UpdateFailHtlc = 131,
    CommitSig = 132,
    RevokeAndAck = 133,
    UpdateFee = 134,
    UpdateFailMalformedHtlc = 135,
    ChannelReestablish = 136,
    ChannelUpdate = 258,
}

impl TryFrom<u16> for MessageType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        Ok(match value {
            2 => MessageType::Stfu,
            17 => MessageType::Error,
            36 => MessageType::ChannelReady,
            128 => MessageType::UpdateAddHtlc,
            130 => MessageType::UpdateFulfillHtlc,
            131 => MessageType::UpdateFailHtlc,
            132 => MessageType::CommitSig,
            133 => MessageType::RevokeAndAck,
            134 => MessageType::UpdateFee,
            135 => MessageType::UpdateFailMalformedHtlc,
            136 => MessageType::ChannelReestablish,
            258 => MessageType::ChannelUpdate,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

// ============================================================
// Opaque signature bytes
// ============================================================

/// A 64-byte compact signature carried opaquely; validation happens behind
/// the commitment verifier, not in the codec.
#[serde_as]
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde_as(as = "SliceHex")] pub [u8; 64]);

impl Default for SignatureBytes {
    fn default() -> Self {
        Self([0u8; 64])
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureBytes({})", hex::encode(self.0))
    }
}

impl TryFrom<Vec<u8>> for SignatureBytes {
    type Error = anyhow::Error;

    fn try_from(value: Vec<u8>) -> Result<Self, anyhow::Error> {
        let bytes: [u8; 64] = value
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid signature length"))?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for SignatureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================
// update_add_htlc
// ============================================================

/// The message offering an HTLC on a channel. The optional blinding point and
/// the custom records travel in the message's TLV extra data.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAddHtlc {
    pub channel_id: ChannelId,
    /// Monotonically increasing per offering side, starting at zero.
    pub id: u64,
    pub amount_msat: u64,
    pub payment_hash: Hash256,
    pub expiry: u32,
    #[serde_as(as = "SliceHex")]
    pub onion_blob: Vec<u8>,
    pub blinding_point: Option<Pubkey>,
    pub custom_records: CustomRecords,
    /// TLV records we do not interpret, preserved across encode/decode.
    pub extra_data: TlvStream,
}

impl UpdateAddHtlc {
    pub fn builder() -> UpdateAddHtlcBuilder {
        UpdateAddHtlcBuilder::default()
    }

    pub fn write(&self, w: &mut Vec<u8>) -> Result<(), WireError> {
        if self.onion_blob.len() != ONION_PACKET_SIZE {
            return Err(WireError::InvalidLength);
        }
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(&self.id.to_be_bytes());
        w.extend_from_slice(&self.amount_msat.to_be_bytes());
        w.extend_from_slice(self.payment_hash.as_ref());
        w.extend_from_slice(&self.expiry.to_be_bytes());
        w.extend_from_slice(&self.onion_blob);

        let mut stream = self.extra_data.clone();
        if let Some(point) = &self.blinding_point {
            stream.insert(BLINDING_POINT_TLV_TYPE, point.serialize().to_vec())?;
        }
        self.custom_records.merge_into(&mut stream)?;
        stream.encode(w);
        Ok(())
    }

    pub fn read(r: &mut Reader, overrides: &HashSet<u64>) -> Result<Self, WireError> {
        let channel_id = ChannelId(r.read_bytes32()?);
        let id = r.read_u64()?;
        let amount_msat = r.read_u64()?;
        let payment_hash: Hash256 = r.read_bytes32()?.into();
        let expiry = r.read_u32()?;
        let onion_blob = r.take(ONION_PACKET_SIZE)?.to_vec();

        let mut stream = TlvStream::decode(r)?;
        let blinding_point = match stream.remove(BLINDING_POINT_TLV_TYPE) {
            Some(raw) => {
                Some(Pubkey::from_slice(&raw).map_err(|_| WireError::InvalidLength)?)
            }
            None => None,
        };
        let custom_records = stream.split_custom_records(overrides);

        Ok(UpdateAddHtlc {
            channel_id,
            id,
            amount_msat,
            payment_hash,
            expiry,
            onion_blob,
            blinding_point,
            custom_records,
            extra_data: stream,
        })
    }
}

/// Builder for `update_add_htlc`, validating the optional TLVs before
/// serialization.
#[derive(Default)]
pub struct UpdateAddHtlcBuilder {
    channel_id: ChannelId,
    id: u64,
    amount_msat: u64,
    payment_hash: Hash256,
    expiry: u32,
    onion_blob: Vec<u8>,
    blinding_point: Option<Pubkey>,
    custom_records: CustomRecords,
    overrides: HashSet<u64>,
}

impl UpdateAddHtlcBuilder {
    pub fn channel_id(mut self, channel_id: ChannelId) -> Self {
        self.channel_id = channel_id;
        self
    }

    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn amount_msat(mut self, amount_msat: u64) -> Self {
        self.amount_msat = amount_msat;
        self
    }

    pub fn payment_hash(mut self, payment_hash: Hash256) -> Self {
        self.payment_hash = payment_hash;
        self
    }

    pub fn expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn onion_blob(mut self, onion_blob: Vec<u8>) -> Self {
        self.onion_blob = onion_blob;
        self
    }

    pub fn blinding_point(mut self, blinding_point: Option<Pubkey>) -> Self {
        self.blinding_point = blinding_point;
        self
    }

    pub fn custom_records(mut self, custom_records: CustomRecords) -> Self {
        self.custom_records = custom_records;
        self
    }

    /// Admit the configured message-type overrides below the custom range.
    pub fn custom_type_overrides(mut self, overrides: HashSet<u64>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build(self) -> Result<UpdateAddHtlc, WireError> {
        if self.onion_blob.len() != ONION_PACKET_SIZE {
            return Err(WireError::InvalidLength);
        }
        self.custom_records.validate(&self.overrides)?;
        Ok(UpdateAddHtlc {
            channel_id: self.channel_id,
            id: self.id,
            amount_msat: self.amount_msat,
            payment_hash: self.payment_hash,
            expiry: self.expiry,
            onion_blob: self.onion_blob,
            blinding_point: self.blinding_point,
            custom_records: self.custom_records,
            extra_data: TlvStream::new(),
        })
    }
}

// ============================================================
// update_fulfill_htlc / update_fail_htlc / update_fail_malformed_htlc
// ============================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFulfillHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub payment_preimage: Hash256,
}

impl UpdateFulfillHtlc {
    pub fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(&self.id.to_be_bytes());
        w.extend_from_slice(self.payment_preimage.as_ref());
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId(r.read_bytes32()?),
            id: r.read_u64()?,
            payment_preimage: r.read_bytes32()?.into(),
        })
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFailHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    /// The failure reason, onion-encrypted toward the payment source.
    #[serde_as(as = "SliceHex")]
    pub reason: Vec<u8>,
}

impl UpdateFailHtlc {
    pub fn write(&self, w: &mut Vec<u8>) -> Result<(), WireError> {
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(&self.id.to_be_bytes());
        let len = u16::try_from(self.reason.len()).map_err(|_| WireError::InvalidLength)?;
        w.extend_from_slice(&len.to_be_bytes());
        w.extend_from_slice(&self.reason);
        Ok(())
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        let channel_id = ChannelId(r.read_bytes32()?);
        let id = r.read_u64()?;
        let len = r.read_u16()? as usize;
        let reason = r.take(len)?.to_vec();
        Ok(Self {
            channel_id,
            id,
            reason,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFailMalformedHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub sha256_of_onion: Hash256,
    /// Must have the badonion bit set.
    pub failure_code: u16,
}

impl UpdateFailMalformedHtlc {
    pub fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(&self.id.to_be_bytes());
        w.extend_from_slice(self.sha256_of_onion.as_ref());
        w.extend_from_slice(&self.failure_code.to_be_bytes());
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId(r.read_bytes32()?),
            id: r.read_u64()?,
            sha256_of_onion: r.read_bytes32()?.into(),
            failure_code: r.read_u16()?,
        })
    }
}

// ============================================================
// commit_sig / revoke_and_ack
// ============================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    pub channel_id: ChannelId,
    pub signature: SignatureBytes,
    pub htlc_signatures: Vec<SignatureBytes>,
}

impl CommitSig {
    pub fn write(&self, w: &mut Vec<u8>) -> Result<(), WireError> {
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(&self.signature.0);
        let num =
            u16::try_from(self.htlc_signatures.len()).map_err(|_| WireError::InvalidLength)?;
        w.extend_from_slice(&num.to_be_bytes());
        for sig in &self.htlc_signatures {
            w.extend_from_slice(&sig.0);
        }
        Ok(())
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        let channel_id = ChannelId(r.read_bytes32()?);
        let signature = SignatureBytes(r.take(64)?.try_into().unwrap());
        let num = r.read_u16()? as usize;
        let mut htlc_signatures = Vec::with_capacity(num);
        for _ in 0..num {
            htlc_signatures.push(SignatureBytes(r.take(64)?.try_into().unwrap()));
        }
        Ok(Self {
            channel_id,
            signature,
            htlc_signatures,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeAndAck {
    pub channel_id: ChannelId,
    pub per_commitment_secret: Hash256,
    pub next_per_commitment_point: Pubkey,
}

impl RevokeAndAck {
    pub fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(self.per_commitment_secret.as_ref());
        w.extend_from_slice(&self.next_per_commitment_point.serialize());
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId(r.read_bytes32()?),
            per_commitment_secret: r.read_bytes32()?.into(),
            next_per_commitment_point: Pubkey::from_slice(r.take(33)?)
                .map_err(|_| WireError::InvalidLength)?,
        })
    }
}

// ============================================================
// channel_ready / channel_reestablish / update_fee
// ============================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReady {
    pub channel_id: ChannelId,
    pub next_per_commitment_point: Pubkey,
    /// An alias the peer may use to reference the channel before (or instead
    /// of) the confirmed SCID.
    pub alias: Option<ShortChannelId>,
}

impl ChannelReady {
    pub fn write(&self, w: &mut Vec<u8>) -> Result<(), WireError> {
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(&self.next_per_commitment_point.serialize());
        let mut stream = TlvStream::new();
        if let Some(alias) = &self.alias {
            stream.insert(
                CHANNEL_READY_ALIAS_TLV_TYPE,
                alias.to_u64().to_be_bytes().to_vec(),
            )?;
        }
        stream.encode(w);
        Ok(())
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        let channel_id = ChannelId(r.read_bytes32()?);
        let next_per_commitment_point =
            Pubkey::from_slice(r.take(33)?).map_err(|_| WireError::InvalidLength)?;
        let mut stream = TlvStream::decode(r)?;
        let alias = match stream.remove(CHANNEL_READY_ALIAS_TLV_TYPE) {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| WireError::InvalidLength)?;
                Some(ShortChannelId::from_u64(u64::from_be_bytes(bytes)))
            }
            None => None,
        };
        stream.ensure_understood(|_| false)?;
        Ok(Self {
            channel_id,
            next_per_commitment_point,
            alias,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReestablish {
    pub channel_id: ChannelId,
    pub next_commitment_number: u64,
    pub next_revocation_number: u64,
    pub your_last_per_commitment_secret: Hash256,
    pub my_current_per_commitment_point: Pubkey,
}

impl ChannelReestablish {
    pub fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(&self.next_commitment_number.to_be_bytes());
        w.extend_from_slice(&self.next_revocation_number.to_be_bytes());
        w.extend_from_slice(self.your_last_per_commitment_secret.as_ref());
        w.extend_from_slice(&self.my_current_per_commitment_point.serialize());
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId(r.read_bytes32()?),
            next_commitment_number: r.read_u64()?,
            next_revocation_number: r.read_u64()?,
            your_last_per_commitment_secret: r.read_bytes32()?.into(),
            my_current_per_commitment_point: Pubkey::from_slice(r.take(33)?)
                .map_err(|_| WireError::InvalidLength)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFee {
    pub channel_id: ChannelId,
    pub feerate_per_kw: u32,
}

impl UpdateFee {
    pub fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.channel_id.as_ref());
        w.extend_from_slice(&self.feerate_per_kw.to_be_bytes());
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId(r.read_bytes32()?),
            feerate_per_kw: r.read_u32()?,
        })
    }
}

// ============================================================
// stfu
// ============================================================

/// The quiescence negotiation message: "stop the flow, updates".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stfu {
    pub channel_id: ChannelId,
    /// Whether the sender believes it initiated quiescence.
    pub initiator: bool,
}

impl Stfu {
    pub fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.channel_id.as_ref());
        w.push(self.initiator as u8);
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId(r.read_bytes32()?),
            initiator: r.read_u8()? != 0,
        })
    }
}

// ============================================================
// error
// ============================================================

/// A peer error. The freeform data is human-readable; machine-readable
/// context travels as structured records in the extra data.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub channel_id: ChannelId,
    #[serde_as(as = "SliceHex")]
    pub data: Vec<u8>,
    pub extra_data: TlvStream,
}

impl ErrorMessage {
    pub fn write(&self, w: &mut Vec<u8>) -> Result<(), WireError> {
        w.extend_from_slice(self.channel_id.as_ref());
        let len = u16::try_from(self.data.len()).map_err(|_| WireError::InvalidLength)?;
        w.extend_from_slice(&len.to_be_bytes());
        w.extend_from_slice(&self.data);
        self.extra_data.encode(w);
        Ok(())
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        let channel_id = ChannelId(r.read_bytes32()?);
        let len = r.read_u16()? as usize;
        let data = r.take(len)?.to_vec();
        let extra_data = TlvStream::decode(r)?;
        Ok(Self {
            channel_id,
            data,
            extra_data,
        })
    }
}

// ============================================================
// channel_update
// ============================================================

/// The policy descriptor attached to UPDATE-class failures so the sender can
/// re-route with the reporting channel's current parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub signature: SignatureBytes,
    pub chain_hash: Hash256,
    pub short_channel_id: ShortChannelId,
    pub timestamp: u32,
    pub message_flags: u8,
    pub channel_flags: u8,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_maximum_msat: u64,
}

impl ChannelUpdate {
    pub fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.signature.0);
        w.extend_from_slice(self.chain_hash.as_ref());
        w.extend_from_slice(&self.short_channel_id.to_u64().to_be_bytes());
        w.extend_from_slice(&self.timestamp.to_be_bytes());
        w.push(self.message_flags);
        w.push(self.channel_flags);
        w.extend_from_slice(&self.cltv_expiry_delta.to_be_bytes());
        w.extend_from_slice(&self.htlc_minimum_msat.to_be_bytes());
        w.extend_from_slice(&self.fee_base_msat.to_be_bytes());
        w.extend_from_slice(&self.fee_proportional_millionths.to_be_bytes());
        w.extend_from_slice(&self.htlc_maximum_msat.to_be_bytes());
    }

    pub fn read(r: &mut Reader) -> Result<Self, WireError> {
        Ok(Self {
            signature: SignatureBytes(r.take(64)?.try_into().unwrap()),
            chain_hash: r.read_bytes32()?.into(),
            short_channel_id: ShortChannelId::from_u64(r.read_u64()?),
            timestamp: r.read_u32()?,
            message_flags: r.read_u8()?,
            channel_flags: r.read_u8()?,
            cltv_expiry_delta: r.read_u16()?,
            htlc_minimum_msat: r.read_u64()?,
            fee_base_msat: r.read_u32()?,
            fee_proportional_millionths: r.read_u32()?,
            htlc_maximum_msat: r.read_u64()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let update = Self::read(&mut reader)?;
        if !reader.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(update)
    }
}

// ============================================================
// Message
// ============================================================

/// A decoded peer message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    UpdateFailMalformedHtlc(UpdateFailMalformedHtlc),
    CommitSig(CommitSig),
    RevokeAndAck(RevokeAndAck),
    ChannelReady(ChannelReady),
    ChannelReestablish(ChannelReestablish),
    UpdateFee(UpdateFee),
    Stfu(Stfu),
    Error(ErrorMessage),
    ChannelUpdate(ChannelUpdate),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::UpdateAddHtlc(_) => MessageType::UpdateAddHtlc,
            Message::UpdateFulfillHtlc(_) => MessageType::UpdateFulfillHtlc,
            Message::UpdateFailHtlc(_) => MessageType::UpdateFailHtlc,
            Message::UpdateFailMalformedHtlc(_) => MessageType::UpdateFailMalformedHtlc,
            Message::CommitSig(_) => MessageType::CommitSig,
            Message::RevokeAndAck(_) => MessageType::RevokeAndAck,
            Message::ChannelReady(_) => MessageType::ChannelReady,
            Message::ChannelReestablish(_) => MessageType::ChannelReestablish,
            Message::UpdateFee(_) => MessageType::UpdateFee,
            Message::Stfu(_) => MessageType::Stfu,
            Message::Error(_) => MessageType::Error,
            Message::ChannelUpdate(_) => MessageType::ChannelUpdate,
        }
    }

    /// The channel this message is bound to. Gossip-style messages return
    /// `None`.
    pub fn target_chan_id(&self) -> Option<ChannelId> {
        match self {
            Message::UpdateAddHtlc(m) => Some(m.channel_id),
            Message::UpdateFulfillHtlc(m) => Some(m.channel_id),
            Message::UpdateFailHtlc(m) => Some(m.channel_id),
            Message::UpdateFailMalformedHtlc(m) => Some(m.channel_id),
            Message::CommitSig(m) => Some(m.channel_id),
            Message::RevokeAndAck(m) => Some(m.channel_id),
            Message::ChannelReady(m) => Some(m.channel_id),
            Message::ChannelReestablish(m) => Some(m.channel_id),
            Message::UpdateFee(m) => Some(m.channel_id),
            Message::Stfu(m) => Some(m.channel_id),
            Message::Error(m) => Some(m.channel_id),
            Message::ChannelUpdate(_) => None,
        }
    }

    /// Encode as message type prefix plus body.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.msg_type() as u16).to_be_bytes());
        match self {
            Message::UpdateAddHtlc(m) => m.write(&mut out)?,
            Message::UpdateFulfillHtlc(m) => m.write(&mut out),
            Message::UpdateFailHtlc(m) => m.write(&mut out)?,
            Message::UpdateFailMalformedHtlc(m) => m.write(&mut out),
            Message::CommitSig(m) => m.write(&mut out)?,
            Message::RevokeAndAck(m) => m.write(&mut out),
            Message::ChannelReady(m) => m.write(&mut out)?,
            Message::ChannelReestablish(m) => m.write(&mut out),
            Message::UpdateFee(m) => m.write(&mut out),
            Message::Stfu(m) => m.write(&mut out),
            Message::Error(m) => m.write(&mut out)?,
            Message::ChannelUpdate(m) => m.write(&mut out),
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Self::decode_with_overrides(bytes, &HashSet::new())
    }

    /// Decode, treating the listed message-scoped TLV types as custom records
    /// even when they fall below the custom range.
    pub fn decode_with_overrides(
        bytes: &[u8],
        overrides: &HashSet<u64>,
    ) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let msg_type = MessageType::try_from(reader.read_u16()?)?;
        let message = match msg_type {
            MessageType::UpdateAddHtlc => {
                Message::UpdateAddHtlc(UpdateAddHtlc::read(&mut reader, overrides)?)
            }
            MessageType::UpdateFulfillHtlc => {
                Message::UpdateFulfillHtlc(UpdateFulfillHtlc::read(&mut reader)?)
            }
            MessageType::UpdateFailHtlc => {
                Message::UpdateFailHtlc(UpdateFailHtlc::read(&mut reader)?)
            }
            MessageType::UpdateFailMalformedHtlc => {
                Message::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc::read(&mut reader)?)
            }
            MessageType::CommitSig => Message::CommitSig(CommitSig::read(&mut reader)?),
            MessageType::RevokeAndAck => Message::RevokeAndAck(RevokeAndAck::read(&mut reader)?),
            MessageType::ChannelReady => Message::ChannelReady(ChannelReady::read(&mut reader)?),
            MessageType::ChannelReestablish => {
                Message::ChannelReestablish(ChannelReestablish::read(&mut reader)?)
            }
            MessageType::UpdateFee => Message::UpdateFee(UpdateFee::read(&mut reader)?),
            MessageType::Stfu => Message::Stfu(Stfu::read(&mut reader)?),
            MessageType::Error => Message::Error(ErrorMessage::read(&mut reader)?),
            MessageType::ChannelUpdate => {
                Message::ChannelUpdate(ChannelUpdate::read(&mut reader)?)
            }
        };
        if !reader.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(message)
    }
}
