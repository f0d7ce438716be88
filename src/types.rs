//! Basic primitive types — Hash256, Pubkey, Privkey, ChannelId, ShortChannelId.

use crate::serde_utils::SliceHex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, IfIsHumanReadable};

// ============================================================
// Hash256
// ============================================================

/// A 256-bit hash digest, used as payment hash, preimage, chain hash etc.
#[serde_as]
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Hash256(#[serde_as(as = "SliceHex")] [u8; 32]);

impl From<[u8; 32]> for Hash256 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Hash256 {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 32 {
            return Err(anyhow::anyhow!("Invalid hash length"));
        }
        let mut data = [0u8; 32];
        data.copy_from_slice(value);
        Ok(Hash256(data))
    }
}

impl TryFrom<Vec<u8>> for Hash256 {
    type Error = anyhow::Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        value.as_slice().try_into()
    }
}

impl ::core::fmt::LowerHex for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        if f.alternate() {
            write!(f, "0x")?;
        }
        write!(f, "{}", hex::encode(self.0))
    }
}

impl ::core::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Hash256({:#x})", self)
    }
}

impl ::core::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for Hash256 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start_matches("0x");
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(anyhow::anyhow!("Invalid hash length"));
        }
        let mut data = [0u8; 32];
        data.copy_from_slice(&bytes);
        Ok(Hash256(data))
    }
}

impl From<Hash256> for [u8; 32] {
    fn from(val: Hash256) -> Self {
        val.0
    }
}

// ============================================================
// Pubkey
// ============================================================

const PUBKEY_SIZE: usize = 33;

/// A compressed secp256k1 public key. The serialized form ([u8; 33]) is stored
/// directly for fast comparison and hashing.
#[serde_as]
#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pubkey(#[serde_as(as = "IfIsHumanReadable<SliceHex, [_; 33]>")] pub [u8; 33]);

impl std::fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pubkey({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Pubkey {
    pub const fn serialization_len() -> usize {
        PUBKEY_SIZE
    }

    pub fn serialize(&self) -> [u8; PUBKEY_SIZE] {
        self.0
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, secp256k1::Error> {
        // Validate by parsing, then store the bytes directly.
        let _ = secp256k1::PublicKey::from_slice(slice)?;
        let mut bytes = [0u8; PUBKEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Pubkey(bytes))
    }
}

impl TryFrom<Vec<u8>> for Pubkey {
    type Error = secp256k1::Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Pubkey::from_slice(&value)
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<secp256k1::PublicKey> for Pubkey {
    fn from(pk: secp256k1::PublicKey) -> Pubkey {
        Pubkey(pk.serialize())
    }
}

impl From<Pubkey> for secp256k1::PublicKey {
    fn from(pk: Pubkey) -> Self {
        secp256k1::PublicKey::from_slice(&pk.0)
            .expect("Pubkey should always contain valid serialized public key")
    }
}

impl From<&Pubkey> for secp256k1::PublicKey {
    fn from(val: &Pubkey) -> Self {
        secp256k1::PublicKey::from_slice(&val.0)
            .expect("Pubkey should always contain valid serialized public key")
    }
}

// ============================================================
// Privkey
// ============================================================

/// A wrapper for a secp256k1 secret key.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Privkey(pub secp256k1::SecretKey);

impl Privkey {
    pub fn from_slice(key: &[u8]) -> Self {
        secp256k1::SecretKey::from_slice(key)
            .expect("Invalid secret key")
            .into()
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey::from(self.0.public_key(secp256k1::SECP256K1))
    }
}

impl From<[u8; 32]> for Privkey {
    fn from(k: [u8; 32]) -> Self {
        Privkey(secp256k1::SecretKey::from_slice(&k).expect("Invalid secret key"))
    }
}

impl From<Hash256> for Privkey {
    fn from(hash: Hash256) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(hash.as_ref());
        Privkey::from_slice(&bytes)
    }
}

impl From<Privkey> for secp256k1::SecretKey {
    fn from(pk: Privkey) -> Self {
        pk.0
    }
}

impl From<secp256k1::SecretKey> for Privkey {
    fn from(sk: secp256k1::SecretKey) -> Self {
        Self(sk)
    }
}

// ============================================================
// ChannelId
// ============================================================

/// A 32-byte peer-scoped channel identifier derived from the funding outpoint.
#[serde_as]
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct ChannelId(#[serde_as(as = "SliceHex")] pub [u8; 32]);

impl From<[u8; 32]> for ChannelId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for ChannelId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for ChannelId {
    type Error = anyhow::Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let hash: Hash256 = value.try_into()?;
        Ok(ChannelId(hash.into()))
    }
}

impl ::core::fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "ChannelId(0x{})", hex::encode(self.0))
    }
}

impl ::core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

// ============================================================
// ShortChannelId
// ============================================================

/// The block height at which the alias SCID range starts.
pub const ALIAS_START_BLOCK_HEIGHT: u32 = 16_000_000;

/// The first block height past the end of the alias SCID range.
pub const ALIAS_END_BLOCK_HEIGHT: u32 = 16_250_000;

/// A 64-bit channel locator: 24 bits of block height, 24 bits of transaction
/// index and 16 bits of output index. SCIDs whose block height falls within
/// the alias range do not point at a real on-chain location.
#[derive(
    Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default, Debug,
)]
pub struct ShortChannelId {
    pub block_height: u32,
    pub tx_index: u32,
    pub tx_position: u16,
}

impl ShortChannelId {
    pub const fn new(block_height: u32, tx_index: u32, tx_position: u16) -> Self {
        Self {
            block_height,
            tx_index,
            tx_position,
        }
    }

    pub fn from_u64(scid: u64) -> Self {
        Self {
            block_height: (scid >> 40) as u32 & 0x00ff_ffff,
            tx_index: (scid >> 16) as u32 & 0x00ff_ffff,
            tx_position: scid as u16,
        }
    }

    pub fn to_u64(self) -> u64 {
        ((self.block_height as u64 & 0x00ff_ffff) << 40)
            | ((self.tx_index as u64 & 0x00ff_ffff) << 16)
            | self.tx_position as u64
    }

    /// Whether this SCID lies in the reserved alias range.
    pub fn is_alias(&self) -> bool {
        self.block_height >= ALIAS_START_BLOCK_HEIGHT
            && self.block_height < ALIAS_END_BLOCK_HEIGHT
    }

    pub fn is_zero(&self) -> bool {
        self.to_u64() == 0
    }
}

impl From<u64> for ShortChannelId {
    fn from(scid: u64) -> Self {
        Self::from_u64(scid)
    }
}

impl From<ShortChannelId> for u64 {
    fn from(scid: ShortChannelId) -> Self {
        scid.to_u64()
    }
}

impl ::core::fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height, self.tx_index, self.tx_position
        )
    }
}
