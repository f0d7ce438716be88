//! BigSize varint and TLV stream framing.
//!
//! A TLV record is `(type: BigSize, length: BigSize, value: bytes)`. Records
//! in a stream are strictly ascending by type. Unknown even types are a
//! decoding error, unknown odd types are skipped ("it's OK to be odd").

use super::WireError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// The minimum custom records TLV type. Types greater than or equal to this
/// value are carried opaquely and belong to the user, not the protocol.
pub const MIN_CUSTOM_RECORDS_TLV_TYPE: u64 = 65536;

// ============================================================
// Reader
// ============================================================

/// A byte-slice cursor used by all wire decoders.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEof);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes32(&mut self) -> Result<[u8; 32], WireError> {
        Ok(self.take(32)?.try_into().unwrap())
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

// ============================================================
// BigSize
// ============================================================

/// Write a BigSize varint: 1, 3, 5 or 9 bytes depending on magnitude.
pub fn write_bigsize(w: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => w.push(value as u8),
        0xfd..=0xffff => {
            w.push(0xfd);
            w.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x10000..=0xffff_ffff => {
            w.push(0xfe);
            w.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            w.push(0xff);
            w.extend_from_slice(&value.to_be_bytes());
        }
    }
}

/// Read a BigSize varint, rejecting non-canonical encodings.
pub fn read_bigsize(r: &mut Reader) -> Result<u64, WireError> {
    let tag = r.read_u8()?;
    match tag {
        0xfd => {
            let value = r.read_u16()? as u64;
            if value < 0xfd {
                return Err(WireError::NonCanonicalBigSize);
            }
            Ok(value)
        }
        0xfe => {
            let value = r.read_u32()? as u64;
            if value <= 0xffff {
                return Err(WireError::NonCanonicalBigSize);
            }
            Ok(value)
        }
        0xff => {
            let value = r.read_u64()?;
            if value <= 0xffff_ffff {
                return Err(WireError::NonCanonicalBigSize);
            }
            Ok(value)
        }
        _ => Ok(tag as u64),
    }
}

/// Truncated big-endian integers as used in TLV values: leading zero bytes
/// are omitted (zero encodes to the empty string) and forbidden on decode.
pub fn write_tu64(w: &mut Vec<u8>, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    w.extend_from_slice(&bytes[skip..]);
}

pub fn read_tu64(value: &[u8]) -> Result<u64, WireError> {
    if value.len() > 8 || value.first() == Some(&0) {
        return Err(WireError::InvalidLength);
    }
    let mut out = 0u64;
    for b in value {
        out = (out << 8) | *b as u64;
    }
    Ok(out)
}

pub fn write_tu32(w: &mut Vec<u8>, value: u32) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    w.extend_from_slice(&bytes[skip..]);
}

pub fn read_tu32(value: &[u8]) -> Result<u32, WireError> {
    let wide = read_tu64(value)?;
    u32::try_from(wide).map_err(|_| WireError::InvalidLength)
}

// ============================================================
// TlvStream
// ============================================================

/// A decoded TLV stream: a map from record type to opaque value bytes.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlvStream {
    records: BTreeMap<u64, Vec<u8>>,
}

impl TlvStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a stream from the remainder of the reader. Types must be
    /// strictly ascending; a repeated or descending type is an error.
    pub fn decode(r: &mut Reader) -> Result<Self, WireError> {
        let mut records = BTreeMap::new();
        let mut last_type: Option<u64> = None;
        while !r.is_empty() {
            let tlv_type = read_bigsize(r)?;
            if let Some(last) = last_type {
                if tlv_type <= last {
                    return Err(WireError::DuplicateType(tlv_type));
                }
            }
            last_type = Some(tlv_type);
            let length = read_bigsize(r)?;
            let length = usize::try_from(length).map_err(|_| WireError::InvalidLength)?;
            let value = r.take(length)?.to_vec();
            records.insert(tlv_type, value);
        }
        Ok(Self { records })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Self::decode(&mut Reader::new(bytes))
    }

    /// Encode the stream; records are written in ascending type order.
    pub fn encode(&self, w: &mut Vec<u8>) {
        for (tlv_type, value) in &self.records {
            write_bigsize(w, *tlv_type);
            write_bigsize(w, value.len() as u64);
            w.extend_from_slice(value);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn insert(&mut self, tlv_type: u64, value: Vec<u8>) -> Result<(), WireError> {
        if self.records.insert(tlv_type, value).is_some() {
            return Err(WireError::DuplicateType(tlv_type));
        }
        Ok(())
    }

    pub fn get(&self, tlv_type: u64) -> Option<&[u8]> {
        self.records.get(&tlv_type).map(|v| v.as_slice())
    }

    pub fn remove(&mut self, tlv_type: u64) -> Option<Vec<u8>> {
        self.records.remove(&tlv_type)
    }

    pub fn contains(&self, tlv_type: u64) -> bool {
        self.records.contains_key(&tlv_type)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// The set of types present, used by payload validation.
    pub fn parsed_types(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Vec<u8>)> {
        self.records.iter()
    }

    /// Enforce the even/odd rule: every even record type must be understood
    /// by the caller. Odd types are free to be ignored.
    pub fn ensure_understood(&self, understands: impl Fn(u64) -> bool) -> Result<(), WireError> {
        for tlv_type in self.records.keys() {
            if tlv_type % 2 == 0 && !understands(*tlv_type) {
                return Err(WireError::UnknownRequiredType(*tlv_type));
            }
        }
        Ok(())
    }

    /// Move every record in the custom range (plus configured overrides) out
    /// of the stream into a `CustomRecords` map.
    pub fn split_custom_records(&mut self, overrides: &HashSet<u64>) -> CustomRecords {
        let custom_types: Vec<u64> = self
            .records
            .keys()
            .filter(|t| **t >= MIN_CUSTOM_RECORDS_TLV_TYPE || overrides.contains(t))
            .copied()
            .collect();
        let mut custom = BTreeMap::new();
        for tlv_type in custom_types {
            if let Some(value) = self.records.remove(&tlv_type) {
                custom.insert(tlv_type, value);
            }
        }
        CustomRecords(custom)
    }
}

// ============================================================
// CustomRecords
// ============================================================

/// A set of user-defined key/value pairs carried transparently in wire
/// messages and onion payloads. Keys must be in the custom TLV range.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRecords(pub BTreeMap<u64, Vec<u8>>);

impl CustomRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that all record keys are in the custom type range. Keys listed
    /// in `overrides` are permitted below the boundary.
    pub fn validate(&self, overrides: &HashSet<u64>) -> Result<(), WireError> {
        for key in self.0.keys() {
            if *key < MIN_CUSTOM_RECORDS_TLV_TYPE && !overrides.contains(key) {
                return Err(WireError::CustomRecordOutOfRange(*key));
            }
        }
        Ok(())
    }

    /// Merge the custom records into a message TLV stream, rejecting keys
    /// that collide with records the message itself uses.
    pub fn merge_into(&self, stream: &mut TlvStream) -> Result<(), WireError> {
        for (key, value) in &self.0 {
            if stream.contains(*key) {
                return Err(WireError::CustomRecordCollision(*key));
            }
            stream.insert(*key, value.clone())?;
        }
        Ok(())
    }

    pub fn get(&self, key: u64) -> Option<&[u8]> {
        self.0.get(&key).map(|v| v.as_slice())
    }

    pub fn insert(&mut self, key: u64, value: Vec<u8>) {
        self.0.insert(key, value);
    }

    pub fn remove(&mut self, key: u64) -> Option<Vec<u8>> {
        self.0.remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize as a standalone TLV stream.
    pub fn serialize(&self) -> Vec<u8> {
        let mut stream = TlvStream::new();
        for (key, value) in &self.0 {
            stream
                .insert(*key, value.clone())
                .expect("BTreeMap keys are unique");
        }
        stream.to_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let stream = TlvStream::from_bytes(bytes)?;
        let mut out = BTreeMap::new();
        for (key, value) in stream.iter() {
            out.insert(*key, value.clone());
        }
        Ok(Self(out))
    }
}
