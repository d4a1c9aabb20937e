//! Transaction extra field codec
//!
//! `tx.extra` is a free-form byte area holding a sequence of tagged records:
//!
//! | tag    | record           | layout                                        |
//! |--------|------------------|-----------------------------------------------|
//! | `0x00` | padding          | zero bytes up to the end of the field         |
//! | `0x01` | public key       | 32 bytes                                      |
//! | `0x02` | nonce            | u8 length, payload                            |
//! | `0x03` | merge mining tag | varint length, then varint depth + 32-byte root |
//!
//! Records are parsed strictly left to right. A single malformed record
//! rejects the whole field; no partial result is ever returned.

use crate::error::{NodeError, Result};

pub const TX_EXTRA_TAG_PADDING: u8 = 0x00;
pub const TX_EXTRA_TAG_PUBKEY: u8 = 0x01;
pub const TX_EXTRA_NONCE: u8 = 0x02;
pub const TX_EXTRA_MERGE_MINING_TAG: u8 = 0x03;

/// Maximum padding run, tag byte included.
pub const TX_EXTRA_PADDING_MAX_COUNT: usize = 255;
/// Maximum nonce payload; the length prefix is a single byte.
pub const TX_EXTRA_NONCE_MAX_COUNT: usize = 255;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const HASH_SIZE: usize = 32;

pub type Hash = [u8; HASH_SIZE];
pub type PublicKey = [u8; PUBLIC_KEY_SIZE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraPadding {
    /// Number of bytes occupied, tag included.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraPublicKey {
    pub key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraNonce {
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraMergeMiningTag {
    pub depth: u64,
    pub merkle_root: Hash,
}

/// One parsed record of the extra field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraField {
    Padding(ExtraPadding),
    PublicKey(ExtraPublicKey),
    Nonce(ExtraNonce),
    MergeMiningTag(ExtraMergeMiningTag),
}

/// Implemented by every record payload so callers can look a variant up by type.
pub trait ExtraFieldKind: Sized {
    fn from_field(field: &ExtraField) -> Option<&Self>;
}

impl ExtraFieldKind for ExtraPadding {
    fn from_field(field: &ExtraField) -> Option<&Self> {
        match field {
            ExtraField::Padding(p) => Some(p),
            _ => None,
        }
    }
}

impl ExtraFieldKind for ExtraPublicKey {
    fn from_field(field: &ExtraField) -> Option<&Self> {
        match field {
            ExtraField::PublicKey(k) => Some(k),
            _ => None,
        }
    }
}

impl ExtraFieldKind for ExtraNonce {
    fn from_field(field: &ExtraField) -> Option<&Self> {
        match field {
            ExtraField::Nonce(n) => Some(n),
            _ => None,
        }
    }
}

impl ExtraFieldKind for ExtraMergeMiningTag {
    fn from_field(field: &ExtraField) -> Option<&Self> {
        match field {
            ExtraField::MergeMiningTag(t) => Some(t),
            _ => None,
        }
    }
}

/// Returns the first record of type `T`. Absence is a normal outcome.
pub fn find_field<T: ExtraFieldKind>(fields: &[ExtraField]) -> Option<&T> {
    fields.iter().find_map(T::from_field)
}

// ============================================================================
// Encoding
// ============================================================================

/// Append a nonce record carrying `nonce` to `extra`.
pub fn add_extra_nonce(extra: &mut Vec<u8>, nonce: &[u8]) -> Result<()> {
    if nonce.len() > TX_EXTRA_NONCE_MAX_COUNT {
        return Err(NodeError::EncodingError(format!(
            "nonce is {} bytes, max {}",
            nonce.len(),
            TX_EXTRA_NONCE_MAX_COUNT
        )));
    }
    extra.reserve(2 + nonce.len());
    extra.push(TX_EXTRA_NONCE);
    extra.push(nonce.len() as u8);
    extra.extend_from_slice(nonce);
    Ok(())
}

/// Build a fresh extra field holding a single nonce record.
pub fn encode_nonce(payload: &[u8]) -> Result<Vec<u8>> {
    let mut extra = Vec::with_capacity(2 + payload.len());
    add_extra_nonce(&mut extra, payload)?;
    Ok(extra)
}

pub fn add_public_key(extra: &mut Vec<u8>, key: &PublicKey) {
    extra.push(TX_EXTRA_TAG_PUBKEY);
    extra.extend_from_slice(key);
}

pub fn add_merge_mining_tag(extra: &mut Vec<u8>, tag: &ExtraMergeMiningTag) {
    let mut blob = Vec::with_capacity(10 + HASH_SIZE);
    write_varint(&mut blob, tag.depth);
    blob.extend_from_slice(&tag.merkle_root);

    extra.push(TX_EXTRA_MERGE_MINING_TAG);
    write_varint(extra, blob.len() as u64);
    extra.extend_from_slice(&blob);
}

/// Append `size` bytes of padding, tag included. Padding swallows everything
/// after it when parsed, so it must be the final record.
pub fn add_padding(extra: &mut Vec<u8>, size: usize) -> Result<()> {
    if size == 0 || size > TX_EXTRA_PADDING_MAX_COUNT {
        return Err(NodeError::EncodingError(format!(
            "padding size {} outside 1..={}",
            size, TX_EXTRA_PADDING_MAX_COUNT
        )));
    }
    extra.push(TX_EXTRA_TAG_PADDING);
    extra.resize(extra.len() + size - 1, 0);
    Ok(())
}

/// Serialize a full record list.
pub fn encode_fields(fields: &[ExtraField]) -> Result<Vec<u8>> {
    let mut extra = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        match field {
            ExtraField::Padding(p) => {
                if i + 1 != fields.len() {
                    return Err(NodeError::EncodingError(
                        "padding must be the last record".to_string(),
                    ));
                }
                add_padding(&mut extra, p.size)?;
            }
            ExtraField::PublicKey(k) => add_public_key(&mut extra, &k.key),
            ExtraField::Nonce(n) => add_extra_nonce(&mut extra, &n.nonce)?,
            ExtraField::MergeMiningTag(t) => add_merge_mining_tag(&mut extra, t),
        }
    }
    Ok(extra)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

// ============================================================================
// Decoding
// ============================================================================

struct ExtraReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ExtraReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or_else(|| {
            NodeError::ParseError(format!("unexpected end of extra at offset {}", self.pos))
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(NodeError::ParseError(format!(
                "record at offset {} needs {} bytes, {} left",
                self.pos,
                len,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        bytes
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            if shift == 63 && bits > 1 {
                return Err(NodeError::ParseError("varint overflows u64".to_string()));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                if byte == 0 && shift != 0 {
                    return Err(NodeError::ParseError("non-canonical varint".to_string()));
                }
                return Ok(value);
            }
        }
        Err(NodeError::ParseError("varint overflows u64".to_string()))
    }
}

/// Parse the whole extra field. Fails on unknown tags and any truncation.
pub fn parse_extra(extra: &[u8]) -> Result<Vec<ExtraField>> {
    let mut reader = ExtraReader::new(extra);
    let mut fields = Vec::new();

    while !reader.is_empty() {
        let offset = reader.pos;
        let tag = reader.read_u8()?;
        let field = match tag {
            TX_EXTRA_TAG_PADDING => {
                let zeros = reader.read_rest();
                let size = zeros.len() + 1;
                if size > TX_EXTRA_PADDING_MAX_COUNT {
                    return Err(NodeError::ParseError(format!(
                        "padding of {} bytes exceeds {}",
                        size, TX_EXTRA_PADDING_MAX_COUNT
                    )));
                }
                if zeros.iter().any(|b| *b != 0) {
                    return Err(NodeError::ParseError(format!(
                        "non-zero byte in padding starting at offset {}",
                        offset
                    )));
                }
                ExtraField::Padding(ExtraPadding { size })
            }
            TX_EXTRA_TAG_PUBKEY => {
                let mut key = [0u8; PUBLIC_KEY_SIZE];
                key.copy_from_slice(reader.read_bytes(PUBLIC_KEY_SIZE)?);
                ExtraField::PublicKey(ExtraPublicKey { key })
            }
            TX_EXTRA_NONCE => {
                let len = reader.read_u8()? as usize;
                let nonce = reader.read_bytes(len)?.to_vec();
                ExtraField::Nonce(ExtraNonce { nonce })
            }
            TX_EXTRA_MERGE_MINING_TAG => {
                let len = reader.read_varint()?;
                let len = usize::try_from(len).map_err(|_| {
                    NodeError::ParseError(format!("merge mining tag length {} too large", len))
                })?;
                let blob = reader.read_bytes(len)?;
                ExtraField::MergeMiningTag(parse_merge_mining_tag(blob)?)
            }
            other => {
                return Err(NodeError::ParseError(format!(
                    "unknown tag 0x{:02x} at offset {}",
                    other, offset
                )))
            }
        };
        fields.push(field);
    }

    Ok(fields)
}

fn parse_merge_mining_tag(blob: &[u8]) -> Result<ExtraMergeMiningTag> {
    let mut reader = ExtraReader::new(blob);
    let depth = reader.read_varint()?;
    let mut merkle_root = [0u8; HASH_SIZE];
    merkle_root.copy_from_slice(reader.read_bytes(HASH_SIZE)?);
    if !reader.is_empty() {
        return Err(NodeError::ParseError(format!(
            "{} trailing bytes in merge mining tag",
            reader.remaining()
        )));
    }
    Ok(ExtraMergeMiningTag { depth, merkle_root })
}
