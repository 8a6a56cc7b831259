//! Extension and payload block layout
//!
//! Every block after the primary is self-describing: a type tag, an
//! SDNV of processing flags, an optional EID-reference list, and a
//! length-delimited body. The payload block (type 1) is special only in
//! that its body is the ADU and everything after it is a trailer block.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::sdnv;
use crate::error::CodecError;

/// Block type of the payload block
pub const BLOCK_TYPE_PAYLOAD: u8 = 1;
/// Block type of the bundle-age extension block
pub const BLOCK_TYPE_BUNDLE_AGE: u8 = 20;

/// Default ceiling on a single block's serialized size
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 2000;

/// Block processing flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct BlockFlags(pub u64);

impl BlockFlags {
    pub const MUST_BE_COPIED: BlockFlags = BlockFlags(0x01);
    pub const REPORT_IF_UNPROCESSED: BlockFlags = BlockFlags(0x02);
    pub const ABORT_IF_UNPROCESSED: BlockFlags = BlockFlags(0x04);
    pub const IS_LAST: BlockFlags = BlockFlags(0x08);
    pub const REMOVE_IF_UNPROCESSED: BlockFlags = BlockFlags(0x10);
    pub const FORWARDED_OPAQUE: BlockFlags = BlockFlags(0x20);
    pub const HAS_EID_REFERENCES: BlockFlags = BlockFlags(0x40);

    pub fn contains(self, flag: BlockFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: BlockFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: BlockFlags) {
        self.0 &= !flag.0;
    }
}

/// Parsed header of a non-primary block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: u8,
    pub flags: BlockFlags,
    pub eid_refs: Vec<(u64, u64)>,
    pub data_length: u64,
    /// Serialized length of the header itself
    pub header_length: usize,
}

/// Parse a block header from the front of `buf`
pub fn parse_block_header(buf: &[u8]) -> Result<BlockHeader, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Truncated(0));
    }
    let block_type = buf[0];
    let mut cursor = 1;
    let (flag_word, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
    cursor += n;
    let flags = BlockFlags(flag_word);

    let mut eid_refs = Vec::new();
    if flags.contains(BlockFlags::HAS_EID_REFERENCES) {
        let (count, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        for _ in 0..count {
            let (scheme_offset, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            let (nss_offset, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            eid_refs.push((scheme_offset, nss_offset));
        }
    }

    let (data_length, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
    cursor += n;

    Ok(BlockHeader {
        block_type,
        flags,
        eid_refs,
        data_length,
        header_length: cursor,
    })
}

/// Serialize a block header
pub fn serialize_block_header(
    block_type: u8,
    flags: BlockFlags,
    eid_refs: &[(u64, u64)],
    data_length: u64,
    out: &mut Vec<u8>,
) {
    out.push(block_type);
    let mut flags = flags;
    if eid_refs.is_empty() {
        flags.remove(BlockFlags::HAS_EID_REFERENCES);
    } else {
        flags.insert(BlockFlags::HAS_EID_REFERENCES);
    }
    sdnv::encode(flags.0, out);
    if !eid_refs.is_empty() {
        sdnv::encode(eid_refs.len() as u64, out);
        for (scheme_offset, nss_offset) in eid_refs {
            sdnv::encode(*scheme_offset, out);
            sdnv::encode(*nss_offset, out);
        }
    }
    sdnv::encode(data_length, out);
}

/// A complete extension block held in memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionBlock {
    pub block_type: u8,
    pub flags: BlockFlags,
    pub eid_refs: Vec<(u64, u64)>,
    pub body: Bytes,
}

impl ExtensionBlock {
    /// Serialized size of this block
    pub fn serialized_len(&self) -> usize {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out.len()
    }

    /// Append the serialized block
    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_block_header(
            self.block_type,
            self.flags,
            &self.eid_refs,
            self.body.len() as u64,
            out,
        );
        out.extend_from_slice(&self.body);
    }

    /// Parse one complete block (header + body) from the front of `buf`
    ///
    /// Returns the block and the bytes consumed.
    pub fn parse(buf: &[u8], max_block_size: u64) -> Result<(ExtensionBlock, usize), CodecError> {
        let header = parse_block_header(buf)?;
        if header.data_length > max_block_size {
            return Err(CodecError::BlockTooLong {
                length: header.data_length,
                max: max_block_size,
            });
        }
        let end = header.header_length + header.data_length as usize;
        if buf.len() < end {
            return Err(CodecError::Truncated(buf.len()));
        }
        let body = Bytes::copy_from_slice(&buf[header.header_length..end]);
        Ok((
            ExtensionBlock {
                block_type: header.block_type,
                flags: header.flags,
                eid_refs: header.eid_refs,
                body,
            },
            end,
        ))
    }
}

/// Build a bundle-age extension block (age in microseconds)
pub fn bundle_age_block(age_micros: u64) -> ExtensionBlock {
    let mut body = Vec::new();
    sdnv::encode(age_micros, &mut body);
    ExtensionBlock {
        block_type: BLOCK_TYPE_BUNDLE_AGE,
        flags: BlockFlags::FORWARDED_OPAQUE,
        eid_refs: Vec::new(),
        body: Bytes::from(body),
    }
}

/// Decode the age carried by a bundle-age block body
pub fn decode_bundle_age(body: &[u8]) -> Result<u64, CodecError> {
    let (age, _) = sdnv::decode(body)?;
    Ok(age)
}

impl CodecError {
    /// Rebase a truncation/SDNV offset onto an enclosing buffer
    pub(crate) fn at_offset(self, base: usize) -> CodecError {
        match self {
            CodecError::Truncated(n) => CodecError::Truncated(base + n),
            CodecError::InvalidSdnv(n) => CodecError::InvalidSdnv(base + n),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_roundtrip() {
        let block = ExtensionBlock {
            block_type: 7,
            flags: BlockFlags::REPORT_IF_UNPROCESSED,
            eid_refs: Vec::new(),
            body: Bytes::from_static(b"opaque-body"),
        };
        let mut buf = Vec::new();
        block.serialize(&mut buf);

        let (parsed, consumed) = ExtensionBlock::parse(&buf, DEFAULT_MAX_BLOCK_SIZE).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_eid_refs_roundtrip() {
        let block = ExtensionBlock {
            block_type: 9,
            flags: BlockFlags::default(),
            eid_refs: vec![(3, 17), (160, 2)],
            body: Bytes::from_static(b"x"),
        };
        let mut buf = Vec::new();
        block.serialize(&mut buf);

        let (parsed, _) = ExtensionBlock::parse(&buf, DEFAULT_MAX_BLOCK_SIZE).unwrap();
        assert_eq!(parsed.eid_refs, vec![(3, 17), (160, 2)]);
        assert!(parsed.flags.contains(BlockFlags::HAS_EID_REFERENCES));
    }

    #[test]
    fn test_oversized_block_rejected() {
        let block = ExtensionBlock {
            block_type: 7,
            flags: BlockFlags::default(),
            eid_refs: Vec::new(),
            body: Bytes::from(vec![0u8; 64]),
        };
        let mut buf = Vec::new();
        block.serialize(&mut buf);
        assert!(matches!(
            ExtensionBlock::parse(&buf, 16),
            Err(CodecError::BlockTooLong { .. })
        ));
    }

    #[test]
    fn test_truncated_body() {
        let block = ExtensionBlock {
            block_type: 7,
            flags: BlockFlags::default(),
            eid_refs: Vec::new(),
            body: Bytes::from_static(b"full-body"),
        };
        let mut buf = Vec::new();
        block.serialize(&mut buf);
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            ExtensionBlock::parse(&buf, DEFAULT_MAX_BLOCK_SIZE),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_bundle_age_roundtrip() {
        let block = bundle_age_block(123_456_789);
        assert_eq!(block.block_type, BLOCK_TYPE_BUNDLE_AGE);
        assert_eq!(decode_bundle_age(&block.body).unwrap(), 123_456_789);
    }
}
