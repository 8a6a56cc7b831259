//! Primary block layout
//!
//! The primary block opens every serialized bundle: version, the packed
//! processing-flags word, a block length, the four EIDs (as dictionary
//! offsets, or as node/service numbers in the dictionary-free CBHE
//! form), the creation timestamp, the lifetime, the dictionary, and —
//! for fragments — the fragment offset and total ADU length.
//!
//! CBHE encoding is used when all four EIDs are ipn or null; a single
//! non-CBHE EID forces the dictionary form for the whole block.

use serde::{Deserialize, Serialize};

use crate::codec::sdnv;
use crate::cos::{
    BundleFlags, ClassOfService, SrrFlags, pack_proc_flags, unpack_proc_flags,
};
use crate::eid::Eid;
use crate::error::CodecError;
use crate::ids::{BundleId, CreationTimestamp};

/// Bundle protocol version emitted and accepted
pub const BP_VERSION: u8 = 6;

/// Sanity floor for a serialized primary block
pub const MIN_PRIMARY_BLOCK_LEN: usize = 23;

/// In-memory form of a primary block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryBlock {
    pub flags: BundleFlags,
    pub class: ClassOfService,
    pub srr: SrrFlags,
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    pub creation: CreationTimestamp,
    pub lifetime_secs: u64,
    pub fragment_offset: u64,
    pub total_adu_length: u64,
}

impl PrimaryBlock {
    /// The identity triple carried by this block
    pub fn bundle_id(&self) -> BundleId {
        BundleId {
            source: self.source.clone(),
            creation: self.creation,
            fragment_offset: self.fragment_offset,
        }
    }

    fn eids(&self) -> [&Eid; 4] {
        [
            &self.destination,
            &self.source,
            &self.report_to,
            &self.custodian,
        ]
    }

    /// Serialize the block
    pub fn serialize(&self) -> Vec<u8> {
        let cbhe = self.eids().iter().all(|eid| eid.is_cbhe() || eid.is_null());

        // Body: everything after the block-length SDNV.
        let mut body = Vec::new();
        let dictionary = if cbhe {
            for eid in self.eids() {
                match eid {
                    Eid::Cbhe {
                        node_nbr,
                        service_nbr,
                    } => {
                        sdnv::encode(*node_nbr, &mut body);
                        sdnv::encode(*service_nbr as u64, &mut body);
                    }
                    _ => {
                        sdnv::encode(0, &mut body);
                        sdnv::encode(0, &mut body);
                    }
                }
            }
            Vec::new()
        } else {
            let (dictionary, offsets) = build_dictionary(self.eids());
            for (scheme_offset, nss_offset) in offsets {
                sdnv::encode(scheme_offset, &mut body);
                sdnv::encode(nss_offset, &mut body);
            }
            dictionary
        };

        sdnv::encode(self.creation.seconds, &mut body);
        sdnv::encode(self.creation.count as u64, &mut body);
        sdnv::encode(self.lifetime_secs, &mut body);
        sdnv::encode(dictionary.len() as u64, &mut body);
        body.extend_from_slice(&dictionary);
        if self.flags.is_fragment {
            sdnv::encode(self.fragment_offset, &mut body);
            sdnv::encode(self.total_adu_length, &mut body);
        }

        let mut out = vec![BP_VERSION];
        sdnv::encode(pack_proc_flags(self.flags, self.class, self.srr), &mut out);
        sdnv::encode(body.len() as u64, &mut out);
        out.extend_from_slice(&body);
        out
    }

    /// Parse a primary block from the front of `buf`
    ///
    /// Returns the block and the bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(PrimaryBlock, usize), CodecError> {
        if buf.is_empty() {
            return Err(CodecError::Truncated(0));
        }
        if buf[0] != BP_VERSION {
            return Err(CodecError::UnsupportedVersion(buf[0]));
        }
        let mut cursor = 1;
        let (flag_word, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let (flags, class, srr) = unpack_proc_flags(flag_word);

        let (block_length, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let body_end = cursor + block_length as usize;
        if buf.len() < body_end {
            return Err(CodecError::Truncated(buf.len()));
        }

        let mut offsets = [(0u64, 0u64); 4];
        for pair in offsets.iter_mut() {
            let (scheme_offset, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            let (nss_offset, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            *pair = (scheme_offset, nss_offset);
        }

        let (seconds, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let (count, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let (lifetime_secs, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let (dictionary_length, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;

        let mut eids: Vec<Eid> = Vec::with_capacity(4);
        if dictionary_length == 0 {
            for (node_nbr, service_nbr) in offsets {
                if node_nbr == 0 && service_nbr == 0 {
                    eids.push(Eid::Null);
                } else {
                    let service_nbr = u32::try_from(service_nbr).map_err(|_| {
                        CodecError::InvalidValue(format!("service number {service_nbr}"))
                    })?;
                    eids.push(Eid::ipn(node_nbr, service_nbr));
                }
            }
        } else {
            let dict_end = cursor + dictionary_length as usize;
            if buf.len() < dict_end || dict_end > body_end {
                return Err(CodecError::Truncated(buf.len()));
            }
            let dictionary = &buf[cursor..dict_end];
            cursor = dict_end;
            for (scheme_offset, nss_offset) in offsets {
                let scheme = dictionary_string(dictionary, scheme_offset)?;
                let nss = dictionary_string(dictionary, nss_offset)?;
                eids.push(Eid::from_parts(scheme, nss)?);
            }
        }

        let (fragment_offset, total_adu_length) = if flags.is_fragment {
            let (offset, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            let (total, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            (offset, total)
        } else {
            (0, 0)
        };

        if cursor != body_end {
            return Err(CodecError::InvalidValue(format!(
                "primary block length mismatch ({cursor} != {body_end})"
            )));
        }

        let mut eids = eids.into_iter();
        let block = PrimaryBlock {
            flags,
            class,
            srr,
            destination: eids.next().unwrap_or_default(),
            source: eids.next().unwrap_or_default(),
            report_to: eids.next().unwrap_or_default(),
            custodian: eids.next().unwrap_or_default(),
            creation: CreationTimestamp::new(seconds, count as u32),
            lifetime_secs,
            fragment_offset,
            total_adu_length,
        };
        Ok((block, cursor))
    }
}

/// Build a dictionary and per-EID (scheme, nss) offsets
fn build_dictionary(eids: [&Eid; 4]) -> (Vec<u8>, [(u64, u64); 4]) {
    let mut dictionary: Vec<u8> = Vec::new();
    let mut intern = |s: &str, dictionary: &mut Vec<u8>| -> u64 {
        // Reuse an existing NUL-terminated occurrence when present.
        let needle: Vec<u8> = s.bytes().chain(std::iter::once(0)).collect();
        if let Some(pos) = dictionary
            .windows(needle.len())
            .position(|window| window == needle)
            && (pos == 0 || dictionary[pos - 1] == 0)
        {
            return pos as u64;
        }
        let offset = dictionary.len() as u64;
        dictionary.extend_from_slice(&needle);
        offset
    };

    let mut offsets = [(0u64, 0u64); 4];
    for (i, eid) in eids.iter().enumerate() {
        let scheme_offset = intern(eid.scheme_name(), &mut dictionary);
        let nss_offset = intern(&eid.nss(), &mut dictionary);
        offsets[i] = (scheme_offset, nss_offset);
    }
    (dictionary, offsets)
}

/// Read a NUL-terminated string at `offset` in the dictionary
fn dictionary_string(dictionary: &[u8], offset: u64) -> Result<&str, CodecError> {
    let start = offset as usize;
    if start >= dictionary.len() {
        return Err(CodecError::DictionaryOffset(offset));
    }
    let end = dictionary[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or(CodecError::DictionaryOffset(offset))?;
    std::str::from_utf8(&dictionary[start..end])
        .map_err(|_| CodecError::DictionaryOffset(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(source: Eid, destination: Eid) -> PrimaryBlock {
        PrimaryBlock {
            flags: BundleFlags {
                singleton_destination: true,
                ..Default::default()
            },
            class: ClassOfService::Standard,
            srr: SrrFlags::none(),
            destination,
            source,
            report_to: Eid::Null,
            custodian: Eid::Null,
            creation: CreationTimestamp::new(812_000_123, 4),
            lifetime_secs: 3600,
            fragment_offset: 0,
            total_adu_length: 0,
        }
    }

    #[test]
    fn test_cbhe_roundtrip() {
        let block = make_block(Eid::ipn(1, 1), Eid::ipn(2, 1));
        let buf = block.serialize();
        let (parsed, consumed) = PrimaryBlock::parse(&buf).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_dictionary_roundtrip() {
        let source = Eid::parse("mars:lander/3").unwrap();
        let destination = Eid::parse("mars:orbiter").unwrap();
        let block = make_block(source, destination);
        let buf = block.serialize();
        let (parsed, consumed) = PrimaryBlock::parse(&buf).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_mixed_eids_use_dictionary() {
        let block = make_block(Eid::ipn(1, 1), Eid::parse("mars:orbiter").unwrap());
        let buf = block.serialize();
        let (parsed, _) = PrimaryBlock::parse(&buf).unwrap();
        assert_eq!(parsed.source, Eid::ipn(1, 1));
        assert_eq!(parsed.destination, Eid::parse("mars:orbiter").unwrap());
    }

    #[test]
    fn test_fragment_fields_roundtrip() {
        let mut block = make_block(Eid::ipn(1, 1), Eid::ipn(2, 1));
        block.flags.is_fragment = true;
        block.fragment_offset = 40;
        block.total_adu_length = 100;

        let buf = block.serialize();
        let (parsed, _) = PrimaryBlock::parse(&buf).unwrap();
        assert_eq!(parsed.fragment_offset, 40);
        assert_eq!(parsed.total_adu_length, 100);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let block = make_block(Eid::ipn(1, 1), Eid::ipn(2, 1));
        let mut buf = block.serialize();
        buf[0] = 7;
        assert!(matches!(
            PrimaryBlock::parse(&buf),
            Err(CodecError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_truncation_rejected() {
        let block = make_block(Eid::ipn(1, 1), Eid::ipn(2, 1));
        let buf = block.serialize();
        for cut in 1..buf.len() {
            assert!(PrimaryBlock::parse(&buf[..cut]).is_err());
        }
    }
}
