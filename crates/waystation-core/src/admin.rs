//! Administrative records
//!
//! Two record types ride as the ADU of admin-flagged bundles: status
//! reports and custody signals. Both carry the subject bundle's
//! identity (source EID, creation timestamp, and the fragment fields
//! when the subject was a fragment) so the consumer can find the bundle
//! they speak about.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::sdnv;
use crate::error::CodecError;
use crate::ids::CreationTimestamp;

/// Record type tag of a status report
pub const ADMIN_RECORD_STATUS_REPORT: u8 = 1;
/// Record type tag of a custody signal
pub const ADMIN_RECORD_CUSTODY_SIGNAL: u8 = 2;

const ADMIN_FLAG_FOR_FRAGMENT: u8 = 0x01;

/// Seconds/nanoseconds timestamp used inside admin records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DtnTime {
    pub seconds: u64,
    pub nanos: u32,
}

impl DtnTime {
    pub fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Timestamp of the given wall-clock instant, in BP-epoch seconds
    pub fn from_datetime(at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            seconds: crate::ids::CreationTimestamp::seconds_from_unix(at.timestamp()),
            nanos: at.timestamp_subsec_nanos(),
        }
    }

    /// Whether this timestamp was ever set
    pub fn is_set(&self) -> bool {
        self.seconds != 0 || self.nanos != 0
    }
}

impl fmt::Display for DtnTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/// Reason code of a status report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SrReason {
    #[default]
    None,
    LifetimeExpired,
    ForwardedUnidirectional,
    Canceled,
    DepletedStorage,
    DestinationUnintelligible,
    NoKnownRoute,
    NoTimelyContact,
    BlockUnintelligible,
}

impl SrReason {
    pub fn code(self) -> u8 {
        match self {
            SrReason::None => 0,
            SrReason::LifetimeExpired => 1,
            SrReason::ForwardedUnidirectional => 2,
            SrReason::Canceled => 3,
            SrReason::DepletedStorage => 4,
            SrReason::DestinationUnintelligible => 5,
            SrReason::NoKnownRoute => 6,
            SrReason::NoTimelyContact => 7,
            SrReason::BlockUnintelligible => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SrReason::None),
            1 => Some(SrReason::LifetimeExpired),
            2 => Some(SrReason::ForwardedUnidirectional),
            3 => Some(SrReason::Canceled),
            4 => Some(SrReason::DepletedStorage),
            5 => Some(SrReason::DestinationUnintelligible),
            6 => Some(SrReason::NoKnownRoute),
            7 => Some(SrReason::NoTimelyContact),
            8 => Some(SrReason::BlockUnintelligible),
            _ => None,
        }
    }
}

/// Reason code of a custody signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CtReason {
    #[default]
    None,
    RedundantReception,
    DepletedStorage,
    DestinationUnintelligible,
    NoKnownRoute,
    NoTimelyContact,
    BlockUnintelligible,
}

impl CtReason {
    pub fn code(self) -> u8 {
        match self {
            CtReason::None => 0,
            CtReason::RedundantReception => 3,
            CtReason::DepletedStorage => 4,
            CtReason::DestinationUnintelligible => 5,
            CtReason::NoKnownRoute => 6,
            CtReason::NoTimelyContact => 7,
            CtReason::BlockUnintelligible => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CtReason::None),
            3 => Some(CtReason::RedundantReception),
            4 => Some(CtReason::DepletedStorage),
            5 => Some(CtReason::DestinationUnintelligible),
            6 => Some(CtReason::NoKnownRoute),
            7 => Some(CtReason::NoTimelyContact),
            8 => Some(CtReason::BlockUnintelligible),
            _ => None,
        }
    }
}

/// Which lifecycle transitions a status report asserts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StatusFlags(pub u8);

impl StatusFlags {
    pub const RECEIVED: StatusFlags = StatusFlags(0x01);
    pub const CUSTODY_ACCEPTED: StatusFlags = StatusFlags(0x02);
    pub const FORWARDED: StatusFlags = StatusFlags(0x04);
    pub const DELIVERED: StatusFlags = StatusFlags(0x08);
    pub const DELETED: StatusFlags = StatusFlags(0x10);

    pub fn contains(self, flag: StatusFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: StatusFlags) {
        self.0 |= flag.0;
    }
}

/// A bundle status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BpStatusRpt {
    pub is_fragment: bool,
    pub flags: StatusFlags,
    pub reason: SrReason,
    pub fragment_offset: u64,
    pub fragment_length: u64,
    pub receipt_time: DtnTime,
    pub acceptance_time: DtnTime,
    pub forward_time: DtnTime,
    pub delivery_time: DtnTime,
    pub deletion_time: DtnTime,
    pub creation: CreationTimestamp,
    pub source_eid: String,
}

impl BpStatusRpt {
    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.push(self.flags.0);
        out.push(self.reason.code());
        if self.is_fragment {
            sdnv::encode(self.fragment_offset, out);
            sdnv::encode(self.fragment_length, out);
        }
        for (flag, time) in [
            (StatusFlags::RECEIVED, &self.receipt_time),
            (StatusFlags::CUSTODY_ACCEPTED, &self.acceptance_time),
            (StatusFlags::FORWARDED, &self.forward_time),
            (StatusFlags::DELIVERED, &self.delivery_time),
            (StatusFlags::DELETED, &self.deletion_time),
        ] {
            if self.flags.contains(flag) {
                sdnv::encode(time.seconds, out);
                sdnv::encode(time.nanos as u64, out);
            }
        }
        sdnv::encode(self.creation.seconds, out);
        sdnv::encode(self.creation.count as u64, out);
        sdnv::encode(self.source_eid.len() as u64, out);
        out.extend_from_slice(self.source_eid.as_bytes());
    }

    fn parse(buf: &[u8], is_fragment: bool) -> Result<BpStatusRpt, CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::Truncated(buf.len()));
        }
        let flags = StatusFlags(buf[0]);
        let reason = SrReason::from_code(buf[1])
            .ok_or_else(|| CodecError::InvalidValue(format!("status reason {}", buf[1])))?;
        let mut cursor = 2;

        let mut rpt = BpStatusRpt {
            is_fragment,
            flags,
            reason,
            ..Default::default()
        };
        if is_fragment {
            let (offset, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            let (length, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            rpt.fragment_offset = offset;
            rpt.fragment_length = length;
        }
        let mut read_time = |cursor: &mut usize| -> Result<DtnTime, CodecError> {
            let (seconds, n) = sdnv::decode(&buf[*cursor..]).map_err(|e| e.at_offset(*cursor))?;
            *cursor += n;
            let (nanos, n) = sdnv::decode(&buf[*cursor..]).map_err(|e| e.at_offset(*cursor))?;
            *cursor += n;
            Ok(DtnTime::new(seconds, nanos as u32))
        };
        if flags.contains(StatusFlags::RECEIVED) {
            rpt.receipt_time = read_time(&mut cursor)?;
        }
        if flags.contains(StatusFlags::CUSTODY_ACCEPTED) {
            rpt.acceptance_time = read_time(&mut cursor)?;
        }
        if flags.contains(StatusFlags::FORWARDED) {
            rpt.forward_time = read_time(&mut cursor)?;
        }
        if flags.contains(StatusFlags::DELIVERED) {
            rpt.delivery_time = read_time(&mut cursor)?;
        }
        if flags.contains(StatusFlags::DELETED) {
            rpt.deletion_time = read_time(&mut cursor)?;
        }

        let (seconds, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let (count, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        rpt.creation = CreationTimestamp::new(seconds, count as u32);

        let (eid_len, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let end = cursor + eid_len as usize;
        if buf.len() < end {
            return Err(CodecError::Truncated(buf.len()));
        }
        rpt.source_eid = std::str::from_utf8(&buf[cursor..end])
            .map_err(|_| CodecError::InvalidValue("status report EID not UTF-8".into()))?
            .to_string();
        Ok(rpt)
    }
}

/// A custody signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BpCtSignal {
    pub is_fragment: bool,
    pub succeeded: bool,
    pub reason: CtReason,
    pub fragment_offset: u64,
    pub fragment_length: u64,
    pub signal_time: DtnTime,
    pub creation: CreationTimestamp,
    pub source_eid: String,
}

impl BpCtSignal {
    fn serialize_into(&self, out: &mut Vec<u8>) {
        let mut status = self.reason.code();
        if self.succeeded {
            status |= 0x80;
        }
        out.push(status);
        if self.is_fragment {
            sdnv::encode(self.fragment_offset, out);
            sdnv::encode(self.fragment_length, out);
        }
        sdnv::encode(self.signal_time.seconds, out);
        sdnv::encode(self.signal_time.nanos as u64, out);
        sdnv::encode(self.creation.seconds, out);
        sdnv::encode(self.creation.count as u64, out);
        sdnv::encode(self.source_eid.len() as u64, out);
        out.extend_from_slice(self.source_eid.as_bytes());
    }

    fn parse(buf: &[u8], is_fragment: bool) -> Result<BpCtSignal, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::Truncated(0));
        }
        let succeeded = buf[0] & 0x80 != 0;
        let reason = CtReason::from_code(buf[0] & 0x7f)
            .ok_or_else(|| CodecError::InvalidValue(format!("custody reason {}", buf[0] & 0x7f)))?;
        let mut cursor = 1;

        let mut signal = BpCtSignal {
            is_fragment,
            succeeded,
            reason,
            ..Default::default()
        };
        if is_fragment {
            let (offset, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            let (length, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
            cursor += n;
            signal.fragment_offset = offset;
            signal.fragment_length = length;
        }
        let (seconds, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let (nanos, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        signal.signal_time = DtnTime::new(seconds, nanos as u32);

        let (seconds, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let (count, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        signal.creation = CreationTimestamp::new(seconds, count as u32);

        let (eid_len, n) = sdnv::decode(&buf[cursor..]).map_err(|e| e.at_offset(cursor))?;
        cursor += n;
        let end = cursor + eid_len as usize;
        if buf.len() < end {
            return Err(CodecError::Truncated(buf.len()));
        }
        signal.source_eid = std::str::from_utf8(&buf[cursor..end])
            .map_err(|_| CodecError::InvalidValue("custody signal EID not UTF-8".into()))?
            .to_string();
        Ok(signal)
    }
}

/// Either admin record kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRecord {
    StatusReport(BpStatusRpt),
    CustodySignal(BpCtSignal),
}

impl AdminRecord {
    /// Serialize the record, ready to be a bundle's ADU
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            AdminRecord::StatusReport(rpt) => {
                let mut head = ADMIN_RECORD_STATUS_REPORT << 4;
                if rpt.is_fragment {
                    head |= ADMIN_FLAG_FOR_FRAGMENT;
                }
                out.push(head);
                rpt.serialize_into(&mut out);
            }
            AdminRecord::CustodySignal(signal) => {
                let mut head = ADMIN_RECORD_CUSTODY_SIGNAL << 4;
                if signal.is_fragment {
                    head |= ADMIN_FLAG_FOR_FRAGMENT;
                }
                out.push(head);
                signal.serialize_into(&mut out);
            }
        }
        out
    }

    /// Parse an admin-record ADU
    pub fn parse(buf: &[u8]) -> Result<AdminRecord, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::Truncated(0));
        }
        let record_type = buf[0] >> 4;
        let is_fragment = buf[0] & ADMIN_FLAG_FOR_FRAGMENT != 0;
        match record_type {
            ADMIN_RECORD_STATUS_REPORT => {
                Ok(AdminRecord::StatusReport(BpStatusRpt::parse(&buf[1..], is_fragment)?))
            }
            ADMIN_RECORD_CUSTODY_SIGNAL => {
                Ok(AdminRecord::CustodySignal(BpCtSignal::parse(&buf[1..], is_fragment)?))
            }
            other => Err(CodecError::UnknownAdminRecordType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_report_roundtrip() {
        let mut flags = StatusFlags::default();
        flags.insert(StatusFlags::RECEIVED);
        flags.insert(StatusFlags::DELETED);
        let rpt = BpStatusRpt {
            is_fragment: false,
            flags,
            reason: SrReason::LifetimeExpired,
            receipt_time: DtnTime::new(800_000_000, 0),
            deletion_time: DtnTime::new(800_000_060, 500),
            creation: CreationTimestamp::new(799_999_990, 3),
            source_eid: "ipn:8.1".to_string(),
            ..Default::default()
        };
        let buf = AdminRecord::StatusReport(rpt.clone()).serialize();
        let parsed = AdminRecord::parse(&buf).unwrap();
        assert_eq!(parsed, AdminRecord::StatusReport(rpt));
    }

    #[test]
    fn test_fragment_status_report_roundtrip() {
        let mut flags = StatusFlags::default();
        flags.insert(StatusFlags::FORWARDED);
        let rpt = BpStatusRpt {
            is_fragment: true,
            flags,
            fragment_offset: 16,
            fragment_length: 8,
            forward_time: DtnTime::new(12, 34),
            creation: CreationTimestamp::new(10, 0),
            source_eid: "ipn:2.5".to_string(),
            ..Default::default()
        };
        let buf = AdminRecord::StatusReport(rpt.clone()).serialize();
        let parsed = AdminRecord::parse(&buf).unwrap();
        assert_eq!(parsed, AdminRecord::StatusReport(rpt));
    }

    #[test]
    fn test_custody_signal_roundtrip() {
        let signal = BpCtSignal {
            is_fragment: false,
            succeeded: true,
            reason: CtReason::None,
            signal_time: DtnTime::new(900, 1),
            creation: CreationTimestamp::new(890, 7),
            source_eid: "ipn:3.1".to_string(),
            ..Default::default()
        };
        let buf = AdminRecord::CustodySignal(signal.clone()).serialize();
        let parsed = AdminRecord::parse(&buf).unwrap();
        assert_eq!(parsed, AdminRecord::CustodySignal(signal));
    }

    #[test]
    fn test_refusal_signal_roundtrip() {
        let signal = BpCtSignal {
            succeeded: false,
            reason: CtReason::DepletedStorage,
            signal_time: DtnTime::new(900, 0),
            creation: CreationTimestamp::new(890, 0),
            source_eid: "mars:lander/3".to_string(),
            ..Default::default()
        };
        let buf = AdminRecord::CustodySignal(signal.clone()).serialize();
        match AdminRecord::parse(&buf).unwrap() {
            AdminRecord::CustodySignal(parsed) => {
                assert!(!parsed.succeeded);
                assert_eq!(parsed.reason, CtReason::DepletedStorage);
            }
            other => panic!("wrong record type: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_record_type() {
        assert!(matches!(
            AdminRecord::parse(&[0xF0]),
            Err(CodecError::UnknownAdminRecordType(15))
        ));
    }
}
