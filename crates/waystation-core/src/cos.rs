//! Class of service, custody, and processing flags
//!
//! The wire format packs the class of service and the status-report
//! request set into the primary block's processing-flags word; these
//! types keep them apart in memory and fold them together only at the
//! codec boundary.

use serde::{Deserialize, Serialize};

/// Priority class of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum ClassOfService {
    /// Bulk: lowest priority, highest delay tolerance
    Bulk,
    /// Standard delivery (default)
    #[default]
    Standard,
    /// Expedited: transmitted before all other traffic
    Expedited,
}

impl ClassOfService {
    /// Wire code (0, 1, 2)
    pub fn code(self) -> u8 {
        match self {
            ClassOfService::Bulk => 0,
            ClassOfService::Standard => 1,
            ClassOfService::Expedited => 2,
        }
    }

    /// Decode from the wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ClassOfService::Bulk),
            1 => Some(ClassOfService::Standard),
            2 => Some(ClassOfService::Expedited),
            _ => None,
        }
    }
}

/// Whether the sender requests custody transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CustodySwitch {
    /// No custody transfer
    #[default]
    NoCustody,
    /// Custody wanted but optional
    SourceCustodyOptional,
    /// Custody required at every hop
    SourceCustodyRequired,
}

/// Status-report request flags
///
/// One bit per lifecycle transition the source wants reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SrrFlags(pub u8);

impl SrrFlags {
    pub const RECEIVED: SrrFlags = SrrFlags(0x01);
    pub const CUSTODY_ACCEPTED: SrrFlags = SrrFlags(0x02);
    pub const FORWARDED: SrrFlags = SrrFlags(0x04);
    pub const DELIVERED: SrrFlags = SrrFlags(0x08);
    pub const DELETED: SrrFlags = SrrFlags(0x10);

    /// No reports requested
    pub fn none() -> Self {
        SrrFlags(0)
    }

    /// Whether the given flag is set
    pub fn contains(self, flag: SrrFlags) -> bool {
        self.0 & flag.0 != 0
    }

    /// Set a flag
    pub fn insert(&mut self, flag: SrrFlags) {
        self.0 |= flag.0;
    }

    /// Union of two flag sets
    pub fn union(self, other: SrrFlags) -> Self {
        SrrFlags(self.0 | other.0)
    }

    /// Whether no flags are set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Bundle processing flags from the primary block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BundleFlags {
    pub is_fragment: bool,
    pub is_admin: bool,
    pub do_not_fragment: bool,
    pub custodial: bool,
    pub singleton_destination: bool,
    pub app_ack_request: bool,
}

/// Pack flags, class, and SRR set into the wire processing-flags word
///
/// Bits 0–5 are the boolean flags, bits 7–8 the class of service, bits
/// 14–18 the status-report requests.
pub fn pack_proc_flags(flags: BundleFlags, class: ClassOfService, srr: SrrFlags) -> u64 {
    let mut word = 0u64;
    if flags.is_fragment {
        word |= 1 << 0;
    }
    if flags.is_admin {
        word |= 1 << 1;
    }
    if flags.do_not_fragment {
        word |= 1 << 2;
    }
    if flags.custodial {
        word |= 1 << 3;
    }
    if flags.singleton_destination {
        word |= 1 << 4;
    }
    if flags.app_ack_request {
        word |= 1 << 5;
    }
    word |= (class.code() as u64) << 7;
    word |= (srr.0 as u64) << 14;
    word
}

/// Unpack the wire processing-flags word
///
/// An out-of-range class code decays to [`ClassOfService::Standard`];
/// the caller decides whether that is a malformation.
pub fn unpack_proc_flags(word: u64) -> (BundleFlags, ClassOfService, SrrFlags) {
    let flags = BundleFlags {
        is_fragment: word & (1 << 0) != 0,
        is_admin: word & (1 << 1) != 0,
        do_not_fragment: word & (1 << 2) != 0,
        custodial: word & (1 << 3) != 0,
        singleton_destination: word & (1 << 4) != 0,
        app_ack_request: word & (1 << 5) != 0,
    };
    let class =
        ClassOfService::from_code(((word >> 7) & 0x03) as u8).unwrap_or(ClassOfService::Standard);
    let srr = SrrFlags(((word >> 14) & 0x7f) as u8);
    (flags, class, srr)
}

/// Extended class of service
///
/// The ordinal orders traffic inside the expedited queue; the flow
/// label is passed through to the convergence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtendedCos {
    pub flags: u8,
    pub ordinal: u8,
    pub flow_label: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_flags_roundtrip() {
        let flags = BundleFlags {
            is_fragment: true,
            is_admin: false,
            do_not_fragment: true,
            custodial: true,
            singleton_destination: true,
            app_ack_request: false,
        };
        let srr = SrrFlags::RECEIVED.union(SrrFlags::DELETED);
        let word = pack_proc_flags(flags, ClassOfService::Expedited, srr);
        let (flags2, class2, srr2) = unpack_proc_flags(word);
        assert_eq!(flags, flags2);
        assert_eq!(class2, ClassOfService::Expedited);
        assert_eq!(srr, srr2);
    }

    #[test]
    fn test_class_codes() {
        for class in [
            ClassOfService::Bulk,
            ClassOfService::Standard,
            ClassOfService::Expedited,
        ] {
            assert_eq!(ClassOfService::from_code(class.code()), Some(class));
        }
        assert_eq!(ClassOfService::from_code(3), None);
    }

    #[test]
    fn test_srr_flags() {
        let mut srr = SrrFlags::none();
        assert!(srr.is_empty());
        srr.insert(SrrFlags::FORWARDED);
        assert!(srr.contains(SrrFlags::FORWARDED));
        assert!(!srr.contains(SrrFlags::DELIVERED));
    }
}
