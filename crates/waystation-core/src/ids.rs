//! Bundle identity
//!
//! A bundle is identified by its source EID, creation timestamp, and
//! fragment offset. The hash key adds the fragment length so that
//! distinct fragments of one source bundle key separately.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::eid::Eid;

/// Unix seconds of the BP epoch, 2000-01-01T00:00:00Z
pub const BP_EPOCH_UNIX_SECS: i64 = 946_684_800;

/// Creation timestamp: seconds since the BP epoch plus a disambiguation
/// counter for bundles created within the same second (and for nodes
/// without a synchronized clock)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CreationTimestamp {
    pub seconds: u64,
    pub count: u32,
}

impl CreationTimestamp {
    pub fn new(seconds: u64, count: u32) -> Self {
        Self { seconds, count }
    }

    /// Convert unix seconds to BP-epoch seconds, clamping pre-epoch times
    pub fn seconds_from_unix(unix_secs: i64) -> u64 {
        (unix_secs - BP_EPOCH_UNIX_SECS).max(0) as u64
    }
}

impl fmt::Display for CreationTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.seconds, self.count)
    }
}

/// Identity of a bundle
///
/// For non-fragments and the first fragment, `fragment_offset` is zero;
/// for later fragments it is the payload's offset into the original ADU.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleId {
    pub source: Eid,
    pub creation: CreationTimestamp,
    pub fragment_offset: u64,
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}+{}",
            self.source, self.creation, self.fragment_offset
        )
    }
}

/// Hash key of a bundle: identity plus fragment length
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleKey {
    pub source: Eid,
    pub creation: CreationTimestamp,
    pub fragment_offset: u64,
    pub fragment_length: u64,
}

impl BundleKey {
    pub fn new(id: &BundleId, fragment_length: u64) -> Self {
        Self {
            source: id.source.clone(),
            creation: id.creation,
            fragment_offset: id.fragment_offset,
            fragment_length,
        }
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}+{}/{}",
            self.source, self.creation, self.fragment_offset, self.fragment_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_conversion() {
        assert_eq!(CreationTimestamp::seconds_from_unix(BP_EPOCH_UNIX_SECS), 0);
        assert_eq!(
            CreationTimestamp::seconds_from_unix(BP_EPOCH_UNIX_SECS + 60),
            60
        );
        // Pre-epoch clamps rather than wrapping.
        assert_eq!(CreationTimestamp::seconds_from_unix(0), 0);
    }

    #[test]
    fn test_key_distinguishes_fragments() {
        let id = BundleId {
            source: Eid::ipn(5, 1),
            creation: CreationTimestamp::new(100, 0),
            fragment_offset: 0,
        };
        let whole = BundleKey::new(&id, 10);
        let fragment = BundleKey::new(&id, 4);
        assert_ne!(whole, fragment);
    }
}
