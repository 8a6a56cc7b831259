//! Statistics tallies and the activity watch mask
//!
//! Tallies are (count, bytes) pairs kept per class of service, per
//! endpoint, per duct, and node-wide for the lifecycle states. The
//! watch mask selects which activity events are surfaced through
//! tracing as they happen.

use serde::{Deserialize, Serialize};

use waystation_core::ClassOfService;

/// A (count, bytes) accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Tally {
    pub count: u64,
    pub bytes: u64,
}

impl Tally {
    /// Record one event of the given size
    pub fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }
}

/// Tallies bucketed by class of service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CosTallies {
    pub bulk: Tally,
    pub standard: Tally,
    pub expedited: Tally,
}

impl CosTallies {
    pub fn add(&mut self, class: ClassOfService, bytes: u64) {
        self.get_mut(class).add(bytes);
    }

    pub fn get(&self, class: ClassOfService) -> Tally {
        match class {
            ClassOfService::Bulk => self.bulk,
            ClassOfService::Standard => self.standard,
            ClassOfService::Expedited => self.expedited,
        }
    }

    fn get_mut(&mut self, class: ClassOfService) -> &mut Tally {
        match class {
            ClassOfService::Bulk => &mut self.bulk,
            ClassOfService::Standard => &mut self.standard,
            ClassOfService::Expedited => &mut self.expedited,
        }
    }

    /// Sum across classes
    pub fn total(&self) -> Tally {
        Tally {
            count: self.bulk.count + self.standard.count + self.expedited.count,
            bytes: self.bulk.bytes + self.standard.bytes + self.expedited.bytes,
        }
    }
}

/// Per-endpoint lifecycle tallies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndpointStats {
    pub sourced: Tally,
    pub queued: Tally,
    pub abandoned: Tally,
    pub delivered: Tally,
}

/// Per-induct acquisition tallies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InductStats {
    pub received: Tally,
    pub malformed: Tally,
    pub inauthentic: Tally,
    pub congestive: Tally,
}

/// Per-outduct transmission tallies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutductStats {
    pub enqueued: Tally,
    pub dequeued: Tally,
}

/// Status-report emission counters, by asserted transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RptStats {
    pub received: u64,
    pub accepted: u64,
    pub forwarded: u64,
    pub delivered: u64,
    pub deleted: u64,
}

/// Custody transfer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CtStats {
    pub accepted: Tally,
    pub refused: Tally,
    pub released: Tally,
    pub timed_out: Tally,
}

/// Node-wide lifecycle state counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DbStateStats {
    pub queued_for_fwd: Tally,
    pub fwd_okay: Tally,
    pub fwd_failed: Tally,
    pub requeued_for_fwd: Tally,
    pub to_limbo: Tally,
    pub from_limbo: Tally,
    pub expired: Tally,
}

/// All node-wide statistics blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeStats {
    pub source: CosTallies,
    pub recv: CosTallies,
    pub discard: CosTallies,
    pub xmit: CosTallies,
    pub rpt: RptStats,
    pub ct: CtStats,
    pub db: DbStateStats,
}

/// Activity watch mask
///
/// Each bit selects one activity event; a set bit causes the event to
/// be emitted on the `waystation::watch` tracing target as it happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct WatchMask(pub u32);

impl WatchMask {
    pub const SOURCED: WatchMask = WatchMask(1);
    pub const FORWARD_QUEUED: WatchMask = WatchMask(2);
    pub const XMIT_QUEUED: WatchMask = WatchMask(4);
    pub const DEQUEUED: WatchMask = WatchMask(8);
    pub const DELIVERED: WatchMask = WatchMask(16);
    pub const CUSTODY_ACCEPTED: WatchMask = WatchMask(32);
    pub const ABANDONED: WatchMask = WatchMask(256);
    pub const EXPIRED: WatchMask = WatchMask(512);
    pub const CUSTODY_REFUSED: WatchMask = WatchMask(1024);
    pub const CUSTODY_TIMEOUT: WatchMask = WatchMask(2048);
    pub const TO_LIMBO: WatchMask = WatchMask(4096);
    pub const FROM_LIMBO: WatchMask = WatchMask(8192);

    /// Mask with every event selected
    pub fn all() -> Self {
        WatchMask(u32::MAX)
    }

    pub fn contains(self, flag: WatchMask) -> bool {
        self.0 & flag.0 != 0
    }
}

/// Emit a watch event if its bit is set
pub(crate) fn watch(mask: WatchMask, flag: WatchMask, event: &str, detail: &dyn std::fmt::Display) {
    if mask.contains(flag) {
        tracing::info!(target: "waystation::watch", event, %detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_accumulates() {
        let mut tally = Tally::default();
        tally.add(10);
        tally.add(5);
        assert_eq!(tally, Tally { count: 2, bytes: 15 });
    }

    #[test]
    fn test_cos_tallies_bucket() {
        let mut tallies = CosTallies::default();
        tallies.add(ClassOfService::Bulk, 4);
        tallies.add(ClassOfService::Expedited, 6);
        assert_eq!(tallies.get(ClassOfService::Bulk).bytes, 4);
        assert_eq!(tallies.get(ClassOfService::Standard).count, 0);
        assert_eq!(tallies.total().bytes, 10);
    }

    #[test]
    fn test_watch_mask() {
        let mask = WatchMask(WatchMask::EXPIRED.0 | WatchMask::TO_LIMBO.0);
        assert!(mask.contains(WatchMask::EXPIRED));
        assert!(!mask.contains(WatchMask::DELIVERED));
        assert!(WatchMask::all().contains(WatchMask::CUSTODY_TIMEOUT));
    }
}
