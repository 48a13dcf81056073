// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Slot selection for misses.
//!
//! Every slot carries the logical time it was last used. A miss takes a slot that has never held
//! an element if there is one, otherwise the idle slot used least recently, lowest index first on
//! ties. Handing out a slot always goes through an atomic claim of its idle hold count, so two
//! members can never walk away with the same slot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::backoff::Backoff;
use crate::counter::AccessCounters;
use crate::error::Result;
use crate::group::Communicator;
use crate::region::SharedRegion;

/// Owner word of a slot that holds no element.
pub(crate) const NO_OWNER: usize = 0;

#[derive(Debug)]
pub(crate) struct EvictionTracker {
    /// Logical time of the last access or release of each slot. Zero means never released.
    stamps: SharedRegion<AtomicU64>,
    clock: SharedRegion<AtomicU64>,
}

impl EvictionTracker {
    pub(crate) fn allocate(group: &dyn Communicator, slots: usize) -> Result<Self> {
        Ok(Self {
            stamps: SharedRegion::allocate(group, slots)?,
            clock: SharedRegion::allocate(group, 1)?,
        })
    }

    pub(crate) fn note_access(&self, slot: usize) {
        self.stamp(slot);
    }

    /// Records that the last hold on `slot` went away.
    pub(crate) fn note_release(&self, slot: usize) {
        self.stamp(slot);
    }

    fn stamp(&self, slot: usize) {
        let now = self.clock[0].fetch_add(1, Ordering::Relaxed) + 1;
        self.stamps[slot].fetch_max(now, Ordering::Relaxed);
    }

    /// Claims a slot for a new element, waiting while every slot is held.
    ///
    /// `owners` holds the owner word of every slot. The returned slot is claimed in `counters`;
    /// the caller must either install or abandon the claim.
    pub(crate) fn acquire_free_or_victim(&self, counters: &AccessCounters, owners: &[AtomicUsize], group: &dyn Communicator) -> usize {
        let mut backoff = Backoff::new();
        loop {
            if let Some(slot) = self.try_acquire(counters, owners) {
                return slot;
            }

            if group.is_aborted() {
                group.abort("another member of the group aborted while waiting for a free slot");
            }

            tracing::trace!(rank = group.rank(), "every slot is held, waiting for a release");
            backoff.snooze();
        }
    }

    fn try_acquire(&self, counters: &AccessCounters, owners: &[AtomicUsize]) -> Option<usize> {
        let slots = counters.slots();

        let unused = (0..slots).find(|&slot| owners[slot].load(Ordering::Acquire) == NO_OWNER && counters.is_idle(slot));
        if let Some(slot) = unused {
            if counters.try_claim(slot) {
                return Some(slot);
            }
        }

        // Claims can be lost to other members between the scan and the claim, so keep picking the
        // next best candidate until one sticks or nothing is idle.
        let mut skipped = Vec::new();
        loop {
            let victim = (0..slots)
                .filter(|slot| !skipped.contains(slot) && counters.is_idle(*slot))
                .min_by_key(|&slot| (self.stamps[slot].load(Ordering::Relaxed), slot))?;

            if counters.try_claim(victim) {
                return Some(victim);
            }

            skipped.push(victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{run_group, solo_group};

    struct Fixture {
        group: crate::group::NodeGroup,
        counters: AccessCounters,
        owners: SharedRegion<AtomicUsize>,
        tracker: EvictionTracker,
    }

    impl Fixture {
        fn new(slots: usize) -> Self {
            let group = solo_group();
            let counters = AccessCounters::allocate(&group, slots).expect("counters");
            let owners = SharedRegion::allocate(&group, slots).expect("owners");
            let tracker = EvictionTracker::allocate(&group, slots).expect("tracker");
            Self {
                group,
                counters,
                owners,
                tracker,
            }
        }

        /// Claims a slot and installs `key` in it with one hold.
        fn fill(&self, key: usize) -> usize {
            let slot = self.tracker.acquire_free_or_victim(&self.counters, &self.owners, &self.group);
            self.owners[slot].store(key + 1, Ordering::Release);
            self.counters.install(slot);
            self.tracker.note_access(slot);
            slot
        }

        fn release(&self, slot: usize) {
            assert_eq!(self.counters.release(slot), Ok(0));
            self.tracker.note_release(slot);
        }
    }

    #[test]
    fn unused_slots_come_first_in_index_order() {
        let fixture = Fixture::new(3);

        for expected in 0..3 {
            let slot = fixture.fill(expected);
            assert_eq!(slot, expected);
            fixture.release(slot);
        }
    }

    #[test]
    fn least_recently_released_slot_is_the_victim() {
        let fixture = Fixture::new(3);
        let slots: Vec<_> = (0..3).map(|key| fixture.fill(key)).collect();

        fixture.release(slots[1]);
        fixture.release(slots[2]);
        fixture.release(slots[0]);

        assert_eq!(fixture.fill(10), 1);
        assert_eq!(fixture.fill(11), 2);
        assert_eq!(fixture.fill(12), 0);
    }

    #[test]
    fn held_slots_are_never_victims() {
        let fixture = Fixture::new(2);
        let first = fixture.fill(0);
        let second = fixture.fill(1);
        fixture.release(second);

        // The first slot is older but still held.
        assert_eq!(fixture.fill(2), second);
        assert!(!fixture.counters.is_idle(first));
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let fixture = Fixture::new(3);
        for slot in 0..3 {
            fixture.owners[slot].store(slot + 1, Ordering::Relaxed);
        }

        assert_eq!(fixture.fill(7), 0);
        assert_eq!(fixture.fill(8), 1);
    }

    #[test]
    fn abandoned_slot_is_reused_first() {
        let fixture = Fixture::new(2);
        let slot = fixture.fill(0);
        fixture.release(slot);

        let claimed = fixture.tracker.acquire_free_or_victim(&fixture.counters, &fixture.owners, &fixture.group);
        assert_eq!(claimed, 1, "the never-used slot wins over the idle one");
        fixture.counters.abandon(claimed);

        assert_eq!(fixture.fill(5), 1);
    }

    #[test]
    fn waits_until_a_slot_is_released() {
        let results = run_group(2, |group| {
            let counters = AccessCounters::allocate(&group, 1).expect("counters");
            let owners = SharedRegion::<AtomicUsize>::allocate(&group, 1).expect("owners");
            let tracker = EvictionTracker::allocate(&group, 1).expect("tracker");

            if group.rank() == 0 {
                let slot = tracker.acquire_free_or_victim(&counters, &owners, &group);
                owners[slot].store(1, Ordering::Release);
                counters.install(slot);
                group.barrier();

                std::thread::sleep(std::time::Duration::from_millis(20));
                assert_eq!(counters.release(slot), Ok(0));
                tracker.note_release(slot);
                group.barrier();
                slot
            } else {
                group.barrier();
                let slot = tracker.acquire_free_or_victim(&counters, &owners, &group);
                counters.abandon(slot);
                group.barrier();
                slot
            }
        });

        assert_eq!(results, vec![0, 0]);
    }

    #[test]
    fn concurrent_acquires_get_distinct_slots() {
        let slots = run_group(4, |group| {
            let counters = AccessCounters::allocate(&group, 4).expect("counters");
            let owners = SharedRegion::<AtomicUsize>::allocate(&group, 4).expect("owners");
            let tracker = EvictionTracker::allocate(&group, 4).expect("tracker");

            let slot = tracker.acquire_free_or_victim(&counters, &owners, &group);
            group.barrier();
            slot
        });

        let mut sorted = slots;
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }
}
