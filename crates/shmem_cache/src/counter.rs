// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-slot hold counts and group-wide usage statistics.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::error::Result;
use crate::group::Communicator;
use crate::region::SharedRegion;

/// Marks a slot that one process has claimed for (re)filling. No holder can observe it as a count.
const CLAIMED: i64 = i64::MIN;

/// The number of live holds on every slot.
///
/// A slot with a positive count is in use and must not be reassigned. Zero means idle and eligible
/// for eviction. A claimed slot carries a negative sentinel until its new element is published.
#[derive(Debug)]
pub(crate) struct AccessCounters {
    counts: SharedRegion<AtomicI64>,
}

impl AccessCounters {
    pub(crate) fn allocate(group: &dyn Communicator, slots: usize) -> Result<Self> {
        Ok(Self {
            counts: SharedRegion::allocate(group, slots)?,
        })
    }

    pub(crate) fn slots(&self) -> usize {
        self.counts.len()
    }

    /// Adds a hold unless the slot is claimed for refilling.
    pub(crate) fn try_hold(&self, slot: usize) -> bool {
        self.counts[slot]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| (count >= 0).then_some(count + 1))
            .is_ok()
    }

    /// Takes back a hold added by [`try_hold`](Self::try_hold) that turned out to be on the wrong slot.
    pub(crate) fn unhold(&self, slot: usize) {
        self.counts[slot].fetch_sub(1, Ordering::AcqRel);
    }

    /// Drops one hold and returns the number of holds left.
    ///
    /// Returns the current count as an error if the slot is not held.
    pub(crate) fn release(&self, slot: usize) -> std::result::Result<i64, i64> {
        self.counts[slot]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| (count > 0).then_some(count - 1))
            .map(|previous| previous - 1)
    }

    /// Claims an idle slot for refilling. At most one process wins a given idle period.
    pub(crate) fn try_claim(&self, slot: usize) -> bool {
        self.counts[slot]
            .compare_exchange(0, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Turns a claim into the claimant's own hold.
    pub(crate) fn install(&self, slot: usize) {
        self.counts[slot].store(1, Ordering::Release);
    }

    /// Gives up a claim, leaving the slot idle.
    pub(crate) fn abandon(&self, slot: usize) {
        self.counts[slot].store(0, Ordering::Release);
    }

    pub(crate) fn is_idle(&self, slot: usize) -> bool {
        self.counts[slot].load(Ordering::Acquire) == 0
    }

    /// Slots that are held or claimed, with their raw counts.
    pub(crate) fn busy_slots(&self) -> Vec<(usize, i64)> {
        self.counts
            .iter()
            .enumerate()
            .map(|(slot, count)| (slot, count.load(Ordering::Acquire)))
            .filter(|&(_, count)| count != 0)
            .collect()
    }
}

/// A group-wide usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    Accesses,
    Fetches,
    ContendedWaits,
    Evictions,
}

impl Counter {
    const COUNT: usize = 4;

    const fn index(self) -> usize {
        self as usize
    }
}

/// Monotonic usage counters shared by the group, for reporting only.
#[derive(Debug)]
pub(crate) struct UsageCounters {
    values: SharedRegion<AtomicU64>,
}

impl UsageCounters {
    pub(crate) fn allocate(group: &dyn Communicator) -> Result<Self> {
        Ok(Self {
            values: SharedRegion::allocate(group, Counter::COUNT)?,
        })
    }

    pub(crate) fn record(&self, counter: Counter) {
        self.values[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        let value = |counter: Counter| self.values[counter.index()].load(Ordering::Relaxed);
        Statistics {
            accesses: value(Counter::Accesses),
            fetches: value(Counter::Fetches),
            contended_waits: value(Counter::ContendedWaits),
            evictions: value(Counter::Evictions),
        }
    }
}

/// Group-wide usage counts of a cache.
///
/// Counts are cumulative over all members since construction. A snapshot taken while other members
/// are active may be slightly out of date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Calls to `access`, including ones that had to fetch.
    pub accesses: u64,
    /// Successful reads from the backing store.
    pub fetches: u64,
    /// Accesses that had to wait for another member's fetch of the same key.
    pub contended_waits: u64,
    /// Elements displaced to make room for another key.
    pub evictions: u64,
}

impl Statistics {
    /// Fetches per access.
    #[must_use]
    pub fn fetch_ratio(&self) -> f64 {
        ratio(self.fetches, self.accesses)
    }

    /// Contended waits per access.
    #[must_use]
    pub fn waits_per_access(&self) -> f64 {
        ratio(self.contended_waits, self.accesses)
    }

    /// Contended waits per fetch.
    #[must_use]
    pub fn waits_per_fetch(&self) -> f64 {
        ratio(self.contended_waits, self.fetches)
    }

    /// Evictions per access.
    #[must_use]
    pub fn evictions_per_access(&self) -> f64 {
        ratio(self.evictions, self.accesses)
    }

    /// Evictions per fetch.
    #[must_use]
    pub fn evictions_per_fetch(&self) -> f64 {
        ratio(self.evictions, self.fetches)
    }
}

/// The summary a cache produces when it is torn down.
///
/// Its [`Display`](fmt::Display) form is what rank 0 logs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheReport {
    /// Keys the cache was constructed with.
    pub number_of_keys: usize,
    /// Slots available for resident elements.
    pub capacity: usize,
    /// Final usage counts.
    pub statistics: Statistics,
}

impl CacheReport {
    /// The share of all keys that fit in the cache at once.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "ratios are diagnostic only")]
    pub fn buffered_ratio(&self) -> f64 {
        if self.number_of_keys == 0 {
            0.0
        } else {
            self.capacity as f64 / self.number_of_keys as f64
        }
    }
}

impl fmt::Display for CacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = &self.statistics;
        writeln!(f, "shared cache statistics")?;
        writeln!(f, "  keys: {}", self.number_of_keys)?;
        writeln!(f, "  buffered elements: {} (ratio {:.4})", self.capacity, self.buffered_ratio())?;
        writeln!(f, "  accesses: {}", stats.accesses)?;
        writeln!(f, "  fetches: {} (ratio {:.4})", stats.fetches, stats.fetch_ratio())?;
        writeln!(
            f,
            "  contended waits: {} ({:.4} per access, {:.4} per fetch)",
            stats.contended_waits,
            stats.waits_per_access(),
            stats.waits_per_fetch()
        )?;
        write!(
            f,
            "  evictions: {} ({:.4} per access, {:.4} per fetch)",
            stats.evictions,
            stats.evictions_per_access(),
            stats.evictions_per_fetch()
        )
    }
}

#[expect(clippy::cast_precision_loss, reason = "ratios are diagnostic only")]
fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
