// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The shared read-through cache.
//!
//! This module provides the main [`Cache`] type, its builder, and the [`Hold`] guard returned by
//! accesses.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::backoff::Backoff;
use crate::counter::{AccessCounters, CacheReport, Counter, Statistics, UsageCounters};
use crate::error::{BoxError, Error, Result};
use crate::eviction::{EvictionTracker, NO_OWNER};
use crate::group::Communicator;
use crate::reader::BackingReader;
use crate::region::{Shareable, SharedRegion};

/// Status word of a key nobody has read yet, or whose element was evicted.
const UNAVAILABLE: usize = 0;

/// Status word of a key that one member is currently reading from the backing store.
const READING: usize = 1;

/// Construction parameters every member must agree on, in header order.
const HEADER_WORDS: usize = 6;

/// Where the element for a key currently is.
///
/// Other members change the status concurrently, so any value returned by
/// [`Cache::status`] may already be out of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementStatus {
    /// Not in the cache. The next access reads it from the backing store.
    Unavailable,
    /// A member is reading the element from the backing store.
    Reading,
    /// Resident in the given slot.
    Available(usize),
}

impl ElementStatus {
    const fn decode(word: usize) -> Self {
        match word {
            UNAVAILABLE => Self::Unavailable,
            READING => Self::Reading,
            slot => Self::Available(slot - 2),
        }
    }

    const fn encode_slot(slot: usize) -> usize {
        slot + 2
    }
}

/// A read-through cache of fixed-size elements, shared by a group of processes on one node.
///
/// Every member of the group builds the cache with the same parameters and its own
/// [`BackingReader`]. All members then see the same resident elements: an element read by one
/// member is served from shared memory to every other member until it is evicted.
///
/// Each access returns a view of the element that stays valid until it is released, either by
/// dropping the [`Hold`] returned from [`access`](Self::access) or by calling
/// [`release`](Self::release) after [`access_ptr`](Self::access_ptr). A held element is never
/// evicted. When all slots are held, misses wait until another member releases one.
///
/// For every key at most one member reads from the backing store at a time; members that need the
/// same key meanwhile wait for that read to finish.
///
/// The cache is torn down collectively by [`shutdown`](Self::shutdown) or when it is dropped. An
/// element that is still held at that point aborts the whole group.
///
/// # Type Parameters
///
/// * `T` - The numeric type elements are made of.
/// * `R` - The backing reader.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use shmem_cache::{BackingReader, BoxError, Cache, NodeGroup};
///
/// struct Ramp;
///
/// impl BackingReader<f64> for Ramp {
///     fn element_size(&self) -> usize {
///         3
///     }
///
///     fn read(&self, key: usize, destination: &mut [f64]) -> Result<(), BoxError> {
///         for (offset, value) in destination.iter_mut().enumerate() {
///             *value = (key * 10 + offset) as f64;
///         }
///         Ok(())
///     }
/// }
///
/// # fn main() -> shmem_cache::Result<()> {
/// let group = Arc::new(NodeGroup::join(format!("doc-cache-{}", std::process::id()), 0, 1)?);
/// let cache = Cache::builder().number_of_keys(100).capacity(10).build(group, Ramp)?;
///
/// {
///     let element = cache.access(7)?;
///     assert_eq!(&*element, &[70.0, 71.0, 72.0]);
/// }
///
/// let report = cache.shutdown();
/// assert_eq!(report.statistics.fetches, 1);
/// # Ok(())
/// # }
/// ```
pub struct Cache<T, R> {
    group: Arc<dyn Communicator>,
    reader: R,
    element_size: usize,
    number_of_keys: usize,
    capacity: usize,
    serialize_reads: bool,
    /// Encoded [`ElementStatus`] of every key.
    status: SharedRegion<AtomicUsize>,
    /// Key + 1 of the element in every slot, or [`NO_OWNER`].
    owners: SharedRegion<AtomicUsize>,
    counters: AccessCounters,
    tracker: EvictionTracker,
    usage: UsageCounters,
    read_lock: SharedRegion<AtomicBool>,
    data: SharedRegion<T>,
    torn_down: bool,
}

impl<T, R> Cache<T, R>
where
    T: Shareable + Copy,
    R: BackingReader<T>,
{
    /// Creates a new builder for configuring a `Cache`.
    #[must_use]
    pub fn builder() -> CacheBuilder<T, R> {
        CacheBuilder::new()
    }

    /// Accesses the element for `key`, reading it from the backing store if it is not resident.
    ///
    /// The element stays resident until the returned [`Hold`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyOutOfRange`] for keys outside of `[0, number_of_keys)` and
    /// [`Error::Read`] if the backing reader fails.
    pub fn access(&self, key: usize) -> Result<Hold<'_, T, R>> {
        let slot = self.acquire(key)?;

        // SAFETY: The slot is held until the hold is dropped, nobody writes to a held slot.
        let element = unsafe { self.data.slice(slot * self.element_size, self.element_size) };

        Ok(Hold { cache: self, key, element })
    }

    /// Accesses the element for `key` like [`access`](Self::access), returning a raw pointer to
    /// its [`element_size`](Self::element_size) values.
    ///
    /// The pointer stays valid until [`release`](Self::release) is called for `key` and must only
    /// be used for reading. Every successful call must be matched by exactly one release before the
    /// cache is torn down.
    ///
    /// # Errors
    ///
    /// Same as [`access`](Self::access).
    pub fn access_ptr(&self, key: usize) -> Result<NonNull<T>> {
        let slot = self.acquire(key)?;

        // SAFETY: `slot < capacity`, so the offset stays inside the data region.
        let element = unsafe { self.data.as_ptr().add(slot * self.element_size) };

        // SAFETY: The data region is a non-null mapping and `element` points into it.
        Ok(unsafe { NonNull::new_unchecked(element) })
    }

    /// Releases one access to `key` obtained from [`access_ptr`](Self::access_ptr).
    ///
    /// Releasing a key that is not held is a usage error that aborts the group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyOutOfRange`] for keys outside of `[0, number_of_keys)`.
    pub fn release(&self, key: usize) -> Result<()> {
        self.check_key(key)?;
        self.release_held(key);
        Ok(())
    }

    /// Returns where the element for `key` currently is, without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyOutOfRange`] for keys outside of `[0, number_of_keys)`.
    pub fn status(&self, key: usize) -> Result<ElementStatus> {
        self.check_key(key)?;
        Ok(ElementStatus::decode(self.status[key].load(Ordering::Acquire)))
    }

    /// The number of `T` values in one element.
    #[must_use]
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    /// The number of keys, valid keys are `[0, number_of_keys)`.
    #[must_use]
    pub const fn number_of_keys(&self) -> usize {
        self.number_of_keys
    }

    /// The number of elements that can be resident at the same time.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// This member's rank in the group.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    /// The number of members in the group.
    #[must_use]
    pub fn size(&self) -> usize {
        self.group.size()
    }

    /// Returns the group-wide usage counts so far.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.usage.snapshot()
    }

    /// Tears the cache down and returns the final usage report. Collective.
    ///
    /// Rank 0 also logs the report. If any element is still held, the group is aborted.
    #[must_use = "dropping the cache tears it down as well, shutdown is only needed for the report"]
    pub fn shutdown(mut self) -> CacheReport {
        self.teardown()
    }

    fn check_key(&self, key: usize) -> Result<()> {
        if key < self.number_of_keys {
            Ok(())
        } else {
            Err(Error::KeyOutOfRange {
                key,
                number_of_keys: self.number_of_keys,
            })
        }
    }

    fn check_aborted(&self) {
        if self.group.is_aborted() {
            self.group.abort("another member of the group aborted");
        }
    }

    /// Takes a hold on the slot of `key`, fetching the element if needed, and returns the slot.
    fn acquire(&self, key: usize) -> Result<usize> {
        self.check_key(key)?;
        self.usage.record(Counter::Accesses);

        let mut backoff = Backoff::new();
        let mut waited = false;
        loop {
            match ElementStatus::decode(self.status[key].load(Ordering::Acquire)) {
                ElementStatus::Available(slot) => {
                    if self.try_hold(key, slot) {
                        tracing::trace!(key, slot, "cache hit");
                        return Ok(slot);
                    }
                }
                ElementStatus::Unavailable => {
                    if self.status[key]
                        .compare_exchange(UNAVAILABLE, READING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::trace!(key, "cache miss");
                        return self.fetch(key);
                    }

                    // Someone else claimed it first, look again right away.
                    continue;
                }
                ElementStatus::Reading => {
                    if !waited {
                        waited = true;
                        self.usage.record(Counter::ContendedWaits);
                        tracing::trace!(key, "waiting for another member's read");
                    }
                }
            }

            self.check_aborted();
            backoff.snooze();
        }
    }

    /// Holds `slot` if it still contains `key`.
    fn try_hold(&self, key: usize, slot: usize) -> bool {
        if !self.counters.try_hold(slot) {
            return false;
        }

        // The slot may have been refilled between reading the status and taking the hold.
        let still_ours = self.status[key].load(Ordering::Acquire) == ElementStatus::encode_slot(slot)
            && self.owners[slot].load(Ordering::Acquire) == key + 1;

        if still_ours {
            self.tracker.note_access(slot);
        } else {
            self.counters.unhold(slot);
        }

        still_ours
    }

    /// Reads `key` into a fresh slot. The caller has moved the key to [`READING`].
    fn fetch(&self, key: usize) -> Result<usize> {
        let slot = self.tracker.acquire_free_or_victim(&self.counters, &self.owners, &*self.group);
        let pending = PendingFetch {
            status: &self.status[key],
            counters: &self.counters,
            slot,
            completed: false,
        };

        let previous = self.owners[slot].swap(NO_OWNER, Ordering::AcqRel);
        if previous != NO_OWNER {
            let evicted = previous - 1;
            let _ = self.status[evicted].compare_exchange(
                ElementStatus::encode_slot(slot),
                UNAVAILABLE,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            self.usage.record(Counter::Evictions);
            tracing::debug!(key = evicted, slot, "evicted element");
        }

        if let Err(source) = self.read_into(key, slot) {
            tracing::warn!(key, slot, error = %source, "reading element from the backing store failed");
            drop(pending);
            return Err(Error::Read { key, source });
        }

        // Publish in an order that lets holders validate: hold first, then owner, then status.
        pending.complete();
        self.counters.install(slot);
        self.owners[slot].store(key + 1, Ordering::Release);
        self.status[key].store(ElementStatus::encode_slot(slot), Ordering::Release);

        self.usage.record(Counter::Fetches);
        self.tracker.note_access(slot);
        tracing::debug!(key, slot, rank = self.group.rank(), "fetched element");

        Ok(slot)
    }

    fn read_into(&self, key: usize, slot: usize) -> std::result::Result<(), BoxError> {
        let _lock = self
            .serialize_reads
            .then(|| ReadLock::acquire(&self.read_lock[0], &*self.group));

        let start = self.data.as_ptr().wrapping_add(slot * self.element_size);

        // SAFETY: The element lies inside the data region. The slot is claimed by this member, so
        // nobody else reads or writes it until the new owner is published.
        let destination = unsafe { std::slice::from_raw_parts_mut(start, self.element_size) };
        self.reader.read(key, destination)
    }

    fn release_held(&self, key: usize) {
        let ElementStatus::Available(slot) = ElementStatus::decode(self.status[key].load(Ordering::Acquire)) else {
            self.group.abort(&format!("key {key} was released but is not held"));
        };

        match self.counters.release(slot) {
            Ok(0) => {
                self.tracker.note_release(slot);
                tracing::trace!(key, slot, "slot became idle");
            }
            Ok(_) => {}
            Err(count) => self
                .group
                .abort(&format!("key {key} was released but its slot {slot} has {count} holds")),
        }
    }
}

impl<T, R> Cache<T, R> {
    fn report(&self) -> CacheReport {
        CacheReport {
            number_of_keys: self.number_of_keys,
            capacity: self.capacity,
            statistics: self.usage.snapshot(),
        }
    }

    fn teardown(&mut self) -> CacheReport {
        self.torn_down = true;
        self.group.barrier();

        if let Some(&(slot, count)) = self.counters.busy_slots().first() {
            self.group.abort(&format!(
                "slot {slot} still has {count} holds at teardown, every access must be released first"
            ));
        }

        let report = self.report();
        self.group.barrier();

        if self.group.rank() == 0 {
            tracing::info!(
                keys = report.number_of_keys,
                buffered = report.capacity,
                accesses = report.statistics.accesses,
                fetches = report.statistics.fetches,
                contended_waits = report.statistics.contended_waits,
                evictions = report.statistics.evictions,
                "{report}"
            );
        }

        report
    }
}

impl<T, R> Drop for Cache<T, R> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }

        // Unwinding members cannot meet the others at the teardown barriers, so release them.
        if std::thread::panicking() {
            tracing::error!(rank = self.group.rank(), "cache dropped while panicking, aborting the group");
            self.group.mark_aborted();
            return;
        }

        let _ = self.teardown();
    }
}

impl<T, R> fmt::Debug for Cache<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("group", &self.group)
            .field("element_size", &self.element_size)
            .field("number_of_keys", &self.number_of_keys)
            .field("capacity", &self.capacity)
            .field("serialize_reads", &self.serialize_reads)
            .finish_non_exhaustive()
    }
}

/// An element held in the cache, released when dropped.
///
/// Dereferences to the element's values.
pub struct Hold<'a, T, R>
where
    T: Shareable + Copy,
    R: BackingReader<T>,
{
    cache: &'a Cache<T, R>,
    key: usize,
    element: &'a [T],
}

impl<T, R> Hold<'_, T, R>
where
    T: Shareable + Copy,
    R: BackingReader<T>,
{
    /// The key of the held element.
    #[must_use]
    pub const fn key(&self) -> usize {
        self.key
    }
}

impl<T, R> Deref for Hold<'_, T, R>
where
    T: Shareable + Copy,
    R: BackingReader<T>,
{
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.element
    }
}

impl<T, R> Drop for Hold<'_, T, R>
where
    T: Shareable + Copy,
    R: BackingReader<T>,
{
    fn drop(&mut self) {
        self.cache.release_held(self.key);
    }
}

impl<T, R> fmt::Debug for Hold<'_, T, R>
where
    T: Shareable + Copy + fmt::Debug,
    R: BackingReader<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hold").field("key", &self.key).field("element", &self.element).finish()
    }
}

/// Reverts a claimed key and slot unless the fetch completes, also when the reader panics.
struct PendingFetch<'a> {
    status: &'a AtomicUsize,
    counters: &'a AccessCounters,
    slot: usize,
    completed: bool,
}

impl PendingFetch<'_> {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.counters.abandon(self.slot);
            self.status.store(UNAVAILABLE, Ordering::Release);
        }
    }
}

/// Serializes backing store reads across the group while alive.
struct ReadLock<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ReadLock<'a> {
    fn acquire(flag: &'a AtomicBool, group: &dyn Communicator) -> Self {
        let mut backoff = Backoff::new();
        while flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if group.is_aborted() {
                group.abort("another member of the group aborted while waiting to read");
            }
            backoff.snooze();
        }

        Self { flag }
    }
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Builder for configuring a [`Cache`].
///
/// Every member of the group must configure the builder identically. Rank 0's parameters are
/// compared with everybody else's during [`build`](Self::build), and a mismatch aborts the group.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use shmem_cache::{BackingReader, BoxError, Cache, NodeGroup};
///
/// struct Zeros;
///
/// impl BackingReader<u32> for Zeros {
///     fn element_size(&self) -> usize {
///         16
///     }
///
///     fn read(&self, _key: usize, destination: &mut [u32]) -> Result<(), BoxError> {
///         destination.fill(0);
///         Ok(())
///     }
/// }
///
/// # fn main() -> shmem_cache::Result<()> {
/// let group = Arc::new(NodeGroup::join(format!("doc-builder-{}", std::process::id()), 0, 1)?);
/// let cache = Cache::builder()
///     .number_of_keys(1000)
///     .capacity(64)
///     .serialize_reads(true)
///     .verbosity(2)
///     .build(group, Zeros)?;
///
/// assert_eq!(cache.element_size(), 16);
/// assert_eq!(cache.capacity(), 64);
/// # Ok(())
/// # }
/// ```
pub struct CacheBuilder<T, R> {
    number_of_keys: usize,
    capacity: usize,
    element_size: Option<usize>,
    serialize_reads: bool,
    verbosity: u8,
    _marker: PhantomData<fn() -> (T, R)>,
}

impl<T, R> Default for CacheBuilder<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> CacheBuilder<T, R> {
    /// Creates a new builder with default settings.
    ///
    /// You must set [`number_of_keys()`](Self::number_of_keys) and
    /// [`capacity()`](Self::capacity) before [`build()`](Self::build).
    ///
    /// Defaults:
    /// - `element_size`: the reader's element size
    /// - `serialize_reads`: `false`
    /// - `verbosity`: 0
    #[must_use]
    pub const fn new() -> Self {
        Self {
            number_of_keys: 0,
            capacity: 0,
            element_size: None,
            serialize_reads: false,
            verbosity: 0,
            _marker: PhantomData,
        }
    }

    /// Sets the number of keys. Valid keys are `[0, number_of_keys)`.
    #[must_use]
    pub const fn number_of_keys(mut self, number_of_keys: usize) -> Self {
        self.number_of_keys = number_of_keys;
        self
    }

    /// Sets how many elements can be resident at the same time.
    ///
    /// A capacity above the number of keys is reduced to it. See
    /// [`recommended_capacity`](crate::recommended_capacity) for a way to derive it from the
    /// node's memory.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the number of values per element.
    ///
    /// Optional; if set, it must match the reader's [`element_size`](BackingReader::element_size).
    #[must_use]
    pub const fn element_size(mut self, element_size: usize) -> Self {
        self.element_size = Some(element_size);
        self
    }

    /// Allows only one member of the group at a time to read from the backing store.
    ///
    /// Use this for stores that do not tolerate concurrent readers.
    #[must_use]
    pub const fn serialize_reads(mut self, serialize_reads: bool) -> Self {
        self.serialize_reads = serialize_reads;
        self
    }

    /// Sets how much the cache logs. At 2 and above, rank 0 logs the configuration on construction.
    #[must_use]
    pub const fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }
}

impl<T, R> CacheBuilder<T, R>
where
    T: Shareable + Copy,
    R: BackingReader<T>,
{
    /// Builds the cache in shared memory. Collective.
    ///
    /// Returns once every member of `group` has built its cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the number of keys, the capacity or the element
    /// size is zero, or if the element size differs from the reader's, and [`Error::SharedMemory`]
    /// if the shared state cannot be allocated.
    pub fn build(self, group: Arc<dyn Communicator>, reader: R) -> Result<Cache<T, R>> {
        let communicator = &*group;
        let reader_size = reader.element_size();

        // Agree on the raw parameters first so that every member reaches the same validation result.
        check_uniform(
            communicator,
            [
                self.element_size.unwrap_or(reader_size),
                reader_size,
                self.number_of_keys,
                self.capacity,
                usize::from(self.serialize_reads),
                size_of::<T>(),
            ],
        )?;

        let (element_size, capacity) = self.validate(reader_size)?;

        let data_len = capacity
            .checked_mul(element_size)
            .ok_or_else(|| Error::invalid_configuration(format!("{capacity} elements of {element_size} values do not fit in memory")))?;

        let status = SharedRegion::allocate(communicator, self.number_of_keys)?;
        let owners = SharedRegion::allocate(communicator, capacity)?;
        let counters = AccessCounters::allocate(communicator, capacity)?;
        let tracker = EvictionTracker::allocate(communicator, capacity)?;
        let usage = UsageCounters::allocate(communicator)?;
        let read_lock = SharedRegion::allocate(communicator, 1)?;
        let data = SharedRegion::allocate(communicator, data_len)?;

        if self.verbosity >= 2 && communicator.rank() == 0 {
            tracing::info!(
                element_size,
                number_of_keys = self.number_of_keys,
                buffered_elements = capacity,
                serialize_reads = self.serialize_reads,
                "constructed shared cache"
            );
        }

        tracing::debug!(rank = communicator.rank(), size = communicator.size(), "joined shared cache");

        Ok(Cache {
            group,
            reader,
            element_size,
            number_of_keys: self.number_of_keys,
            capacity,
            serialize_reads: self.serialize_reads,
            status,
            owners,
            counters,
            tracker,
            usage,
            read_lock,
            data,
            torn_down: false,
        })
    }

    /// Returns the effective element size and capacity.
    fn validate(&self, reader_size: usize) -> Result<(usize, usize)> {
        if self.number_of_keys == 0 {
            return Err(Error::invalid_configuration("the cache needs at least one key"));
        }

        if self.capacity == 0 {
            return Err(Error::invalid_configuration("the cache needs room for at least one element"));
        }

        let element_size = self.element_size.unwrap_or(reader_size);
        if element_size == 0 {
            return Err(Error::invalid_configuration("elements must hold at least one value"));
        }

        if element_size != reader_size {
            return Err(Error::invalid_configuration(format!(
                "element size is {element_size} but the reader produces elements of {reader_size}"
            )));
        }

        let capacity = if self.capacity > self.number_of_keys {
            tracing::debug!(
                capacity = self.capacity,
                number_of_keys = self.number_of_keys,
                "capacity exceeds the number of keys, reducing it"
            );
            self.number_of_keys
        } else {
            self.capacity
        };

        Ok((element_size, capacity))
    }
}

impl<T, R> fmt::Debug for CacheBuilder<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("number_of_keys", &self.number_of_keys)
            .field("capacity", &self.capacity)
            .field("element_size", &self.element_size)
            .field("serialize_reads", &self.serialize_reads)
            .field("verbosity", &self.verbosity)
            .finish()
    }
}

/// Aborts the whole group unless every member passes the same `parameters` as rank 0. Collective.
fn check_uniform(group: &dyn Communicator, parameters: [usize; HEADER_WORDS]) -> Result<()> {
    // The parameters, followed by the number of members that disagree with them.
    let header = SharedRegion::<AtomicUsize>::allocate(group, HEADER_WORDS + 1)?;
    let (published, mismatches) = header.split_at(HEADER_WORDS);

    if group.rank() == 0 {
        for (word, value) in published.iter().zip(parameters) {
            word.store(value, Ordering::Relaxed);
        }
    }

    group.barrier();

    let expected: Vec<usize> = published.iter().map(|word| word.load(Ordering::Relaxed)).collect();
    if expected != parameters {
        tracing::error!(rank = group.rank(), ?parameters, ?expected, "cache parameters differ from rank 0");
        mismatches[0].fetch_add(1, Ordering::Relaxed);
    }

    group.barrier();

    let disagreeing = mismatches[0].load(Ordering::Relaxed);
    if disagreeing > 0 {
        group.abort(&format!(
            "{disagreeing} members built the cache with parameters that differ from rank 0"
        ));
    }

    Ok(())
}
