// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cooperating process groups.
//!
//! The cache never talks to its peers directly. Everything it needs from the group of processes
//! sharing a node is behind [`Communicator`]: identity (rank and size), a collective barrier,
//! collective shared memory allocation, and a group-wide abort for unrecoverable usage errors.
//! [`NodeGroup`] implements it with POSIX named shared memory.

use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::segment::Segment;

/// The services a cache needs from the group of processes that share it.
///
/// Every method documented as collective must be called by every member of the group, in the
/// same order, with the same arguments. Calling collective methods non-uniformly is a usage error
/// with undefined results (typically a deadlock).
pub trait Communicator: Send + Sync + fmt::Debug {
    /// The index of this process within the group, in `[0, size)`.
    fn rank(&self) -> usize;

    /// The number of processes in the group.
    fn size(&self) -> usize;

    /// Blocks until every member of the group has entered the barrier. Collective.
    ///
    /// All shared memory writes made by any member before the barrier are visible to every
    /// member after it.
    fn barrier(&self);

    /// Allocates `bytes` of zeroed memory visible to every member of the group. Collective.
    ///
    /// Either every member receives a mapping of the same memory, or every member receives an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the memory cannot be allocated or mapped by any member.
    fn allocate(&self, bytes: usize) -> Result<Segment>;

    /// Returns `true` if any member of the group has aborted.
    fn is_aborted(&self) -> bool;

    /// Signals every other member to terminate without terminating this process.
    ///
    /// Used by members that are already unwinding and can no longer take part in collective
    /// operations.
    fn mark_aborted(&self);

    /// Terminates this process and signals every other member to terminate as well.
    ///
    /// Used when shared state can no longer be trusted, e.g. when an element is still held
    /// while the cache is torn down.
    fn abort(&self, reason: &str) -> !;
}

/// Group bookkeeping shared by all members, laid over the control segment.
///
/// All-zero is the initial state.
#[repr(C, align(64))]
struct Control {
    /// Members that entered the current barrier.
    arrived: AtomicU64,
    /// Completed barriers; waiters spin until it changes.
    generation: AtomicU64,
    /// Members that reported a failure in the current agreement round.
    failures: AtomicU64,
    /// Non-zero once any member has aborted.
    aborted: AtomicU64,
}

/// A group of processes on one node, coordinated through POSIX named shared memory.
///
/// Every member joins with the same group name, its own rank and the common group size; the
/// launcher that starts the processes is responsible for handing these out. Members may be
/// separate processes or threads standing in for them: each member maps the shared memory on its
/// own.
///
/// The name identifies the group's shared memory objects, so it must be unique per job on the
/// node. Names left behind by a crashed job are detected when segments are created and reported
/// as errors to all members.
///
/// # Examples
///
/// ```
/// use shmem_cache::{Communicator, NodeGroup};
///
/// # fn main() -> shmem_cache::Result<()> {
/// let name = format!("doc-group-{}", std::process::id());
/// let group = NodeGroup::join(&name, 0, 1)?;
/// assert_eq!(group.rank(), 0);
/// assert_eq!(group.size(), 1);
/// group.barrier();
/// # Ok(())
/// # }
/// ```
pub struct NodeGroup {
    name: String,
    rank: usize,
    size: usize,
    control: Segment,
    next_segment: AtomicU64,
}

impl NodeGroup {
    /// Joins the group `name` as member `rank` of `size`. Collective.
    ///
    /// Returns once every member has joined.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `size` is zero, `rank` is not below `size`,
    /// or `name` is empty or contains a `/`, and [`Error::SharedMemory`] if the control segment
    /// cannot be mapped.
    pub fn join(name: impl Into<String>, rank: usize, size: usize) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(Error::invalid_configuration(format!(
                "group name {name:?} must be non-empty and must not contain '/'"
            )));
        }

        if size == 0 {
            return Err(Error::invalid_configuration("a group needs at least one member"));
        }

        if rank >= size {
            return Err(Error::invalid_configuration(format!("rank {rank} is outside of a group of {size}")));
        }

        let control_name = format!("/{name}.ctl");
        let control = Segment::open_or_create(&control_name, size_of::<Control>())?;

        let group = Self {
            name,
            rank,
            size,
            control,
            next_segment: AtomicU64::new(0),
        };

        tracing::debug!(group = %group.name, rank, size, "joining node group");
        group.barrier();

        // Everyone has mapped the control block, the name is no longer needed.
        if rank == 0 {
            if let Err(error) = Segment::unlink(&control_name) {
                tracing::warn!(group = %group.name, %error, "failed to unlink group control segment");
            }
        }

        Ok(group)
    }

    /// The name the group was joined with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn control(&self) -> &Control {
        // SAFETY: The control segment is at least `size_of::<Control>()` bytes, page aligned, and
        // lives as long as `self`. `Control` only contains atomics, for which all-zero is valid.
        unsafe { &*self.control.as_ptr().cast::<Control>() }
    }

    /// Collective logical AND of `ok` over all members.
    fn all_succeeded(&self, ok: bool) -> bool {
        let control = self.control();
        if !ok {
            control.failures.fetch_add(1, Ordering::Relaxed);
        }

        self.barrier();
        let failures = control.failures.load(Ordering::Relaxed);
        self.barrier();

        // Nobody touches the counter again before the next round's first barrier, which rank 0
        // only reaches after this reset.
        if self.rank == 0 {
            control.failures.store(0, Ordering::Relaxed);
        }

        failures == 0
    }
}

impl Communicator for NodeGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        let control = self.control();
        let generation = control.generation.load(Ordering::Acquire);

        let arrived = control.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.size as u64 {
            // Reset before releasing the waiters, they may re-enter immediately.
            control.arrived.store(0, Ordering::Relaxed);
            control.generation.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let mut backoff = Backoff::new();
        while control.generation.load(Ordering::Acquire) == generation {
            // A peer may abort right after completing this barrier; only an unfinished one counts.
            if self.is_aborted() && control.generation.load(Ordering::Acquire) == generation {
                self.abort("another member of the group aborted");
            }
            backoff.snooze();
        }
    }

    fn allocate(&self, bytes: usize) -> Result<Segment> {
        let index = self.next_segment.fetch_add(1, Ordering::Relaxed);
        let segment_name = format!("/{}.{index}", self.name);

        let created = (self.rank == 0).then(|| Segment::create(&segment_name, bytes));
        self.barrier();

        let local = created.unwrap_or_else(|| Segment::open(&segment_name, bytes));
        let agreed = self.all_succeeded(local.is_ok());

        if self.rank == 0 && local.is_ok() {
            if let Err(error) = Segment::unlink(&segment_name) {
                tracing::warn!(group = %self.name, segment = %segment_name, %error, "failed to unlink segment");
            }
        }

        match local {
            Ok(segment) if agreed => {
                tracing::debug!(group = %self.name, rank = self.rank, segment = %segment_name, bytes, "mapped shared segment");
                Ok(segment)
            }
            Ok(_) => Err(Error::invalid_configuration(format!(
                "another member of group {} failed to map segment {segment_name}",
                self.name
            ))),
            Err(error) => Err(error),
        }
    }

    fn is_aborted(&self) -> bool {
        self.control().aborted.load(Ordering::Acquire) != 0
    }

    fn mark_aborted(&self) {
        self.control().aborted.store(1, Ordering::Release);
    }

    fn abort(&self, reason: &str) -> ! {
        self.mark_aborted();
        tracing::error!(group = %self.name, rank = self.rank, reason, "aborting node group");
        std::process::abort()
    }
}

impl fmt::Debug for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGroup")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testing::{run_group, unique_name};

    #[test]
    fn join_validates_membership() {
        assert!(matches!(NodeGroup::join("g", 0, 0), Err(Error::InvalidConfiguration(_))));
        assert!(matches!(NodeGroup::join("g", 2, 2), Err(Error::InvalidConfiguration(_))));
        assert!(matches!(NodeGroup::join("", 0, 1), Err(Error::InvalidConfiguration(_))));
        assert!(matches!(NodeGroup::join("a/b", 0, 1), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn single_member_group() {
        let name = unique_name("solo");
        let group = NodeGroup::join(name.trim_start_matches('/'), 0, 1).expect("join");
        assert_eq!(group.rank(), 0);
        assert_eq!(group.size(), 1);
        assert!(!group.is_aborted());

        group.barrier();
        group.barrier();
    }

    #[test]
    fn marked_abort_is_visible_to_every_member() {
        let seen = run_group(3, |group| {
            group.barrier();
            if group.rank() == 2 {
                group.mark_aborted();
            }

            // Nobody waits from here on, so nobody terminates.
            while !group.is_aborted() {
                std::thread::yield_now();
            }
            true
        });

        assert_eq!(seen, vec![true; 3]);
    }

    #[test]
    fn barrier_orders_all_members() {
        let entered = AtomicUsize::new(0);

        let seen = run_group(4, |group| {
            for round in 1..=3 {
                entered.fetch_add(1, Ordering::SeqCst);
                group.barrier();
                let observed = entered.load(Ordering::SeqCst);
                assert!(observed >= round * 4, "round {round} saw only {observed} arrivals");
                group.barrier();
            }
            group.rank()
        });

        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn allocation_is_shared_between_members() {
        let sums = run_group(3, |group| {
            let segment = group.allocate(64).expect("allocate");
            let words = segment.as_ptr().cast::<AtomicU64>();

            // SAFETY: The segment holds 8 page-aligned words; atomics are valid when zeroed.
            let slot = unsafe { &*words.add(group.rank()) };
            slot.store(group.rank() as u64 + 1, Ordering::Relaxed);
            group.barrier();

            (0..group.size())
                .map(|rank| {
                    // SAFETY: As above.
                    let word = unsafe { &*words.add(rank) };
                    word.load(Ordering::Relaxed)
                })
                .sum::<u64>()
        });

        assert_eq!(sums, vec![6, 6, 6]);
    }

    #[test]
    fn mismatched_allocation_fails_on_every_member() {
        let results = run_group(2, |group| {
            let bytes = if group.rank() == 0 { 64 } else { 4096 };
            let mismatched = group.allocate(bytes).map(|segment| segment.len());

            // The group stays usable afterwards.
            let retried = group.allocate(128).map(|segment| segment.len());
            (mismatched.is_err(), retried.ok())
        });

        assert_eq!(results, vec![(true, Some(128)), (true, Some(128))]);
    }

    #[test]
    fn consecutive_allocations_are_distinct() {
        let results = run_group(2, |group| {
            let first = group.allocate(8).expect("first");
            let second = group.allocate(8).expect("second");

            if group.rank() == 0 {
                // SAFETY: Both segments are at least one byte long.
                unsafe { first.as_ptr().write(1) };
            }
            group.barrier();

            // SAFETY: As above; the barrier orders the write before these reads.
            let (a, b) = unsafe { (first.as_ptr().read(), second.as_ptr().read()) };
            (a, b)
        });

        assert_eq!(results, vec![(1, 0), (1, 0)]);
    }

    #[test]
    fn debug_shows_identity() {
        let name = unique_name("dbg");
        let group = NodeGroup::join(name.trim_start_matches('/'), 0, 1).expect("join");
        let debug = format!("{group:?}");
        assert!(debug.contains("rank: 0"), "{debug}");
        assert!(debug.contains(group.name()), "{debug}");
    }
}
