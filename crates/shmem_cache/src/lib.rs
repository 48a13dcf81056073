// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A node-local, shared-memory read-through cache for fixed-size numerical elements.
//!
//! This crate provides [`Cache`], a cache that sits between a group of cooperating worker
//! processes on one machine and a slow backing store of fixed-size records ("elements")
//! identified by a dense integer key. It combines several techniques:
//!
//! 1. **One Working Set per Node:** Resident elements live in POSIX shared memory mapped by
//!    every process of the group, so an element read by one process serves all of them.
//! 2. **Read-Through with Single Flight:** A miss is claimed with one compare-and-exchange on the
//!    key's status word. Exactly one process reads from the backing store, everybody else waits
//!    for the result.
//! 3. **Pinned Holds:** Every access holds its slot until released. Held slots are never evicted
//!    or refilled.
//! 4. **Least-Recently-Released Eviction:** When the cache is full, a miss reuses the idle slot
//!    that was released longest ago.
//! 5. **Lock-Free Shared State:** All shared bookkeeping is word-sized atomics. No process-local
//!    lock ever protects shared state, so a process can never block others by holding one.
//!
//! # Architecture
//!
//! The group of processes is represented by a [`Communicator`]: it knows each process's rank,
//! synchronizes the group with barriers, allocates shared memory collectively, and aborts the
//! whole group on fatal usage errors. [`NodeGroup`] implements it with named shared memory.
//!
//! Every key has a status word that is either *unavailable*, *reading*, or names the slot holding
//! the element:
//!
//! ```text
//! unavailable --claim--> reading --read ok--> available(slot) --evicted--> unavailable
//!                           \----read failed----> unavailable
//! ```
//!
//! Every slot has an owner word (the key it holds) and an access counter (live holds). A hit
//! increments the counter and then re-checks that key and slot still belong together, which makes
//! it safe against a slot being refilled between reading the status and taking the hold. A miss
//! claims an idle slot by swapping its counter from zero to a sentinel, detaches the previous key,
//! reads the new element into the slot, and publishes it.
//!
//! All shared memory is zeroed when it is created, and zero is the initial value of every word.
//!
//! # Performance Characteristics
//!
//! | Operation | Complexity | Notes |
//! | :--- | :--- | :--- |
//! | **Access (hit)** | $O(1)$ | A few atomic operations. |
//! | **Access (miss)** | $O(capacity)$ | Slot scan, plus the backing store read. |
//! | **Release** | $O(1)$ | Stamps the slot's recency when the last hold goes away. |
//! | **Waiting** | Backoff | Spin, then yield, then sleep up to 500 µs between polls. |
//!
//! # Example
//!
//! Every process joins the group, builds the cache with identical parameters, and then accesses
//! elements independently:
//!
//! ```
//! use std::sync::Arc;
//!
//! use shmem_cache::{BackingReader, BoxError, Cache, ElementStatus, NodeGroup};
//!
//! struct Store;
//!
//! impl BackingReader<f64> for Store {
//!     fn element_size(&self) -> usize {
//!         2
//!     }
//!
//!     fn read(&self, key: usize, destination: &mut [f64]) -> Result<(), BoxError> {
//!         destination.copy_from_slice(&[key as f64, -(key as f64)]);
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> shmem_cache::Result<()> {
//! // The launcher hands out the group name, this process's rank and the group size.
//! let group = Arc::new(NodeGroup::join(format!("example-{}", std::process::id()), 0, 1)?);
//!
//! let cache = Cache::builder()
//!     .number_of_keys(1_000)
//!     .capacity(100)
//!     .build(group, Store)?;
//!
//! let element = cache.access(42)?;
//! assert_eq!(&*element, &[42.0, -42.0]);
//! assert!(matches!(cache.status(42)?, ElementStatus::Available(_)));
//! drop(element);
//!
//! let report = cache.shutdown();
//! assert_eq!(report.statistics.accesses, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Fatal Errors
//!
//! Recoverable failures, such as a failing backing store read, are returned as [`Error`].
//! Violations of the access/release contract leave shared state that no process can trust anymore,
//! so they abort the whole group instead:
//!
//! - Tearing down a cache while any element is still held.
//! - Releasing a key that is not held.
//! - Building the cache with different parameters in different processes.
//! - Dropping a cache while unwinding from a panic, since the unwinding process cannot take part
//!   in the collective teardown.
//!
//! A backing reader that panics does not leave the key behind: the key reverts to unavailable and
//! its slot returns to the pool before the panic propagates.
//!
//! # Platform Support
//!
//! Shared memory is provided through `shm_open` and `mmap`, so the crate requires a Unix-like
//! operating system.

mod backoff;
mod cache;
mod counter;
mod error;
mod eviction;
mod group;
mod reader;
mod region;
mod segment;
mod sizing;

pub use cache::{Cache, CacheBuilder, ElementStatus, Hold};
pub use counter::{CacheReport, Statistics};
pub use error::{BoxError, Error, Result};
pub use group::{Communicator, NodeGroup};
pub use reader::BackingReader;
pub use region::{AtomicWord, Shareable, SharedRegion};
pub use segment::Segment;
pub use sizing::{capacity_for_memory, recommended_capacity};

#[cfg(test)]
mod testing;
