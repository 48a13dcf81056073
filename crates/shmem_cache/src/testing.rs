// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers shared by the unit tests. Threads stand in for the processes of a group, each joining
//! on its own and mapping every segment separately.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::error::{BoxError, Result};
use crate::group::{Communicator, NodeGroup};
use crate::reader::BackingReader;
use crate::segment::Segment;

/// Returns a shared memory name that no other test in this or any concurrent process uses.
pub(crate) fn unique_name(label: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("/shmc-{label}-{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Runs `member` once per rank of a fresh group of `size` and returns the results in rank order.
pub(crate) fn run_group<R, F>(size: usize, member: F) -> Vec<R>
where
    R: Send,
    F: Fn(NodeGroup) -> R + Sync,
{
    let name = unique_name("group");
    let name = name.trim_start_matches('/');
    let member = &member;

    thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| scope.spawn(move || member(NodeGroup::join(name, rank, size).expect("join group"))))
            .collect();

        handles.into_iter().map(|handle| handle.join().expect("group member panicked")).collect()
    })
}

/// A single-member group.
pub(crate) fn solo_group() -> NodeGroup {
    let name = unique_name("solo");
    NodeGroup::join(name.trim_start_matches('/'), 0, 1).expect("join group")
}

/// Turns a group abort into a panic so that fatal paths can be observed with `#[should_panic]`.
#[derive(Debug)]
pub(crate) struct PanicOnAbort(pub(crate) NodeGroup);

impl Communicator for PanicOnAbort {
    fn rank(&self) -> usize {
        self.0.rank()
    }

    fn size(&self) -> usize {
        self.0.size()
    }

    fn barrier(&self) {
        self.0.barrier();
    }

    fn allocate(&self, bytes: usize) -> Result<Segment> {
        self.0.allocate(bytes)
    }

    fn is_aborted(&self) -> bool {
        self.0.is_aborted()
    }

    fn mark_aborted(&self) {
        self.0.mark_aborted();
    }

    fn abort(&self, reason: &str) -> ! {
        panic!("group aborted: {reason}")
    }
}

/// The value a [`RampReader`] produces at `offset` of the element for `key`.
#[expect(clippy::cast_precision_loss, reason = "test keys are small")]
pub(crate) fn ramp_value(key: usize, offset: usize) -> f64 {
    (key * 1000 + offset) as f64
}

/// A backing store whose elements are derived from their key, counting every read.
#[derive(Debug, Clone)]
pub(crate) struct RampReader {
    element_size: usize,
    reads: Arc<AtomicUsize>,
}

impl RampReader {
    pub(crate) fn new(element_size: usize) -> Self {
        Self::counting(element_size, Arc::default())
    }

    /// A reader that adds its reads to `reads`, which may be shared with other members' readers.
    pub(crate) fn counting(element_size: usize, reads: Arc<AtomicUsize>) -> Self {
        Self { element_size, reads }
    }

    pub(crate) fn expected(&self, key: usize) -> Vec<f64> {
        (0..self.element_size).map(|offset| ramp_value(key, offset)).collect()
    }
}

impl BackingReader<f64> for RampReader {
    fn element_size(&self) -> usize {
        self.element_size
    }

    fn read(&self, key: usize, destination: &mut [f64]) -> std::result::Result<(), BoxError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        for (offset, value) in destination.iter_mut().enumerate() {
            *value = ramp_value(key, offset);
        }
        Ok(())
    }
}
