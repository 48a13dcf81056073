// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed arrays in group-shared memory.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::sync::atomic::{
    AtomicBool, AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
};

use crate::error::{Error, Result};
use crate::group::Communicator;
use crate::segment::Segment;

/// Types that can live in memory shared between processes.
///
/// # Safety
///
/// Implementors must be valid when all of their bytes are zero, must not need to be dropped, and
/// must not contain pointers or references, which would be meaningless in another address space.
pub unsafe trait Shareable: Sized + Send + Sync + 'static {}

/// Shareable types whose shared references may be used concurrently by every process.
///
/// A [`SharedRegion`] of such a type dereferences to a plain slice.
///
/// # Safety
///
/// Every mutation through a shared reference must be an atomic operation.
pub unsafe trait AtomicWord: Shareable {}

macro_rules! impl_shareable {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: Primitive numbers are valid for every bit pattern, including all zeros.
            unsafe impl Shareable for $ty {}
        )*
    };
}

macro_rules! impl_atomic_word {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: Atomics are zero when all bytes are zero and have no destructor.
            unsafe impl Shareable for $ty {}

            // SAFETY: Atomics can only be mutated atomically through shared references.
            unsafe impl AtomicWord for $ty {}
        )*
    };
}

impl_shareable!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

impl_atomic_word!(
    AtomicBool,
    AtomicU8,
    AtomicU16,
    AtomicU32,
    AtomicU64,
    AtomicUsize,
    AtomicI8,
    AtomicI16,
    AtomicI32,
    AtomicI64,
    AtomicIsize,
);

/// A fixed-length array of `T` visible to every member of a group.
///
/// Every member holds its own mapping of the same physical memory. The array starts out zeroed.
/// Dropping a region only removes the local mapping; callers that need every member to be done with
/// the memory first must synchronize through [`Communicator::barrier`] before dropping.
pub struct SharedRegion<T> {
    segment: Segment,
    len: usize,
    _element: PhantomData<T>,
}

impl<T: Shareable> SharedRegion<T> {
    /// Allocates `len` zeroed elements shared by every member of `group`. Collective.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `len` is zero or the region would not fit in the
    /// address space, and any error [`Communicator::allocate`] reports.
    pub fn allocate(group: &dyn Communicator, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid_configuration("a shared region needs at least one element"));
        }

        let bytes = size_of::<T>()
            .checked_mul(len)
            .ok_or_else(|| Error::invalid_configuration(format!("a shared region of {len} elements is too large")))?;

        // Mappings are page aligned, which satisfies the alignment of every `Shareable` type.
        let segment = group.allocate(bytes)?;

        Ok(Self {
            segment,
            len,
            _element: PhantomData,
        })
    }

    /// The number of elements in the region.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the region holds no elements, which never happens for an allocated region.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The address of the first element in this process.
    #[must_use]
    pub fn as_ptr(&self) -> *mut T {
        self.segment.as_ptr().cast()
    }

    /// Borrows `len` elements starting at `offset`.
    ///
    /// # Safety
    ///
    /// No process may write to these elements while the returned slice is alive.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside of the region.
    #[must_use]
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[T] {
        self.check_range(offset, len);
        let start = self.as_ptr().wrapping_add(offset);

        // SAFETY: The range is inside the mapping, which lives as long as `self`. The caller
        // guarantees the absence of concurrent writers.
        unsafe { std::slice::from_raw_parts(start, len) }
    }

    fn check_range(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            end.is_some_and(|end| end <= self.len),
            "range {offset}+{len} is outside of a region of {} elements",
            self.len
        );
    }
}

impl<T: AtomicWord> Deref for SharedRegion<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: The mapping holds `len` initialized (zero or since written) elements and lives as
        // long as `self`. `T` is only ever mutated atomically.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }
}

impl<T> fmt::Debug for SharedRegion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("element", &std::any::type_name::<T>())
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
