// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The backing store seam.

use crate::error::BoxError;

/// The slow store a [`Cache`](crate::Cache) reads elements from on a miss.
///
/// Every member of a group brings its own reader; all of them must produce the same element for
/// the same key. Reads are synchronous and may take a long time. When the cache is built with
/// [`serialize_reads`](crate::CacheBuilder::serialize_reads), at most one member of the group
/// reads at any time.
///
/// # Examples
///
/// ```
/// use shmem_cache::{BackingReader, BoxError};
///
/// struct Squares;
///
/// impl BackingReader<f64> for Squares {
///     fn element_size(&self) -> usize {
///         4
///     }
///
///     fn read(&self, key: usize, destination: &mut [f64]) -> Result<(), BoxError> {
///         destination.fill((key * key) as f64);
///         Ok(())
///     }
/// }
///
/// let mut element = [0.0; 4];
/// Squares.read(3, &mut element).unwrap();
/// assert_eq!(element, [9.0; 4]);
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait BackingReader<T: 'static> {
    /// The number of `T` values in one element.
    fn element_size(&self) -> usize;

    /// Fills `destination`, which holds exactly [`element_size`](Self::element_size) values, with
    /// the element for `key`.
    ///
    /// # Errors
    ///
    /// Any error the store reports. The cache hands it back to the caller of the access that
    /// triggered the read.
    fn read(&self, key: usize, destination: &mut [T]) -> Result<(), BoxError>;
}
