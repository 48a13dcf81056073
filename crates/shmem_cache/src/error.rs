// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A boxed error produced by a [`BackingReader`](crate::BackingReader).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Any recoverable error that may arise while constructing or using a [`Cache`](crate::Cache).
///
/// Violations of the access/release contract are not represented here. They leave the shared
/// state in a condition no process can trust, so they abort the whole cooperating group through
/// [`Communicator::abort`](crate::Communicator::abort) instead of returning an error.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The cache or group parameters are not usable, e.g. zero keys or a zero-sized element.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A key outside of `[0, number_of_keys)` was requested.
    #[error("key {key} is out of range, the cache holds {number_of_keys} keys")]
    KeyOutOfRange {
        /// The requested key.
        key: usize,
        /// The number of keys the cache was constructed with.
        number_of_keys: usize,
    },

    /// The backing reader failed to produce the element for `key`.
    ///
    /// The key has been reverted to the unavailable state, so a later access retries the read.
    #[error("reading key {key} from the backing store failed")]
    Read {
        /// The key whose element could not be read.
        key: usize,
        /// The error reported by the backing reader.
        #[source]
        source: BoxError,
    },

    /// A shared-memory system call failed.
    #[error("shared memory operation `{operation}` failed")]
    SharedMemory {
        /// The operation that failed, e.g. `shm_open` or `mmap`.
        operation: &'static str,
        /// The error reported by the operating system.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Captures `errno` for the failed `operation`.
    pub(crate) fn last_os_error(operation: &'static str) -> Self {
        Self::SharedMemory {
            operation,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// A specialized `Result` for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
