// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Choosing a capacity from the memory available on the node.

use crate::error::{Error, Result};

/// Returns how many elements of `element_bytes` fit into `ratio` of `node_memory_bytes`.
///
/// The result never exceeds `total_elements` and is at least one, so that a cache can always be
/// built from it.
///
/// # Errors
///
/// Returns [`Error::InvalidConfiguration`] if `ratio` is not in `(0, 1]`, or if `element_bytes`
/// or `total_elements` is zero.
///
/// # Examples
///
/// ```
/// use shmem_cache::capacity_for_memory;
///
/// // Half of 1 MiB holds 128 elements of 4 KiB.
/// assert_eq!(capacity_for_memory(1 << 20, 0.5, 4096, 1000)?, 128);
///
/// // Never more than there are elements.
/// assert_eq!(capacity_for_memory(1 << 20, 0.5, 4096, 10)?, 10);
/// # Ok::<(), shmem_cache::Error>(())
/// ```
#[expect(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "the budget is a heuristic, rounding down is intended"
)]
pub fn capacity_for_memory(node_memory_bytes: u64, ratio: f64, element_bytes: usize, total_elements: usize) -> Result<usize> {
    if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
        return Err(Error::invalid_configuration(format!(
            "memory ratio must be in (0, 1], got {ratio}"
        )));
    }

    if element_bytes == 0 {
        return Err(Error::invalid_configuration("elements must be at least one byte"));
    }

    if total_elements == 0 {
        return Err(Error::invalid_configuration("there must be at least one element"));
    }

    let budget = (node_memory_bytes as f64 * ratio).floor() as u64;
    let fitting = budget / element_bytes as u64;
    let capacity = usize::try_from(fitting).unwrap_or(usize::MAX).min(total_elements);

    Ok(capacity.max(1))
}

/// Like [`capacity_for_memory`], using the physical memory of this node.
///
/// # Errors
///
/// Returns the errors of [`capacity_for_memory`], and [`Error::SharedMemory`] if the amount of
/// physical memory cannot be determined.
pub fn recommended_capacity(ratio: f64, element_bytes: usize, total_elements: usize) -> Result<usize> {
    let memory = node_memory()?;
    let capacity = capacity_for_memory(memory, ratio, element_bytes, total_elements)?;

    tracing::debug!(memory, ratio, element_bytes, total_elements, capacity, "sized cache from node memory");
    Ok(capacity)
}

/// Total physical memory of the node in bytes.
#[cfg(target_os = "linux")]
fn node_memory() -> Result<u64> {
    use std::mem::MaybeUninit;

    let mut sys_info: MaybeUninit<libc::sysinfo> = MaybeUninit::uninit();

    // SAFETY: Call sysinfo syscall with a valid pointer.
    let return_code = unsafe { libc::sysinfo(sys_info.as_mut_ptr()) };
    if return_code != 0 {
        return Err(Error::last_os_error("sysinfo"));
    }

    // SAFETY: sysinfo syscall initialized the structure.
    let sys_info = unsafe { sys_info.assume_init() };

    let units = usize::try_from(sys_info.totalram).map_err(|e| Error::SharedMemory {
        operation: "sysinfo",
        source: std::io::Error::other(e),
    })?;

    Ok((units as u64).saturating_mul(u64::from(sys_info.mem_unit)))
}

/// Total physical memory of the node in bytes.
#[cfg(not(target_os = "linux"))]
fn node_memory() -> Result<u64> {
    // SAFETY: sysconf only reads system configuration.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

    // SAFETY: As above.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    match (u64::try_from(pages), u64::try_from(page_size)) {
        (Ok(pages), Ok(page_size)) => Ok(pages.saturating_mul(page_size)),
        _ => Err(Error::last_os_error("sysconf")),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::fits_partially(1 << 20, 0.5, 4096, 1000, 128)]
    #[case::clamped_to_total(1 << 20, 0.5, 4096, 10, 10)]
    #[case::whole_memory(8000, 1.0, 8, 10_000, 1000)]
    #[case::at_least_one(100, 0.1, 4096, 50, 1)]
    #[case::rounds_down(1000, 0.5, 300, 50, 1)]
    fn capacity_from_budget(
        #[case] memory: u64,
        #[case] ratio: f64,
        #[case] element_bytes: usize,
        #[case] total: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(capacity_for_memory(memory, ratio, element_bytes, total).expect("valid"), expected);
    }

    #[rstest]
    #[case::zero_ratio(0.0, 8, 10)]
    #[case::negative_ratio(-0.5, 8, 10)]
    #[case::ratio_above_one(1.5, 8, 10)]
    #[case::nan_ratio(f64::NAN, 8, 10)]
    #[case::zero_element(0.5, 0, 10)]
    #[case::no_elements(0.5, 8, 0)]
    fn invalid_inputs_are_rejected(#[case] ratio: f64, #[case] element_bytes: usize, #[case] total: usize) {
        let error = capacity_for_memory(1 << 30, ratio, element_bytes, total).expect_err("invalid");
        assert!(matches!(error, Error::InvalidConfiguration(_)), "{error:?}");
    }

    #[test]
    fn node_has_memory() {
        let memory = node_memory().expect("node memory");
        assert!(memory > 0);

        let capacity = recommended_capacity(0.25, 1 << 20, 4).expect("capacity");
        assert!((1..=4).contains(&capacity));
    }
}
