use std::ops::RangeInclusive;

use thiserror::Error;

use crate::utils::units::*;

pub const DEFAULT_PAGE_SIZE: usize = 16 * KiB;
pub const PAGE_SIZE_RANGE: RangeInclusive<usize> = (512 * B)..=(64 * KiB);

pub const DEFAULT_EXTENT_SIZE: usize = MiB;
pub const MIN_EXTENT_SIZE: usize = 4 * KiB;

/// Bytes per cache line on common server hardware. Sizes the refcount
/// matrix transpose blocks (see `refcount`).
pub const CACHE_LINE: usize = 64;

/// Number of slots jointly owned by one clock-hand batch.
pub const BATCH_SIZE: usize = 64;

/// Default cache capacity in bytes: exactly one full `CACHE_LINE *
/// CACHE_LINE` block of pages at the default page size. `Config::build`
/// rounds `capacity / page_size` down to a multiple of that block size
/// (the refcount transpose's block size), so the default must clear that
/// floor at the default page size or `build()` rejects it outright.
pub const DEFAULT_CAPACITY: usize = DEFAULT_PAGE_SIZE * CACHE_LINE * CACHE_LINE;

/// Refcount matrix row count. Thread ids are taken modulo this, so more
/// OS threads than columns degrade gracefully by sharing columns.
pub const DEFAULT_REFCOUNT_WIDTH: usize = 64;

/// Default number of batches the clean hand runs ahead of the evict hand.
pub const DEFAULT_CLEANER_GAP: usize = 4;

/// The free-slot search gives up after this many full batch passes in
/// non-blocking mode.
pub const MAX_FREE_SLOT_PASSES: usize = 3;

#[derive(Debug, Error)]
#[error(
	"page size {0} is invalid; must be a power of two between {} and {}",
	display_size(*PAGE_SIZE_RANGE.start()),
	display_size(*PAGE_SIZE_RANGE.end())
)]
pub struct PageSizeBoundsError(pub usize);

#[inline]
pub fn validate_page_size(size: usize) -> Result<(), PageSizeBoundsError> {
	if !size.is_power_of_two() || !PAGE_SIZE_RANGE.contains(&size) {
		return Err(PageSizeBoundsError(size));
	}
	Ok(())
}

#[derive(Debug, Error)]
#[error(
	"extent size {0} is invalid; must be a power of two, a multiple of the page size, and at least {}",
	display_size(MIN_EXTENT_SIZE)
)]
pub struct ExtentSizeBoundsError(pub usize);

#[inline]
pub fn validate_extent_size(extent_size: usize, page_size: usize) -> Result<(), ExtentSizeBoundsError> {
	if !extent_size.is_power_of_two() || extent_size < MIN_EXTENT_SIZE || extent_size % page_size != 0
	{
		return Err(ExtentSizeBoundsError(extent_size));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_valid_page_size() {
		assert!(validate_page_size(DEFAULT_PAGE_SIZE).is_ok());
		assert!(validate_page_size(512).is_ok());
	}

	#[test]
	fn rejects_non_power_of_two() {
		assert!(validate_page_size(3000).is_err());
	}

	#[test]
	fn rejects_out_of_range() {
		assert!(validate_page_size(256).is_err());
		assert!(validate_page_size(128 * KiB).is_err());
	}

	#[test]
	fn accepts_valid_extent_size() {
		assert!(validate_extent_size(DEFAULT_EXTENT_SIZE, DEFAULT_PAGE_SIZE).is_ok());
	}

	#[test]
	fn rejects_extent_not_multiple_of_page() {
		assert!(validate_extent_size(6 * KiB, DEFAULT_PAGE_SIZE).is_err());
	}
}
