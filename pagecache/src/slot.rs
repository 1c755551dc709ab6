use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::page_type::PageType;
use crate::utils::aligned_buf::AlignedBuffer;

/// Sentinel `disk_addr` for a slot that holds no page.
pub const UNMAPPED_ADDR: u64 = u64::MAX;

pub const FREE: u32 = 1 << 0;
pub const ACCESSED: u32 = 1 << 1;
pub const CLEAN: u32 = 1 << 2;
pub const WRITEBACK: u32 = 1 << 3;
pub const LOADING: u32 = 1 << 4;
pub const WRITELOCKED: u32 = 1 << 5;
pub const CLAIMED: u32 = 1 << 6;

/// Internal-only bit, never observed outside the free-slot acquisition
/// window: set together with `WRITELOCKED|CLAIMED` the
/// instant a slot is CAS'd away from `FREE`, so a slot can never be
/// observed in a state that is neither `FREE` nor one of the well-known
/// well-known status words. Cleared the moment the caller's requested
/// final status is stored.
pub(crate) const RESERVED_FOR_ALLOC: u32 = 1 << 7;

/// Transitional status a free-slot acquirer CASes into from `FREE` before
/// deciding the final status (ALLOC for `alloc`, READ_LOADING for a `get`
/// miss). Exclusive against every other lock level, so nothing else can
/// observe the slot mid-decision.
pub(crate) const RESERVED: u32 = RESERVED_FOR_ALLOC | WRITELOCKED | CLAIMED;

/// Final status written by `alloc`: write-locked, claimed, dirty (CLEAN
/// unset), with ACCESSED set since the caller immediately touches it.
pub const ALLOC: u32 = WRITELOCKED | CLAIMED | ACCESSED;

/// Final status written by a `get` miss before I/O is submitted: CLEAN is
/// set from the start (the page is not dirty, merely not-yet-resident),
/// LOADING guards it until the read completes.
pub const READ_LOADING: u32 = ACCESSED | CLEAN | LOADING;

/// One cached page frame: owning buffer, disk address, page-type tag, and
/// the packed status word.
pub struct Slot {
	pub data: AlignedBuffer,
	disk_addr: AtomicU64,
	page_type: AtomicU8,
	status: AtomicU32,
}

impl Slot {
	pub fn new(page_size: usize) -> Self {
		Self {
			data: AlignedBuffer::with_capacity(page_size, page_size),
			disk_addr: AtomicU64::new(UNMAPPED_ADDR),
			page_type: AtomicU8::new(PageType::Invalid as u8),
			status: AtomicU32::new(FREE),
		}
	}

	#[inline]
	pub fn disk_addr(&self) -> u64 {
		self.disk_addr.load(Ordering::Acquire)
	}

	#[inline]
	pub fn set_disk_addr(&self, addr: u64) {
		self.disk_addr.store(addr, Ordering::Release);
	}

	#[inline]
	pub fn page_type(&self) -> PageType {
		PageType::from_u8(self.page_type.load(Ordering::Acquire))
	}

	#[inline]
	pub fn set_page_type(&self, page_type: PageType) {
		self.page_type.store(page_type as u8, Ordering::Release);
	}

	#[inline]
	pub fn status(&self) -> u32 {
		self.status.load(Ordering::Acquire)
	}

	#[inline]
	pub fn test_flag(&self, mask: u32) -> bool {
		self.status() & mask == mask
	}

	#[inline]
	pub fn test_any(&self, mask: u32) -> bool {
		self.status() & mask != 0
	}

	/// Sets every bit in `mask`, leaving the rest untouched.
	#[inline]
	pub fn set_flag(&self, mask: u32) -> u32 {
		self.status.fetch_or(mask, Ordering::AcqRel)
	}

	/// Clears every bit in `mask`, leaving the rest untouched.
	#[inline]
	pub fn clear_flag(&self, mask: u32) -> u32 {
		self.status.fetch_and(!mask, Ordering::AcqRel)
	}

	/// Test-and-test-and-set: only issues the RMW if the bit was unset in
	/// a preceding plain load, the way `try_get_read`'s accessed-bit
	/// update avoids dirtying the cache line on every hit.
	#[inline]
	pub fn test_and_test_and_set(&self, mask: u32) -> bool {
		if self.status() & mask == mask {
			return true;
		}
		self.set_flag(mask) & mask == mask
	}

	/// Test-and-test-and-clear, the `try_evict` counterpart: clears `mask`
	/// only if currently set, reporting whether it was set beforehand.
	#[inline]
	pub fn test_and_test_and_clear(&self, mask: u32) -> bool {
		if self.status() & mask == 0 {
			return false;
		}
		self.clear_flag(mask) & mask == mask
	}

	/// Atomic compare-and-swap on the full status word, for transitions
	/// that must be atomic against concurrent readers.
	#[inline]
	pub fn cas_status(&self, current: u32, new: u32) -> Result<u32, u32> {
		self.status
			.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
	}

	#[inline]
	pub fn is_free(&self) -> bool {
		self.test_flag(FREE)
	}

	#[inline]
	pub fn is_clean(&self) -> bool {
		self.test_flag(CLEAN)
	}

	#[inline]
	pub fn is_dirty(&self) -> bool {
		!self.test_any(CLEAN | WRITEBACK | LOADING | FREE)
	}

	#[inline]
	pub fn is_claimed(&self) -> bool {
		self.test_flag(CLAIMED)
	}

	#[inline]
	pub fn is_writelocked(&self) -> bool {
		self.test_flag(WRITELOCKED)
	}

	#[inline]
	pub fn is_loading(&self) -> bool {
		self.test_flag(LOADING)
	}

	#[inline]
	pub fn is_writeback(&self) -> bool {
		self.test_flag(WRITEBACK)
	}

	#[inline]
	pub fn is_accessed(&self) -> bool {
		self.test_flag(ACCESSED)
	}

	/// Overwrite the status word outright. Only valid once the caller has
	/// exclusive ownership of the slot (just CAS'd it out of FREE into
	/// `RESERVED`), to store the final caller-requested status.
	pub(crate) fn store_status(&self, status: u32) {
		self.status.store(status, Ordering::Release);
	}

	/// Release a slot back to FREE, clearing address and page type. Only
	/// valid while the caller holds the write lock.
	pub(crate) fn release_to_free(&self) {
		self.set_disk_addr(UNMAPPED_ADDR);
		self.set_page_type(PageType::Invalid);
		self.status.store(FREE, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_slot_is_free() {
		let slot = Slot::new(4096);
		assert!(slot.is_free());
		assert_eq!(slot.disk_addr(), UNMAPPED_ADDR);
	}

	#[test]
	fn set_and_clear_flag_are_independent() {
		let slot = Slot::new(4096);
		slot.status.store(CLEAN, Ordering::Release);
		slot.set_flag(ACCESSED);
		assert!(slot.test_flag(CLEAN));
		assert!(slot.test_flag(ACCESSED));
		slot.clear_flag(ACCESSED);
		assert!(!slot.test_flag(ACCESSED));
		assert!(slot.test_flag(CLEAN));
	}

	#[test]
	fn cas_status_only_succeeds_on_exact_match() {
		let slot = Slot::new(4096);
		assert!(slot.cas_status(FREE, RESERVED).is_ok());
		assert!(slot.cas_status(FREE, ALLOC).is_err());
	}

	#[test]
	fn test_and_test_and_set_reports_prior_state() {
		let slot = Slot::new(4096);
		slot.status.store(CLEAN, Ordering::Release);
		assert!(!slot.test_and_test_and_set(ACCESSED));
		assert!(slot.test_and_test_and_set(ACCESSED));
	}

	#[test]
	fn release_to_free_clears_address_and_type() {
		let slot = Slot::new(4096);
		slot.set_disk_addr(4096);
		slot.set_page_type(PageType::Branch);
		slot.status.store(CLEAN | WRITELOCKED | CLAIMED, Ordering::Release);
		slot.release_to_free();
		assert!(slot.is_free());
		assert_eq!(slot.disk_addr(), UNMAPPED_ADDR);
		assert_eq!(slot.page_type(), PageType::Invalid);
	}
}
