use crate::allocator::Allocator;
use crate::io_device::IoDevice;
use crate::lock::{self, LockDomain};
use crate::slot;
use crate::thread_id::ThreadIds;

use super::cache::PageCache;

/// Outcome of a single-slot eviction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
	Evicted,
	NotEvictable,
}

impl<Io: IoDevice, A: Allocator, T: ThreadIds> PageCache<Io, A, T> {
	/// Test-and-test-and-set on ACCESSED, bail out on any non-CLEAN status
	/// or live ref/pin, else ascend the full lock ladder and release the
	/// slot back to FREE on confirmation.
	pub(crate) fn try_evict(&self, slot_index: usize) -> EvictOutcome {
		let slot = &self.slots[slot_index];

		if slot.test_and_test_and_clear(slot::ACCESSED) {
			return EvictOutcome::NotEvictable;
		}
		if !slot.is_clean() {
			return EvictOutcome::NotEvictable;
		}
		if self.refcounts.sum_refs(slot_index) > 0 || self.refcounts.pin_count(slot_index) > 0 {
			return EvictOutcome::NotEvictable;
		}

		let read = match lock::try_get_read(self, slot_index, false) {
			Ok(read) => read,
			Err(_) => return EvictOutcome::NotEvictable,
		};

		let claim = match read.try_claim() {
			Ok(claim) => claim,
			Err(read) => {
				drop(read);
				return EvictOutcome::NotEvictable;
			}
		};

		if slot.is_loading() {
			drop(claim);
			return EvictOutcome::NotEvictable;
		}

		let write = match claim.try_get_write() {
			Ok(write) => write,
			Err((claim, _)) => {
				drop(claim);
				return EvictOutcome::NotEvictable;
			}
		};

		if !slot.is_clean() || self.refcounts.pin_count(slot_index) > 0 {
			drop(write);
			return EvictOutcome::NotEvictable;
		}

		self.lookup.clear(self.page_number(slot.disk_addr()));
		slot.release_to_free();
		// The evictor's own read ref (taken above to walk the lock ladder)
		// must drain too: `release_to_free` only resets `status`, it does
		// not touch the refcount matrix. The guard chain is forgotten
		// rather than dropped so its `Drop` impls don't reclear flags or
		// double-decrement a status word that is already `FREE`.
		self.refcounts.dec_ref(slot_index, self.thread_id());
		std::mem::forget(write);
		self.stats.record_eviction();
		EvictOutcome::Evicted
	}

	/// Sweep every slot in the batch once.
	pub(crate) fn evict_batch(&self, batch: usize) -> usize {
		let start = batch * crate::consts::BATCH_SIZE;
		let mut evicted = 0;
		for slot_index in start..(start + crate::consts::BATCH_SIZE).min(self.slots.len()) {
			if self.try_evict(slot_index) == EvictOutcome::Evicted {
				evicted += 1;
			}
		}
		evicted
	}

	/// Two full passes over every batch, the second clearing accessed-bits
	/// the first pass set as second-chance markers, so anything still
	/// evictable on the second pass truly has had no intervening access.
	pub fn evict_all(&self, ignore_pinned: bool) -> usize {
		let mut total = 0;
		for _pass in 0..2 {
			for batch in 0..self.config.batch_capacity {
				let start = batch * crate::consts::BATCH_SIZE;
				for slot_index in start..(start + crate::consts::BATCH_SIZE).min(self.slots.len()) {
					if ignore_pinned && self.refcounts.pin_count(slot_index) > 0 {
						continue;
					}
					if self.try_evict(slot_index) == EvictOutcome::Evicted {
						total += 1;
					}
				}
			}
		}
		total
	}
}
