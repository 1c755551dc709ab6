use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

use crate::allocator::Allocator;
use crate::consts::{BATCH_SIZE, MAX_FREE_SLOT_PASSES};
use crate::error::FatalError;
use crate::io_device::IoDevice;
use crate::lock::LockDomain;
use crate::slot;
use crate::thread_id::ThreadIds;

use super::cache::{with_thread_state, PageCache};

impl<Io: IoDevice, A: Allocator, T: ThreadIds> PageCache<Io, A, T> {
	fn scan_batch_for_free(&self, batch: usize, desired_status: u32, with_ref: bool) -> Option<usize> {
		let start = batch * BATCH_SIZE;
		let end = (start + BATCH_SIZE).min(self.slots.len());
		for slot_index in start..end {
			let slot = &self.slots[slot_index];
			if slot.cas_status(slot::FREE, slot::RESERVED).is_ok() {
				if with_ref {
					self.refcounts
						.inc_ref(slot_index, self.thread_id())
						.unwrap_or_else(|overflow| panic!("refcount overflow on fresh slot: {overflow:?}"));
				}
				slot.store_status(desired_status);
				return Some(slot_index);
			}
		}
		None
	}

	/// Release the currently owned evict batch, then advance `evict_hand`
	/// (and the lagging `cleaner_hand`, which runs the cleaner
	/// opportunistically) until a freshly probed batch is successfully
	/// claimed; sweep it for eviction and return its index as the new owned
	/// batch.
	pub(crate) fn move_hand(&self, urgent: bool) -> usize {
		let owned = with_thread_state(self.id(), |state| state.free_hand.take());
		if let Some(batch) = owned {
			self.batch_busy[batch].store(false, Ordering::Release);
		}

		loop {
			let evict_hand = self.evict_hand.fetch_add(1, Ordering::AcqRel) % self.config.batch_capacity;
			let cleaner_hand = (evict_hand + self.config.cleaner_gap) % self.config.batch_capacity;

			if self.clean_batch_busy[cleaner_hand]
				.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				self.batch_start_writeback(cleaner_hand, urgent);
				self.clean_batch_busy[cleaner_hand].store(false, Ordering::Release);
			}

			if self.batch_busy[evict_hand]
				.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				self.evict_batch(evict_hand);
				return evict_hand;
			}
		}
	}

	/// The cooperative clock driver. Every caller needing a slot scans its
	/// own owned batch, and on a miss drives the hand forward itself. Gives
	/// up after `MAX_FREE_SLOT_PASSES` passes in non-blocking mode; in
	/// blocking mode it never gives up — it keeps retrying until the
	/// device's self-reported max latency elapses, at which point free-slot
	/// exhaustion is a fatal invariant violation.
	pub(crate) fn get_free_page(&self, desired_status: u32, with_ref: bool, blocking: bool) -> Option<usize> {
		let mut num_passes: usize = 0;
		let mut started: Option<Instant> = None;

		loop {
			let batch = with_thread_state(self.id(), |state| state.free_hand);
			let batch = match batch {
				Some(batch) => batch,
				None => {
					let batch = self.move_hand(false);
					with_thread_state(self.id(), |state| state.free_hand = Some(batch));
					batch
				}
			};

			if let Some(slot_index) = self.scan_batch_for_free(batch, desired_status, with_ref) {
				return Some(slot_index);
			}

			let urgent = num_passes > 0;
			let next_batch = self.move_hand(urgent);
			with_thread_state(self.id(), |state| state.free_hand = Some(next_batch));

			num_passes += 1;
			self.stats.record_free_slot_pass();

			if num_passes == 1 {
				started = Some(Instant::now());
			} else {
				thread::yield_now();
				self.drive_io_progress();
			}

			if num_passes >= MAX_FREE_SLOT_PASSES {
				if !blocking {
					return None;
				}
				let elapsed = started.expect("timestamp recorded on first pass").elapsed();
				if elapsed >= self.io.max_latency() {
					self.fatal(FatalError::FreeSlotExhausted {
						capacity: self.config.page_capacity,
						max_latency_ms: self.io.max_latency().as_millis(),
					});
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::allocator::InMemoryAllocator;
	use crate::config::ConfigBuilder;
	use crate::io_device::MockIoDevice;
	use crate::thread_id::ThreadRegistry;

	fn make_cache() -> PageCache<MockIoDevice> {
		let config = ConfigBuilder::default().page_size(4096).build().unwrap();
		PageCache::new(config, MockIoDevice::new(), InMemoryAllocator::new(1 << 30), ThreadRegistry::new())
	}

	#[test]
	fn get_free_page_returns_a_slot_from_an_empty_cache() {
		let cache = make_cache();
		let slot_index = cache.get_free_page(slot::ALLOC, true, true).unwrap();
		assert!(cache.slots[slot_index].is_claimed());
		assert_eq!(cache.refcounts.sum_refs(slot_index), 1);
	}

	#[test]
	fn get_free_page_stores_exact_requested_status() {
		let cache = make_cache();
		let slot_index = cache.get_free_page(slot::READ_LOADING, true, true).unwrap();
		assert!(cache.slots[slot_index].test_flag(slot::LOADING));
		assert!(cache.slots[slot_index].test_flag(slot::CLEAN));
	}

	#[test]
	fn successive_calls_return_distinct_slots() {
		let cache = make_cache();
		let a = cache.get_free_page(slot::ALLOC, false, true).unwrap();
		let b = cache.get_free_page(slot::ALLOC, false, true).unwrap();
		assert_ne!(a, b);
	}
}
