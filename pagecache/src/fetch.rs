use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::thread;

use crate::allocator::Allocator;
use crate::error::{AsyncGetOutcome, FatalError, ReadOutcome};
use crate::io_device::{IoDevice, IoVecRequest};
use crate::lock::{self, LockDomain, ReadGuard, WriteGuard};
use crate::lookup::UNMAPPED_ENTRY;
use crate::page_type::PageType;
use crate::slot;
use crate::thread_id::ThreadIds;

use super::cache::PageCache;

/// Opaque handle a caller passes to `get_async`/`async_done`. Once
/// `get_async` returns `IoStarted` or `Success`, the resolved slot is
/// parked here until the caller collects it with `async_done` — completion
/// callbacks only ever touch atomic fields, never caller-side locks.
pub struct AsyncContext {
	slot: AtomicIsize,
	was_miss: AtomicBool,
}

impl AsyncContext {
	pub fn new() -> Self {
		Self {
			slot: AtomicIsize::new(-1),
			was_miss: AtomicBool::new(false),
		}
	}

	pub fn is_pending(&self) -> bool {
		self.slot.load(Ordering::Acquire) >= 0
	}
}

impl Default for AsyncContext {
	fn default() -> Self {
		Self::new()
	}
}

/// Safety: mutating a slot's page buffer through a shared reference is
/// sound exactly when the slot is LOADING or WRITEBACK, since those states
/// hand exclusive ownership of the buffer to the I/O subsystem until the
/// matching completion clears the flag. Centralised here so every call
/// site states which invariant it relies on.
unsafe fn buf_mut(slot: &crate::slot::Slot) -> &mut [u8] {
	let ptr = slot as *const crate::slot::Slot as *mut crate::slot::Slot;
	(*ptr).data.as_slice_mut()
}

enum GetStep<'a, D: LockDomain> {
	Done(Option<ReadGuard<'a, D>>),
	Retry,
}

impl<Io: IoDevice, A: Allocator, T: ThreadIds> PageCache<Io, A, T> {
	/// Acquire a fresh free slot in ALLOC status (write-locked, claimed,
	/// dirty, ref held) and publish it.
	pub fn alloc(&self, addr: u64, page_type: PageType) -> WriteGuard<'_, Self> {
		loop {
			let slot_index = self
				.get_free_page(slot::ALLOC, true, true)
				.expect("blocking get_free_page never returns None");
			let page_number = self.page_number(addr);

			match self.lookup.try_publish(page_number, slot_index) {
				Ok(()) => {
					self.slots[slot_index].set_disk_addr(addr);
					self.slots[slot_index].set_page_type(page_type);
					return WriteGuard::from_owned(self, slot_index);
				}
				Err(_winner) => {
					self.refcounts.dec_ref(slot_index, self.thread_id());
					self.slots[slot_index].release_to_free();
				}
			}
		}
	}

	/// Retries `get_internal` until a non-retry outcome.
	pub fn get(&self, addr: u64, blocking: bool, page_type: PageType) -> Option<ReadGuard<'_, Self>> {
		loop {
			match self.get_internal(addr, blocking, page_type) {
				GetStep::Done(result) => return result,
				GetStep::Retry => continue,
			}
		}
	}

	fn wait_out_loading(&self, slot_index: usize) {
		while self.slots[slot_index].is_loading() {
			self.drive_io_progress();
			thread::yield_now();
		}
	}

	fn get_internal(&self, addr: u64, blocking: bool, page_type: PageType) -> GetStep<'_, Self> {
		let page_number = self.page_number(addr);
		let existing = self.lookup.get(page_number);

		if existing != UNMAPPED_ENTRY {
			let read = if blocking {
				match lock::get_read(self, existing, true) {
					Some(read) => read,
					None => return GetStep::Retry,
				}
			} else {
				match lock::try_get_read(self, existing, true) {
					Ok(read) => read,
					Err(ReadOutcome::Evicted) => return GetStep::Retry,
					Err(ReadOutcome::Conflict) => return GetStep::Done(None),
					Err(ReadOutcome::Success) => unreachable!("try_get_read never errors with Success"),
				}
			};

			if read.slot().disk_addr() != addr {
				drop(read);
				return GetStep::Retry;
			}

			self.wait_out_loading(existing);
			self.stats.record_hit();
			return GetStep::Done(Some(read));
		}

		let slot_index = match self.get_free_page(slot::READ_LOADING, true, blocking) {
			Some(slot_index) => slot_index,
			None => return GetStep::Done(None),
		};

		match self.lookup.try_publish(page_number, slot_index) {
			Ok(()) => {
				self.slots[slot_index].set_disk_addr(addr);
				self.slots[slot_index].set_page_type(page_type);

				let addr_for_read = addr;
				// Safety: see `buf_mut`; this slot is LOADING until the
				// line below clears it, and no other reference exists.
				let buf = unsafe { buf_mut(&self.slots[slot_index]) };
				self.io.read_at(buf, addr_for_read).unwrap_or_else(|source| {
					self.fatal(FatalError::IoFailed { op: "read", addr: addr_for_read, source })
				});
				self.slots[slot_index].clear_flag(slot::LOADING);
				self.stats.record_miss();
				self.stats.record_read_issued();

				GetStep::Done(Some(ReadGuard::from_owned(self, slot_index)))
			}
			Err(_winner) => {
				self.refcounts.dec_ref(slot_index, self.thread_id());
				self.slots[slot_index].release_to_free();
				GetStep::Retry
			}
		}
	}

	/// Resolves a hit immediately (parking the held read ref in `ctxt`), or
	/// starts an async read on a miss. The caller later calls `async_done`
	/// to collect the page and update statistics, on whichever thread is
	/// driving I/O progress.
	pub fn get_async(&self, addr: u64, page_type: PageType, ctxt: &AsyncContext) -> AsyncGetOutcome {
		let page_number = self.page_number(addr);
		let existing = self.lookup.get(page_number);

		if existing != UNMAPPED_ENTRY {
			return match lock::try_get_read(self, existing, true) {
				Ok(read) => {
					if read.slot().disk_addr() != addr {
						drop(read);
						return AsyncGetOutcome::NoReqs;
					}
					let slot_index = read.slot_index();
					std::mem::forget(read);
					ctxt.was_miss.store(false, Ordering::Relaxed);
					ctxt.slot.store(slot_index as isize, Ordering::Release);
					AsyncGetOutcome::Success
				}
				Err(ReadOutcome::Conflict) => AsyncGetOutcome::Locked,
				Err(ReadOutcome::Evicted) => AsyncGetOutcome::NoReqs,
				Err(ReadOutcome::Success) => unreachable!(),
			};
		}

		let slot_index = match self.get_free_page(slot::READ_LOADING, true, false) {
			Some(slot_index) => slot_index,
			None => return AsyncGetOutcome::Locked,
		};

		match self.lookup.try_publish(page_number, slot_index) {
			Ok(()) => {
				self.slots[slot_index].set_disk_addr(addr);
				self.slots[slot_index].set_page_type(page_type);
				// Safety: see `buf_mut`; LOADING guards this buffer until
				// the read completion clears it.
				let buf = unsafe { buf_mut(&self.slots[slot_index]) };
				self.io.submit_read(slot_index, buf, addr);
				ctxt.was_miss.store(true, Ordering::Relaxed);
				ctxt.slot.store(slot_index as isize, Ordering::Release);
				AsyncGetOutcome::IoStarted
			}
			Err(_winner) => {
				self.refcounts.dec_ref(slot_index, self.thread_id());
				self.slots[slot_index].release_to_free();
				AsyncGetOutcome::NoReqs
			}
		}
	}

	/// Collect the page a prior `get_async` resolved, waiting out LOADING
	/// if the read is still in flight. Updates hit/miss statistics here,
	/// since a pull-based `IoDevice` only learns a read has truly landed
	/// once the caller drives completions forward and collects it.
	pub fn async_done(&self, ctxt: &AsyncContext) -> Option<ReadGuard<'_, Self>> {
		let raw = ctxt.slot.swap(-1, Ordering::AcqRel);
		if raw < 0 {
			return None;
		}
		let slot_index = raw as usize;
		let was_miss = ctxt.was_miss.load(Ordering::Relaxed);
		self.wait_out_loading(slot_index);
		if was_miss {
			self.stats.record_miss();
			self.stats.record_read_issued();
		} else {
			self.stats.record_hit();
		}
		Some(ReadGuard::from_owned(self, slot_index))
	}

	fn flush_prefetch_run(&self, run: &mut Vec<usize>) {
		if run.is_empty() {
			return;
		}
		let first_addr = self.slots[run[0]].disk_addr();
		// Safety: see `buf_mut`; every slot in `run` is LOADING until the
		// vectored read completes.
		let bufs: Vec<&mut [u8]> = run.iter().map(|&slot_index| unsafe { buf_mut(&self.slots[slot_index]) }).collect();
		self.io.submit_readv(run.clone(), IoVecRequest { offset: first_addr, bufs });
		self.stats.record_read_issued();
		run.clear();
	}

	/// Try a read ref on each page in the extent to detect residents;
	/// where absent, acquire a free slot and CAS into lookup, accumulating
	/// contiguous misses into one vectored read. A present page or a lost
	/// CAS flushes the run so far; a lost CAS retries the same offset.
	pub fn prefetch(&self, base_addr: u64, page_type: PageType) {
		let page_size = self.config.page_size as u64;
		let mut run: Vec<usize> = Vec::new();
		let mut i = 0usize;

		while i < self.config.pages_per_extent {
			let addr = base_addr + i as u64 * page_size;
			let page_number = self.page_number(addr);
			let existing = self.lookup.get(page_number);

			if existing != UNMAPPED_ENTRY {
				if let Ok(read) = lock::try_get_read(self, existing, false) {
					drop(read);
				}
				self.flush_prefetch_run(&mut run);
				i += 1;
				continue;
			}

			let slot_index = match self.get_free_page(slot::READ_LOADING, true, false) {
				Some(slot_index) => slot_index,
				None => {
					self.flush_prefetch_run(&mut run);
					i += 1;
					continue;
				}
			};

			match self.lookup.try_publish(page_number, slot_index) {
				Ok(()) => {
					self.slots[slot_index].set_disk_addr(addr);
					self.slots[slot_index].set_page_type(page_type);
					run.push(slot_index);
					i += 1;
				}
				Err(_winner) => {
					self.refcounts.dec_ref(slot_index, self.thread_id());
					self.slots[slot_index].release_to_free();
					self.flush_prefetch_run(&mut run);
					// Pages owned by a losing CAS retry the same offset.
				}
			}
		}
		self.flush_prefetch_run(&mut run);
	}

	/// Decrement the allocator refcount; a prior value of 1 means this was
	/// the last external reference, so every page in the extent is evicted,
	/// then the allocator refcount is dropped to true 0.
	pub fn dealloc(&self, extent_addr: u64, _page_type: PageType) -> bool {
		let prior = self.allocator.dec_refcount(extent_addr);
		if prior == 0 {
			self.fatal(FatalError::AllocatorMisuse { extent: extent_addr, refcount: prior });
		}
		if prior != 1 {
			return false;
		}

		let page_size = self.config.page_size as u64;
		for i in 0..self.config.pages_per_extent {
			self.try_dealloc_page(extent_addr + i as u64 * page_size);
		}

		self.allocator.dec_refcount(extent_addr);
		true
	}

	/// Read-lock, wait out LOADING, verify the mapping is still live, claim
	/// (retrying on conflict after dropping the read ref), write-lock, then
	/// release to FREE.
	fn try_dealloc_page(&self, addr: u64) {
		loop {
			let page_number = self.page_number(addr);
			let existing = self.lookup.get(page_number);
			if existing == UNMAPPED_ENTRY {
				return;
			}

			let read = match lock::get_read(self, existing, false) {
				Some(read) => read,
				None => continue,
			};

			self.wait_out_loading(existing);

			if read.slot().disk_addr() != addr {
				drop(read);
				return;
			}

			let claim = match read.try_claim() {
				Ok(claim) => claim,
				Err(read) => {
					drop(read);
					continue;
				}
			};

			let write = claim.get_write();
			self.lookup.clear(page_number);
			write.slot().release_to_free();
			self.refcounts.dec_ref(existing, self.thread_id());
			std::mem::forget(write);
			return;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::allocator::InMemoryAllocator;
	use crate::config::ConfigBuilder;
	use crate::io_device::{IoCompletion, MockIoDevice};
	use crate::thread_id::ThreadRegistry;

	fn make_cache(io: MockIoDevice) -> PageCache<MockIoDevice> {
		let config = ConfigBuilder::default().page_size(4096).build().unwrap();
		PageCache::new(config, io, InMemoryAllocator::new(1 << 30), ThreadRegistry::new())
	}

	#[test]
	fn alloc_then_get_round_trips_contents() {
		let mut io = MockIoDevice::new();
		io.expect_read_at().times(0);

		let cache = make_cache(io);
		let write = cache.alloc(0, PageType::Trunk);
		assert!(write.slot().is_writelocked());

		let slot_index = write.slot_index();
		// Safety: test-only direct write, matching the write-lock holder's
		// exclusive access the lock ladder guarantees.
		unsafe { buf_mut(&cache.slots[slot_index]) }.fill(0xA5);

		let claim = write.unlock();
		let read = claim.unclaim();
		drop(read);

		let page = cache.get(0, true, PageType::Trunk).unwrap();
		assert!(page.slot().data.iter().all(|&b| b == 0xA5));
	}

	#[test]
	fn get_on_cold_cache_issues_exactly_one_read() {
		let mut io = MockIoDevice::new();
		io.expect_read_at().times(1).returning(|buf, _offset| {
			buf.fill(0);
			Ok(())
		});
		let cache = make_cache(io);

		let page = cache.get(4096, true, PageType::Branch).unwrap();
		assert_eq!(page.slot().disk_addr(), 4096);
	}

	#[test]
	fn get_on_write_locked_page_is_null_without_blocking() {
		let mut io = MockIoDevice::new();
		io.expect_read_at().times(1).returning(|buf, _offset| {
			buf.fill(0);
			Ok(())
		});
		let cache = make_cache(io);
		let _held = cache.get(0, true, PageType::Trunk).unwrap();
		let claim = cache.claim(_held).unwrap();
		let _write = cache.lock(claim);

		assert!(cache.get(0, false, PageType::Trunk).is_none());
		assert_eq!(cache.refcounts.sum_refs(0), 1);
	}

	#[test]
	fn get_async_miss_defers_stats_until_async_done() {
		use std::sync::atomic::Ordering as O;
		use std::sync::Mutex;

		let pending = std::sync::Arc::new(Mutex::new(Some(IoCompletion {
			op: crate::io_device::IoOp::Read,
			slots: vec![0],
			result: Ok(()),
		})));

		let mut io = MockIoDevice::new();
		io.expect_submit_read().times(1).returning(|_, _, _| ());
		let pending_for_cleanup = pending.clone();
		io.expect_cleanup()
			.returning(move |_| pending_for_cleanup.lock().unwrap().take().into_iter().collect());

		let cache = make_cache(io);
		let ctxt = AsyncContext::new();
		let outcome = cache.get_async(0, PageType::Trunk, &ctxt);
		assert_eq!(outcome, AsyncGetOutcome::IoStarted);

		assert_eq!(cache.stats.misses.load(O::Relaxed), 0);
		assert_eq!(cache.stats.reads_issued.load(O::Relaxed), 0);

		let page = cache.async_done(&ctxt).unwrap();
		assert_eq!(page.slot_index(), 0);
		assert_eq!(cache.stats.misses.load(O::Relaxed), 1);
		assert_eq!(cache.stats.reads_issued.load(O::Relaxed), 1);
		assert_eq!(cache.stats.hits.load(O::Relaxed), 0);
	}

	#[test]
	fn get_async_hit_records_stat_on_collection_not_submission() {
		use std::sync::atomic::Ordering as O;

		let mut io = MockIoDevice::new();
		io.expect_read_at().times(1).returning(|buf, _offset| {
			buf.fill(0);
			Ok(())
		});
		let cache = make_cache(io);
		let first = cache.get(0, true, PageType::Trunk).unwrap();
		drop(first);

		let ctxt = AsyncContext::new();
		let outcome = cache.get_async(0, PageType::Trunk, &ctxt);
		assert_eq!(outcome, AsyncGetOutcome::Success);
		assert_eq!(cache.stats.hits.load(O::Relaxed), 1);

		let page = cache.async_done(&ctxt).unwrap();
		assert_eq!(page.slot_index(), 0);
		assert_eq!(cache.stats.hits.load(O::Relaxed), 2);
	}
}
