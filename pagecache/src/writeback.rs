use crate::allocator::Allocator;
use crate::consts::BATCH_SIZE;
use crate::io_device::{IoDevice, IoVecRequest};
use crate::slot;
use crate::thread_id::ThreadIds;

use super::cache::PageCache;

const NOT_CLEAN_MASK: u32 = slot::CLEAN | slot::WRITEBACK | slot::LOADING | slot::WRITELOCKED | slot::CLAIMED | slot::FREE;

impl<Io: IoDevice, A: Allocator, T: ThreadIds> PageCache<Io, A, T> {
	/// True if status is dirty-and-not-accessed, or (with_access and)
	/// dirty-and-accessed.
	pub(crate) fn ok_to_writeback(&self, slot_index: usize, with_access: bool) -> bool {
		Self::status_ok_to_writeback(self.slots[slot_index].status(), with_access)
	}

	fn status_ok_to_writeback(status: u32, with_access: bool) -> bool {
		if status & NOT_CLEAN_MASK != 0 {
			return false;
		}
		let accessed = status & slot::ACCESSED != 0;
		!accessed || with_access
	}

	/// CAS from the precise dirty status word to the same word with
	/// WRITEBACK set, touching no other bit.
	pub(crate) fn try_set_writeback(&self, slot_index: usize, with_access: bool) -> bool {
		let slot = &self.slots[slot_index];
		let current = slot.status();
		if !Self::status_ok_to_writeback(current, with_access) {
			return false;
		}
		slot.cas_status(current, current | slot::WRITEBACK).is_ok()
	}

	fn extent_base_of(&self, addr: u64) -> u64 {
		self.config.extent_base(addr)
	}

	/// Extend a single writeback-marked slot to the full contiguous run of
	/// writeback-markable pages within its extent: walk backward, then
	/// forward, stopping at the first page that is unmapped, outside the
	/// extent, or can't be CAS'd into WRITEBACK.
	fn coalesce_run(&self, slot_index: usize) -> Vec<usize> {
		let base_addr = self.slots[slot_index].disk_addr();
		let extent_base = self.extent_base_of(base_addr);
		let page_size = self.config.page_size as u64;

		let mut run = vec![slot_index];

		let mut addr = base_addr;
		while addr > extent_base {
			let prev_addr = addr - page_size;
			let page_number = self.page_number(prev_addr);
			let candidate = self.lookup.get(page_number);
			if candidate == crate::lookup::UNMAPPED_ENTRY {
				break;
			}
			if self.slots[candidate].disk_addr() != prev_addr {
				break;
			}
			if !self.try_set_writeback(candidate, true) {
				break;
			}
			run.insert(0, candidate);
			addr = prev_addr;
		}

		let extent_end = extent_base + self.config.extent_size as u64;
		let mut addr = base_addr + page_size;
		while addr < extent_end {
			let page_number = self.page_number(addr);
			let candidate = self.lookup.get(page_number);
			if candidate == crate::lookup::UNMAPPED_ENTRY {
				break;
			}
			if self.slots[candidate].disk_addr() != addr {
				break;
			}
			if !self.try_set_writeback(candidate, true) {
				break;
			}
			run.push(candidate);
			addr += page_size;
		}

		run
	}

	fn submit_writeback_run(&self, run: Vec<usize>) {
		if run.is_empty() {
			return;
		}
		let first_addr = self.slots[run[0]].disk_addr();
		if run.len() == 1 {
			let slot_index = run[0];
			self.io.submit_write(slot_index, self.slots[slot_index].data.as_slice(), first_addr);
		} else {
			// Safety: each slot's buffer is exclusively owned by the I/O
			// subsystem between WRITEBACK being set and the completion
			// callback clearing it; no other reference to these buffers is
			// live while this request is outstanding.
			let bufs: Vec<&mut [u8]> = run
				.iter()
				.map(|&slot_index| {
					let slot_ptr = &self.slots[slot_index] as *const crate::slot::Slot as *mut crate::slot::Slot;
					unsafe { (*slot_ptr).data.as_slice_mut() }
				})
				.collect();
			self.io.submit_writev(run.clone(), IoVecRequest { offset: first_addr, bufs });
		}
		self.stats.record_write_issued();
	}

	/// For each slot CAS'd into WRITEBACK, extend to the full extent run
	/// and submit one coalesced write. Slots skipped only because they are
	/// dirty-and-accessed on a non-urgent pass lose their second chance,
	/// matching the cleaner's batch-local ACCESSED clear.
	pub(crate) fn batch_start_writeback(&self, batch: usize, urgent: bool) {
		let start = batch * BATCH_SIZE;
		let end = (start + BATCH_SIZE).min(self.slots.len());
		for slot_index in start..end {
			if self.try_set_writeback(slot_index, urgent) {
				let run = self.coalesce_run(slot_index);
				self.submit_writeback_run(run);
				continue;
			}
			if !urgent {
				let status = self.slots[slot_index].status();
				let dirty_unlocked = status & NOT_CLEAN_MASK == 0;
				if dirty_unlocked && status & slot::ACCESSED != 0 {
					self.slots[slot_index].test_and_test_and_clear(slot::ACCESSED);
				}
			}
		}
	}

	/// Drain outstanding I/O, force-writeback every batch (urgent,
	/// ignoring the second-chance bit), drain again, then every slot
	/// must be CLEAN.
	pub fn flush(&self) {
		self.drain_io_completely();
		for batch in 0..self.config.batch_capacity {
			self.batch_start_writeback(batch, true);
		}
		self.drain_io_completely();
		debug_assert!(
			self.slots.iter().all(|slot| slot.is_clean() || slot.is_free()),
			"flush left a non-clean, non-free slot behind"
		);
	}

	/// Takes a bare slot index rather than an address because callers here
	/// (the clock hand, coalescing, extent sync) already have the index in
	/// hand; `PageCache::page_sync` is the public, address-taking wrapper
	/// every external caller should use instead.
	pub(crate) fn page_sync_slot(&self, slot_index: usize, blocking: bool) {
		if !self.try_set_writeback(slot_index, true) {
			return;
		}
		let slot = &self.slots[slot_index];
		let addr = slot.disk_addr();
		if blocking {
			self.io
				.write_at(slot.data.as_slice(), addr)
				.unwrap_or_else(|source| {
					self.fatal(crate::error::FatalError::IoFailed { op: "write", addr, source })
				});
			slot.clear_flag(slot::WRITEBACK);
			slot.set_flag(slot::CLEAN);
			self.stats.record_writeback();
		} else {
			self.submit_writeback_run(vec![slot_index]);
		}
	}

	/// For each page of the extent that is present and transitions into
	/// WRITEBACK, accumulate into a running vector; flush and restart on
	/// the first unmapped or uncleanable page.
	pub fn extent_sync(&self, base_addr: u64, pages_outstanding: &std::sync::atomic::AtomicUsize) {
		let page_size = self.config.page_size as u64;
		let mut run = Vec::new();

		for i in 0..self.config.pages_per_extent {
			let addr = base_addr + i as u64 * page_size;
			let page_number = self.page_number(addr);
			let candidate = self.lookup.get(page_number);

			let transitioned = candidate != crate::lookup::UNMAPPED_ENTRY
				&& self.slots[candidate].disk_addr() == addr
				&& self.try_set_writeback(candidate, true);

			if transitioned {
				run.push(candidate);
				continue;
			}

			if !run.is_empty() {
				pages_outstanding.fetch_add(run.len(), std::sync::atomic::Ordering::AcqRel);
				self.submit_writeback_run(std::mem::take(&mut run));
			}
		}

		if !run.is_empty() {
			pages_outstanding.fetch_add(run.len(), std::sync::atomic::Ordering::AcqRel);
			self.submit_writeback_run(run);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigBuilder;
	use crate::io_device::MockIoDevice;
	use crate::thread_id::ThreadRegistry;
	use mockall::predicate::*;

	fn make_cache(io: MockIoDevice) -> PageCache<MockIoDevice> {
		let config = ConfigBuilder::default().page_size(4096).build().unwrap();
		PageCache::new(config, io, crate::allocator::InMemoryAllocator::new(1 << 30), ThreadRegistry::new())
	}

	#[test]
	fn ok_to_writeback_requires_dirty_unclaimed() {
		let cache = make_cache(MockIoDevice::new());
		cache.slots[0].clear_flag(slot::FREE);
		assert!(cache.ok_to_writeback(0, false));
		cache.slots[0].set_flag(slot::CLEAN);
		assert!(!cache.ok_to_writeback(0, false));
	}

	#[test]
	fn try_set_writeback_only_touches_writeback_bit() {
		let cache = make_cache(MockIoDevice::new());
		cache.slots[0].clear_flag(slot::FREE);
		cache.slots[0].set_flag(slot::ACCESSED);
		assert!(!cache.try_set_writeback(0, false));
		assert!(cache.try_set_writeback(0, true));
		assert!(cache.slots[0].test_flag(slot::WRITEBACK | slot::ACCESSED));
	}

	#[test]
	fn coalesces_four_contiguous_dirty_pages_into_one_write() {
		let mut io = MockIoDevice::new();
		io.expect_submit_writev()
			.withf(|slots, req| slots.len() == 4 && req.bufs.len() == 4)
			.times(1)
			.return_const(());

		let cache = make_cache(io);
		for i in 0..4u64 {
			let addr = i * 4096;
			let page_number = cache.page_number(addr);
			cache.lookup.try_publish(page_number, i as usize).unwrap();
			cache.slots[i as usize].clear_flag(slot::FREE);
			cache.slots[i as usize].set_disk_addr(addr);
		}

		cache.batch_start_writeback(0, true);
	}

	#[test]
	fn non_urgent_pass_clears_second_chance_on_accessed_dirty_page() {
		let cache = make_cache(MockIoDevice::new());
		cache.slots[0].clear_flag(slot::FREE);
		cache.slots[0].set_flag(slot::ACCESSED);
		cache.slots[0].set_disk_addr(0);

		cache.batch_start_writeback(0, false);

		assert!(!cache.slots[0].test_flag(slot::ACCESSED));
		assert!(!cache.slots[0].test_flag(slot::WRITEBACK));
	}
}
