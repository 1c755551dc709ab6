use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use static_assertions::assert_impl_all;

use crate::allocator::{Allocator, InMemoryAllocator};
use crate::config::Config;
use crate::error::FatalError;
use crate::io_device::{IoCompletion, IoDevice, IoOp};
use crate::lock::{ClaimGuard, LockDomain, ReadGuard, WriteGuard};
use crate::lookup::LookupTable;
use crate::refcount::RefcountMatrix;
use crate::slot::{self, Slot};
use crate::stats::Stats;
use crate::thread_id::{ThreadIds, ThreadRegistry};

/// Per-thread, per-cache-instance state: which batch this thread currently
/// owns for free-slot search, and whether synchronous `get` is disabled on
/// this thread. Keyed by the owning cache's identity so more than one
/// `PageCache` per process keeps independent hands.
pub(crate) struct PerThreadState {
	pub free_hand: Option<usize>,
	pub enable_sync_get: bool,
}

impl Default for PerThreadState {
	fn default() -> Self {
		Self {
			free_hand: None,
			enable_sync_get: true,
		}
	}
}

thread_local! {
	static THREAD_STATE: RefCell<HashMap<usize, PerThreadState>> = RefCell::new(HashMap::new());
}

pub(crate) fn with_thread_state<R>(cache_id: usize, f: impl FnOnce(&mut PerThreadState) -> R) -> R {
	THREAD_STATE.with(|state| {
		let mut state = state.borrow_mut();
		f(state.entry(cache_id).or_default())
	})
}

/// The external collaborators `PageCache` is generic over. `ThreadIds`
/// defaults to the process-wide registry, `Allocator` to the
/// in-memory reference implementation — both real implementations for
/// standalone use and swappable for a host system's own equivalents.
pub struct PageCache<Io: IoDevice, A: Allocator = InMemoryAllocator, T: ThreadIds = ThreadRegistry> {
	pub(crate) config: Config,
	pub(crate) slots: Box<[Slot]>,
	pub(crate) lookup: LookupTable,
	pub(crate) refcounts: RefcountMatrix,
	pub(crate) batch_busy: Box<[AtomicBool]>,
	pub(crate) clean_batch_busy: Box<[AtomicBool]>,
	pub(crate) evict_hand: AtomicUsize,
	pub(crate) io: Io,
	pub(crate) allocator: A,
	pub(crate) threads: T,
	pub(crate) stats: Stats,
}

#[cfg(test)]
assert_impl_all!(PageCache<crate::io_device::MockIoDevice>: Send, Sync);

impl<Io: IoDevice, A: Allocator, T: ThreadIds> PageCache<Io, A, T> {
	pub fn new(config: Config, io: Io, allocator: A, threads: T) -> Self {
		let slots: Vec<Slot> = (0..config.page_capacity).map(|_| Slot::new(config.page_size)).collect();
		let num_pages = (allocator.get_capacity() / config.page_size as u64) as usize;

		let mut batch_busy = Vec::with_capacity(config.batch_capacity);
		batch_busy.resize_with(config.batch_capacity, || AtomicBool::new(false));
		let mut clean_batch_busy = Vec::with_capacity(config.batch_capacity);
		clean_batch_busy.resize_with(config.batch_capacity, || AtomicBool::new(false));

		Self {
			refcounts: RefcountMatrix::new(config.refcount_width, config.page_capacity),
			slots: slots.into_boxed_slice(),
			lookup: LookupTable::new(num_pages.max(1)),
			batch_busy: batch_busy.into_boxed_slice(),
			clean_batch_busy: clean_batch_busy.into_boxed_slice(),
			evict_hand: AtomicUsize::new(0),
			stats: Stats::new(config.use_stats),
			config,
			io,
			allocator,
			threads,
		}
	}

	/// Identity used to key this instance's thread-local state — the
	/// address of the `PageCache` itself is stable for its lifetime.
	#[inline]
	pub(crate) fn id(&self) -> usize {
		self as *const Self as usize
	}

	#[inline]
	pub fn config(&self) -> &Config {
		&self.config
	}

	#[inline]
	pub fn stats(&self) -> &Stats {
		&self.stats
	}

	#[inline]
	pub(crate) fn page_number(&self, addr: u64) -> usize {
		self.config.page_number(addr)
	}

	/// Allocator-level refcount for the extent containing `addr`.
	pub fn get_allocator_ref(&self, addr: u64) -> u32 {
		let extent = self.config.extent_base(addr);
		self.allocator.get_refcount(extent)
	}

	/// Release the caller's read reference.
	pub fn unget(&self, guard: ReadGuard<'_, Self>) {
		drop(guard);
	}

	/// Attempt to promote a read reference to a claim.
	pub fn claim<'a>(&'a self, guard: ReadGuard<'a, Self>) -> Result<ClaimGuard<'a, Self>, ReadGuard<'a, Self>> {
		guard.try_claim()
	}

	/// Drop the claim, keeping the read reference.
	pub fn unclaim<'a>(&'a self, guard: ClaimGuard<'a, Self>) -> ReadGuard<'a, Self> {
		guard.unclaim()
	}

	/// Blocking upgrade from claim to write.
	pub fn lock<'a>(&'a self, guard: ClaimGuard<'a, Self>) -> WriteGuard<'a, Self> {
		guard.get_write()
	}

	/// Drop the write lock, keeping claim and read.
	pub fn unlock<'a>(&'a self, guard: WriteGuard<'a, Self>) -> ClaimGuard<'a, Self> {
		guard.unlock()
	}

	/// Clears CLEAN. Requires the caller to already hold at least a read
	/// reference, matching every other in-place status mutation in this
	/// module.
	pub fn mark_dirty(&self, guard: &ReadGuard<'_, Self>) {
		guard.slot().clear_flag(crate::slot::CLEAN);
	}

	/// Installs a non-evictable reference that survives unlock. Requires
	/// the write lock.
	pub fn pin(&self, guard: &WriteGuard<'_, Self>) {
		self.refcounts
			.pin(guard.slot_index())
			.unwrap_or_else(|overflow| panic!("pin overflow: {overflow:?}"));
	}

	pub fn unpin(&self, slot_index: usize) {
		self.refcounts.unpin(slot_index);
	}

	/// Force the page currently resident at `addr` to CLEAN, synchronously
	/// or by submitting one writeback. A no-op if `addr` is not resident.
	pub fn page_sync(&self, addr: u64, blocking: bool) {
		let page_number = self.page_number(addr);
		let slot_index = self.lookup.get(page_number);
		if slot_index == crate::lookup::UNMAPPED_ENTRY || self.slots[slot_index].disk_addr() != addr {
			return;
		}
		self.page_sync_slot(slot_index, blocking);
	}

	pub(crate) fn set_enable_sync_get(&self, enabled: bool) {
		with_thread_state(self.id(), |state| state.enable_sync_get = enabled);
	}

	pub(crate) fn sync_get_enabled(&self) -> bool {
		with_thread_state(self.id(), |state| state.enable_sync_get)
	}

	/// Apply completions returned by `IoDevice::cleanup`/`cleanup_all` to
	/// the slots they were tagged with: reads clear LOADING, writes clear
	/// WRITEBACK and set CLEAN. A failed completion is a fatal invariant
	/// violation — this layer never retries I/O.
	pub(crate) fn apply_completions(&self, completions: Vec<IoCompletion>) {
		for completion in completions {
			if let Err(source) = completion.result {
				self.fatal(FatalError::IoFailed {
					op: match completion.op {
						IoOp::Read => "read",
						IoOp::Write => "write",
					},
					addr: completion
						.slots
						.first()
						.map(|&s| self.slots[s].disk_addr())
						.unwrap_or(crate::slot::UNMAPPED_ADDR),
					source,
				});
			}

			match completion.op {
				IoOp::Read => {
					for slot_index in completion.slots {
						self.slots[slot_index].clear_flag(slot::LOADING);
					}
				}
				IoOp::Write => {
					for slot_index in completion.slots {
						let slot = &self.slots[slot_index];
						slot.clear_flag(slot::WRITEBACK);
						slot.set_flag(slot::CLEAN);
					}
					self.stats.record_writeback();
				}
			}
		}
	}

	/// Poll a bounded number of completions and apply them — one of the
	/// suspension points that drives I/O progress forward even with no
	/// dedicated I/O thread.
	pub(crate) fn drive_io_progress_bounded(&self, max_events: usize) {
		let completions = self.io.cleanup(max_events);
		self.apply_completions(completions);
	}

	/// Drain every outstanding completion.
	pub(crate) fn drain_io_completely(&self) {
		let completions = self.io.cleanup_all();
		self.apply_completions(completions);
	}

	/// Drive I/O progress without blocking on any particular slot. The same
	/// bounded poll every spin loop in `lock`/`fetch` already uses, exposed
	/// so a caller with no outstanding request of its own can still make
	/// the I/O collaborator progress (e.g. a dedicated polling thread).
	pub fn wait(&self) {
		self.drive_io_progress_bounded(16);
	}

	/// Log a full diagnostic dump of every slot's status and refcounts,
	/// then abort the process. The single call site every fatal condition
	/// in this crate funnels through.
	#[cold]
	pub(crate) fn fatal(&self, err: FatalError) -> ! {
		let dump = crate::stats::dump_diagnostics(self);
		log::error!("slot dump ({} slots) before abort: {:?}", dump.len(), dump);
		err.abort();
	}
}

impl<Io: IoDevice, A: Allocator, T: ThreadIds> LockDomain for PageCache<Io, A, T> {
	fn slot(&self, index: usize) -> &Slot {
		&self.slots[index]
	}

	fn refcounts(&self) -> &RefcountMatrix {
		&self.refcounts
	}

	fn thread_id(&self) -> u32 {
		self.threads.current()
	}

	fn drive_io_progress(&self) {
		self.drive_io_progress_bounded(16);
	}
}

/// `get`'s typestate-friendly return: either a held read reference, or
/// `None` for the non-blocking-on-conflict NULL case.
pub type GetResult<'a, Io, A, T> = Option<ReadGuard<'a, PageCache<Io, A, T>>>;
