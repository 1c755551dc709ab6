use std::thread;
use std::time::Duration;

use crate::error::{ClaimOutcome, ReadOutcome, WriteOutcome};
use crate::refcount::RefcountMatrix;
use crate::slot::{self, Slot};

const BACKOFF_START: Duration = Duration::from_nanos(500);
const BACKOFF_CAP: Duration = Duration::from_millis(2);

/// Everything the lock ladder needs from the owning cache: the slot array,
/// the refcount matrix, the caller's thread id, and a way to drive I/O
/// completions forward while spinning. `PageCache` implements this; it is
/// split out so `lock` has no dependency on the `Io`/`Allocator`/`ThreadIds`
/// type parameters `PageCache` carries.
pub trait LockDomain {
	fn slot(&self, index: usize) -> &Slot;
	fn refcounts(&self) -> &RefcountMatrix;
	fn thread_id(&self) -> u32;
	/// Poll the I/O collaborator for completions, unblocking WRITEBACK or
	/// LOADING waits even with no dedicated I/O thread.
	fn drive_io_progress(&self);
}

fn backoff(attempt: u32) -> Duration {
	let scaled = BACKOFF_START.saturating_mul(1 << attempt.min(16));
	scaled.min(BACKOFF_CAP)
}

/// Held while the caller has a counted read reference on a slot.
/// Dropping releases the reference via `dec_ref`.
pub struct ReadGuard<'a, D: LockDomain> {
	domain: &'a D,
	slot: usize,
}

impl<'a, D: LockDomain> ReadGuard<'a, D> {
	#[inline]
	pub fn slot_index(&self) -> usize {
		self.slot
	}

	#[inline]
	pub(crate) fn slot(&self) -> &'a Slot {
		self.domain.slot(self.slot)
	}

	/// The page's disk address: stable once a read ref is held, modulo
	/// the LOADING re-check `get_internal` already performs.
	#[inline]
	pub fn disk_addr(&self) -> u64 {
		self.slot().disk_addr()
	}

	/// The page-type tag passed to `alloc`/`get`/`prefetch`.
	#[inline]
	pub fn page_type(&self) -> crate::page_type::PageType {
		self.slot().page_type()
	}

	/// Read-only view of the page's contents. Sound for any read-ref
	/// holder — read-ref holders may only read data, never mutate it.
	#[inline]
	pub fn data(&self) -> &[u8] {
		self.slot().data.as_slice()
	}

	/// Atomic fetch-or on CLAIMED. On conflict the read ref is handed back
	/// to the caller, which must drop it before retrying the claim — two
	/// read-holders both retrying while holding their ref can starve each
	/// other forever.
	pub fn try_claim(self) -> Result<ClaimGuard<'a, D>, Self> {
		let slot = self.domain.slot(self.slot);
		let prior = slot.set_flag(slot::CLAIMED);
		if prior & slot::CLAIMED == 0 {
			Ok(ClaimGuard { read: self })
		} else {
			Err(self)
		}
	}
}

impl<'a, D: LockDomain> Drop for ReadGuard<'a, D> {
	fn drop(&mut self) {
		self.domain.refcounts().dec_ref(self.slot, self.domain.thread_id());
	}
}

/// Backdoor constructors for callers that already hold the equivalent
/// lock state directly — the free-slot acquirer CASes a slot's full
/// status word and bumps its own refcount cell in one step, so
/// `alloc`/a `get` miss need a guard chain that matches that state rather
/// than re-running the ladder from scratch.
impl<'a, D: LockDomain> ReadGuard<'a, D> {
	pub(crate) fn from_owned(domain: &'a D, slot_index: usize) -> Self {
		Self { domain, slot: slot_index }
	}
}

impl<'a, D: LockDomain> ClaimGuard<'a, D> {
	pub(crate) fn from_owned(domain: &'a D, slot_index: usize) -> Self {
		Self { read: ReadGuard::from_owned(domain, slot_index) }
	}
}

impl<'a, D: LockDomain> WriteGuard<'a, D> {
	pub(crate) fn from_owned(domain: &'a D, slot_index: usize) -> Self {
		Self { claim: ClaimGuard::from_owned(domain, slot_index) }
	}
}

/// Test WRITELOCKED fast-path, take a ref, re-verify FREE/WRITELOCKED,
/// optionally set ACCESSED.
pub fn try_get_read<'a, D: LockDomain>(
	domain: &'a D,
	slot_index: usize,
	set_access: bool,
) -> Result<ReadGuard<'a, D>, ReadOutcome> {
	let slot = domain.slot(slot_index);
	if slot.is_writelocked() {
		return Err(ReadOutcome::Conflict);
	}
	domain
		.refcounts()
		.inc_ref(slot_index, domain.thread_id())
		.unwrap_or_else(|overflow| {
			panic!("refcount overflow acquiring read on slot {}: {overflow:?}", slot_index)
		});

	if slot.is_free() {
		domain.refcounts().dec_ref(slot_index, domain.thread_id());
		return Err(ReadOutcome::Evicted);
	}
	if slot.is_writelocked() {
		domain.refcounts().dec_ref(slot_index, domain.thread_id());
		return Err(ReadOutcome::Conflict);
	}
	if set_access {
		slot.test_and_test_and_set(slot::ACCESSED);
	}
	Ok(ReadGuard { domain, slot: slot_index })
}

/// Like `try_get_read` but retries CONFLICT with capped exponential
/// backoff. Still surfaces EVICTED (`None`) so the caller redoes the
/// full lookup.
pub fn get_read<'a, D: LockDomain>(domain: &'a D, slot_index: usize, set_access: bool) -> Option<ReadGuard<'a, D>> {
	let mut attempt = 0u32;
	loop {
		match try_get_read(domain, slot_index, set_access) {
			Ok(guard) => return Some(guard),
			Err(ReadOutcome::Evicted) => return None,
			Err(ReadOutcome::Conflict) => {
				thread::sleep(backoff(attempt));
				attempt = attempt.saturating_add(1);
			}
			Err(ReadOutcome::Success) => unreachable!("try_get_read never errors with Success"),
		}
	}
}

/// Held while the caller has claimed a slot (exclusive intention to write,
/// does not block readers). Internally still owns the read reference, so
/// dropping releases claim-then-read in the required order.
pub struct ClaimGuard<'a, D: LockDomain> {
	read: ReadGuard<'a, D>,
}

impl<'a, D: LockDomain> ClaimGuard<'a, D> {
	#[inline]
	pub fn slot_index(&self) -> usize {
		self.read.slot
	}

	#[inline]
	pub(crate) fn slot(&self) -> &'a Slot {
		self.read.slot()
	}

	/// The page's disk address; see `ReadGuard::disk_addr`.
	#[inline]
	pub fn disk_addr(&self) -> u64 {
		self.read.disk_addr()
	}

	/// The page-type tag passed to `alloc`/`get`/`prefetch`.
	#[inline]
	pub fn page_type(&self) -> crate::page_type::PageType {
		self.read.page_type()
	}

	/// Read-only view of the page's contents; still shared with any other
	/// read-ref holder until `get_write` is called.
	#[inline]
	pub fn data(&self) -> &[u8] {
		self.read.data()
	}

	/// `unclaim`: drop the claim, keep the read reference.
	pub fn unclaim(self) -> ReadGuard<'a, D> {
		self.read.slot().clear_flag(slot::CLAIMED);
		self.read
	}

	fn other_refs_present(&self) -> bool {
		let domain = self.read.domain;
		let slot = self.read.slot;
		let thr = domain.thread_id();
		domain.refcounts().sum_other_refs(slot, thr) > 0 || domain.refcounts().get_ref(slot, thr) > 1
	}

	/// Set WRITELOCKED, wait out WRITEBACK, then wait for every refcount
	/// column but the caller's own to drain (and the caller's own to drop
	/// to at most the one ref it already holds). Never fails — the caller
	/// blocks until it can proceed.
	pub fn get_write(self) -> WriteGuard<'a, D> {
		let domain = self.read.domain;
		let slot = self.read.slot();
		slot.set_flag(slot::WRITELOCKED);

		let mut attempt = 0u32;
		while slot.is_writeback() {
			domain.drive_io_progress();
			thread::sleep(backoff(attempt));
			attempt = attempt.saturating_add(1);
		}

		attempt = 0;
		while self.other_refs_present() {
			domain.drive_io_progress();
			thread::sleep(backoff(attempt));
			attempt = attempt.saturating_add(1);
		}

		WriteGuard { claim: self }
	}

	/// `try_get_write`: same precondition, fails without blocking. Rolls
	/// WRITELOCKED back on failure; the claim itself is retained by the
	/// caller either way.
	pub fn try_get_write(self) -> Result<WriteGuard<'a, D>, (Self, WriteOutcome)> {
		let slot = self.read.slot();
		slot.set_flag(slot::WRITELOCKED);

		if slot.is_writeback() {
			slot.clear_flag(slot::WRITELOCKED);
			return Err((self, WriteOutcome::Flushing));
		}
		if self.other_refs_present() {
			slot.clear_flag(slot::WRITELOCKED);
			return Err((self, WriteOutcome::Conflict));
		}
		Ok(WriteGuard { claim: self })
	}
}

impl<'a, D: LockDomain> Drop for ClaimGuard<'a, D> {
	fn drop(&mut self) {
		self.read.slot().clear_flag(slot::CLAIMED);
	}
}

/// Held while the caller holds the exclusive write lock. Dropping releases
/// write, then claim, then read — exactly the required release order,
/// enforced here by nested ownership rather than by caller discipline.
pub struct WriteGuard<'a, D: LockDomain> {
	claim: ClaimGuard<'a, D>,
}

impl<'a, D: LockDomain> WriteGuard<'a, D> {
	#[inline]
	pub fn slot_index(&self) -> usize {
		self.claim.slot_index()
	}

	#[inline]
	pub(crate) fn slot(&self) -> &'a Slot {
		self.claim.slot()
	}

	/// The page's disk address; see `ReadGuard::disk_addr`.
	#[inline]
	pub fn disk_addr(&self) -> u64 {
		self.claim.disk_addr()
	}

	/// The page-type tag passed to `alloc`/`get`/`prefetch`.
	#[inline]
	pub fn page_type(&self) -> crate::page_type::PageType {
		self.claim.page_type()
	}

	/// Read-only view of the page's contents.
	#[inline]
	pub fn data(&self) -> &[u8] {
		self.slot().data.as_slice()
	}

	/// Exclusive, mutable view of the page's contents. Sound because the
	/// write lock guarantees this caller is the only holder of
	/// any reference into the slot's buffer.
	#[inline]
	#[allow(clippy::mut_from_ref)]
	pub fn data_mut(&self) -> &mut [u8] {
		let slot_ptr = self.slot() as *const Slot as *mut Slot;
		unsafe { (*slot_ptr).data.as_slice_mut() }
	}

	/// `unlock`: drop the write lock, keep claim and read.
	pub fn unlock(self) -> ClaimGuard<'a, D> {
		self.claim.slot().clear_flag(slot::WRITELOCKED);
		self.claim
	}
}

impl<'a, D: LockDomain> Drop for WriteGuard<'a, D> {
	fn drop(&mut self) {
		self.claim.slot().clear_flag(slot::WRITELOCKED);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigBuilder;
	use crate::slot::Slot;
	use std::sync::atomic::AtomicU32;

	struct TestDomain {
		slots: Vec<Slot>,
		refcounts: RefcountMatrix,
		thread_id: AtomicU32,
	}

	impl TestDomain {
		fn new() -> Self {
			let config = ConfigBuilder::default().build().unwrap();
			let slots: Vec<Slot> = (0..config.page_capacity).map(|_| Slot::new(config.page_size)).collect();
			Self {
				refcounts: RefcountMatrix::new(config.refcount_width, config.page_capacity),
				slots,
				thread_id: AtomicU32::new(0),
			}
		}
	}

	impl LockDomain for TestDomain {
		fn slot(&self, index: usize) -> &Slot {
			&self.slots[index]
		}
		fn refcounts(&self) -> &RefcountMatrix {
			&self.refcounts
		}
		fn thread_id(&self) -> u32 {
			self.thread_id.load(std::sync::atomic::Ordering::Relaxed)
		}
		fn drive_io_progress(&self) {}
	}

	#[test]
	fn read_then_claim_then_write_releases_in_order() {
		let domain = TestDomain::new();
		domain.slots[0].clear_flag(slot::FREE);
		domain.slots[0].set_flag(slot::CLEAN);

		let read = try_get_read(&domain, 0, true).unwrap();
		assert_eq!(domain.refcounts.sum_refs(0), 1);

		let claim = read.try_claim().unwrap();
		assert!(domain.slots[0].is_claimed());

		let write = claim.get_write();
		assert!(domain.slots[0].is_writelocked());

		drop(write);
		assert!(!domain.slots[0].is_writelocked());
		assert!(!domain.slots[0].is_claimed());
		assert_eq!(domain.refcounts.sum_refs(0), 0);
	}

	#[test]
	fn try_get_read_reports_conflict_on_writelocked() {
		let domain = TestDomain::new();
		domain.slots[0].clear_flag(slot::FREE);
		domain.slots[0].set_flag(slot::CLEAN | slot::WRITELOCKED);

		assert_eq!(try_get_read(&domain, 0, false).unwrap_err(), ReadOutcome::Conflict);
		assert_eq!(domain.refcounts.sum_refs(0), 0);
	}

	#[test]
	fn try_get_read_reports_evicted_on_free() {
		let domain = TestDomain::new();
		assert_eq!(try_get_read(&domain, 0, false).unwrap_err(), ReadOutcome::Evicted);
		assert_eq!(domain.refcounts.sum_refs(0), 0);
	}

	#[test]
	fn second_claim_conflicts_and_hands_back_read_ref() {
		let domain = TestDomain::new();
		domain.slots[0].clear_flag(slot::FREE);
		domain.slots[0].set_flag(slot::CLEAN);

		let read_a = try_get_read(&domain, 0, false).unwrap();
		let claim_a = read_a.try_claim().unwrap();

		let read_b = try_get_read(&domain, 0, false).unwrap();
		let read_b = read_b.try_claim().unwrap_err();
		assert_eq!(domain.refcounts.sum_refs(0), 2);

		drop(read_b);
		drop(claim_a);
		assert_eq!(domain.refcounts.sum_refs(0), 0);
	}

	#[test]
	fn try_get_write_conflicts_while_other_ref_held() {
		let domain = TestDomain::new();
		domain.slots[0].clear_flag(slot::FREE);
		domain.slots[0].set_flag(slot::CLEAN);

		let read_other = try_get_read(&domain, 0, false).unwrap();
		let read_self = try_get_read(&domain, 0, false).unwrap();
		let claim = read_self.try_claim().unwrap();

		let (claim, outcome) = claim.try_get_write().unwrap_err();
		assert_eq!(outcome, WriteOutcome::Conflict);
		assert!(!domain.slots[0].is_writelocked());

		drop(claim);
		drop(read_other);
	}
}
