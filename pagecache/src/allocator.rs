use std::collections::HashMap;

use parking_lot::Mutex;

#[cfg(test)]
use mockall::automock;

/// The extent allocator the cache core consumes. `dec_refcount`'s contract
/// is load bearing for `dealloc`: it returns the refcount *before*
/// decrementing, and a prior value of 1 means "this was the last external
/// reference, the extent's pages may now be reclaimed" — not yet "fully
/// freed", which the allocator signals by a second `dec_refcount` bringing
/// it to the true 0 it tracks internally.
#[cfg_attr(test, automock)]
pub trait Allocator: Send + Sync {
	/// Device capacity in bytes, used to size the lookup table.
	fn get_capacity(&self) -> u64;

	/// Current allocator-level refcount for the extent containing `addr`.
	fn get_refcount(&self, extent: u64) -> u32;

	/// Decrement the allocator-level refcount for `extent`, returning the
	/// value it held *before* the decrement.
	fn dec_refcount(&self, extent: u64) -> u32;
}

/// Simple in-memory reference `Allocator` for tests and standalone use:
/// every extent starts at refcount 1 the first time it is seen.
pub struct InMemoryAllocator {
	capacity: u64,
	refcounts: Mutex<HashMap<u64, u32>>,
}

impl InMemoryAllocator {
	pub fn new(capacity: u64) -> Self {
		Self {
			capacity,
			refcounts: Mutex::new(HashMap::new()),
		}
	}

	pub fn set_refcount(&self, extent: u64, count: u32) {
		self.refcounts.lock().insert(extent, count);
	}
}

impl Allocator for InMemoryAllocator {
	fn get_capacity(&self) -> u64 {
		self.capacity
	}

	fn get_refcount(&self, extent: u64) -> u32 {
		*self.refcounts.lock().entry(extent).or_insert(1)
	}

	fn dec_refcount(&self, extent: u64) -> u32 {
		let mut refcounts = self.refcounts.lock();
		let entry = refcounts.entry(extent).or_insert(1);
		let prior = *entry;
		*entry = prior.saturating_sub(1);
		prior
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unseen_extent_defaults_to_refcount_one() {
		let allocator = InMemoryAllocator::new(1 << 30);
		assert_eq!(allocator.get_refcount(4096), 1);
	}

	#[test]
	fn dec_refcount_returns_prior_value() {
		let allocator = InMemoryAllocator::new(1 << 30);
		allocator.set_refcount(4096, 3);
		assert_eq!(allocator.dec_refcount(4096), 3);
		assert_eq!(allocator.get_refcount(4096), 2);
	}

	#[test]
	fn dec_refcount_on_already_zero_extent_returns_zero() {
		let allocator = InMemoryAllocator::new(1 << 30);
		allocator.set_refcount(4096, 0);
		assert_eq!(allocator.dec_refcount(4096), 0);
	}
}
