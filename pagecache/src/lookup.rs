use std::sync::atomic::{AtomicUsize, Ordering};

/// Sentinel lookup-table entry meaning "no slot maps to this page number".
pub const UNMAPPED_ENTRY: usize = usize::MAX;

/// Dense address→slot mapping. Indexed by page number
/// (`disk_addr >> log_page_size`); entries are published with a CAS so
/// that concurrent misses on the same address deterministically elect one
/// loader, and cleared unconditionally — but only ever by the thread
/// holding the write lock on the slot being evicted.
pub struct LookupTable {
	entries: Box<[AtomicUsize]>,
}

impl LookupTable {
	pub fn new(num_pages: usize) -> Self {
		let mut entries = Vec::with_capacity(num_pages);
		entries.resize_with(num_pages, || AtomicUsize::new(UNMAPPED_ENTRY));
		Self {
			entries: entries.into_boxed_slice(),
		}
	}

	#[inline]
	pub fn get(&self, page_number: usize) -> usize {
		self.entries[page_number].load(Ordering::Acquire)
	}

	/// CAS-publish `slot` into `page_number`, succeeding only if the entry
	/// was still `UNMAPPED_ENTRY`. Losers must release their speculatively
	/// acquired free slot.
	pub fn try_publish(&self, page_number: usize, slot: usize) -> Result<(), usize> {
		self.entries[page_number]
			.compare_exchange(UNMAPPED_ENTRY, slot, Ordering::AcqRel, Ordering::Acquire)
			.map(|_| ())
	}

	/// Unconditional clear. Only valid while the caller holds the write
	/// lock on the slot previously mapped at `page_number`.
	pub fn clear(&self, page_number: usize) {
		self.entries[page_number].store(UNMAPPED_ENTRY, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn starts_unmapped() {
		let table = LookupTable::new(16);
		assert_eq!(table.get(3), UNMAPPED_ENTRY);
	}

	#[test]
	fn publish_elects_exactly_one_winner() {
		let table = LookupTable::new(16);
		assert!(table.try_publish(5, 42).is_ok());
		let loser = table.try_publish(5, 99);
		assert_eq!(loser, Err(42));
		assert_eq!(table.get(5), 42);
	}

	#[test]
	fn clear_resets_to_unmapped() {
		let table = LookupTable::new(16);
		table.try_publish(2, 7).unwrap();
		table.clear(2);
		assert_eq!(table.get(2), UNMAPPED_ENTRY);
	}
}
