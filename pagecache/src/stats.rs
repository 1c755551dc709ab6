use std::sync::atomic::{AtomicU64, Ordering};

use byte_view::ByteView;

/// Running counters. Cheap relaxed increments; disabled entirely (no-ops)
/// when `Config::use_stats` is false, gating instrumentation behind a
/// config flag rather than a compile-time feature.
pub struct Stats {
	enabled: bool,
	pub hits: AtomicU64,
	pub misses: AtomicU64,
	pub evictions: AtomicU64,
	pub writebacks: AtomicU64,
	pub reads_issued: AtomicU64,
	pub writes_issued: AtomicU64,
	pub free_slot_passes: AtomicU64,
}

impl Stats {
	pub fn new(enabled: bool) -> Self {
		Self {
			enabled,
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
			writebacks: AtomicU64::new(0),
			reads_issued: AtomicU64::new(0),
			writes_issued: AtomicU64::new(0),
			free_slot_passes: AtomicU64::new(0),
		}
	}

	#[inline]
	fn bump(&self, counter: &AtomicU64) {
		if self.enabled {
			counter.fetch_add(1, Ordering::Relaxed);
		}
	}

	pub fn record_hit(&self) {
		self.bump(&self.hits);
	}

	pub fn record_miss(&self) {
		self.bump(&self.misses);
	}

	pub fn record_eviction(&self) {
		self.bump(&self.evictions);
	}

	pub fn record_writeback(&self) {
		self.bump(&self.writebacks);
	}

	pub fn record_read_issued(&self) {
		self.bump(&self.reads_issued);
	}

	pub fn record_write_issued(&self) {
		self.bump(&self.writes_issued);
	}

	pub fn record_free_slot_pass(&self) {
		self.bump(&self.free_slot_passes);
	}
}

/// Zero-copy snapshot of one slot's metadata, for the diagnostic dump a
/// fatal error logs before aborting. Derives `ByteView` for a zero-copy,
/// log-friendly layout instead of a persisted one.
#[derive(Debug, Clone, Copy, ByteView)]
#[repr(C)]
pub struct SlotSnapshot {
	pub slot_index: u32,
	pub disk_addr: u64,
	pub status: u32,
	pub page_type: u8,
	pub refcount_sum: i32,
	pub pin_count: u8,
}

/// Build the full diagnostic dump logged immediately before a fatal
/// abort. Never called on any successful path.
#[cold]
pub fn dump_diagnostics<Io, A, T>(cache: &crate::cache::PageCache<Io, A, T>) -> Vec<SlotSnapshot>
where
	Io: crate::io_device::IoDevice,
	A: crate::allocator::Allocator,
	T: crate::thread_id::ThreadIds,
{
	(0..cache.slots.len())
		.map(|index| {
			let slot = &cache.slots[index];
			SlotSnapshot {
				slot_index: index as u32,
				disk_addr: slot.disk_addr(),
				status: slot.status(),
				page_type: slot.page_type() as u8,
				refcount_sum: cache.refcounts.sum_refs(index),
				pin_count: cache.refcounts.pin_count(index),
			}
		})
		.collect()
}
