use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use crate::consts::CACHE_LINE;

/// Striped refcount matrix plus the parallel pin-count array.
///
/// Logically a `[width][page_capacity]` matrix of small integers, one column
/// per (thread id mod width). Physically, within each thread's row, slots
/// are stored in cache-line-sized transposed blocks so that two adjacent
/// slot indices never land in the same cache line for a given thread's
/// column — the column/row swap that spreads a thread's cells for
/// adjacent slots across distinct cache lines.
pub struct RefcountMatrix {
	width: usize,
	page_capacity: usize,
	cells: Box<[AtomicI32]>,
	pins: Box<[AtomicU8]>,
}

/// A column index (`thread_id mod width`) has reached `i32::MAX` concurrent
/// increments on one slot without a matching decrement. Always a
/// programming bug (a leaked read ref), never a legitimate workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefcountOverflow {
	pub slot: usize,
	pub column: usize,
}

/// A pin count on one slot reached `u8::MAX`. Same bug class as
/// `RefcountOverflow`, just for the separate pin array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinOverflow {
	pub slot: usize,
}

impl RefcountMatrix {
	pub fn new(width: usize, page_capacity: usize) -> Self {
		let width = width.max(1);
		let mut cells = Vec::with_capacity(width * page_capacity);
		cells.resize_with(width * page_capacity, || AtomicI32::new(0));
		let mut pins = Vec::with_capacity(page_capacity);
		pins.resize_with(page_capacity, || AtomicU8::new(0));
		Self {
			width,
			page_capacity,
			cells: cells.into_boxed_slice(),
			pins: pins.into_boxed_slice(),
		}
	}

	/// Cache-line transpose within a block of `CACHE_LINE * CACHE_LINE`
	/// slots: `(column, row) = (slot mod CL, (slot / CL) mod CL)`, physical
	/// offset `column * CL + row`. `page_capacity` is always a multiple of
	/// `CACHE_LINE * CACHE_LINE` (enforced by `Config::build`), so every
	/// slot falls in a full block.
	#[inline]
	fn transpose(slot: usize) -> usize {
		let cl = CACHE_LINE;
		let block_size = cl * cl;
		let block = slot / block_size;
		let local = slot % block_size;
		let column = local % cl;
		let row = (local / cl) % cl;
		block * block_size + column * cl + row
	}

	#[inline]
	fn cell_index(&self, column: usize, slot: usize) -> usize {
		column * self.page_capacity + Self::transpose(slot)
	}

	#[inline]
	fn column_of(&self, thr: u32) -> usize {
		(thr as usize) % self.width
	}

	/// Increment the caller thread's refcount cell for `slot`.
	pub fn inc_ref(&self, slot: usize, thr: u32) -> Result<(), RefcountOverflow> {
		let column = self.column_of(thr);
		let cell = &self.cells[self.cell_index(column, slot)];
		let prior = cell.fetch_add(1, Ordering::AcqRel);
		if prior == i32::MAX {
			cell.fetch_sub(1, Ordering::AcqRel);
			return Err(RefcountOverflow { slot, column });
		}
		Ok(())
	}

	/// Decrement the caller thread's refcount cell for `slot`.
	pub fn dec_ref(&self, slot: usize, thr: u32) {
		let column = self.column_of(thr);
		let cell = &self.cells[self.cell_index(column, slot)];
		let prior = cell.fetch_sub(1, Ordering::AcqRel);
		debug_assert!(prior > 0, "refcount underflow on slot {slot} column {column}");
	}

	/// The caller thread's own refcount cell for `slot`.
	pub fn get_ref(&self, slot: usize, thr: u32) -> i32 {
		let column = self.column_of(thr);
		self.cells[self.cell_index(column, slot)].load(Ordering::Acquire)
	}

	/// Sum of every column's refcount cell for `slot`.
	pub fn sum_refs(&self, slot: usize) -> i32 {
		(0..self.width)
			.map(|column| self.cells[self.cell_index(column, slot)].load(Ordering::Acquire))
			.sum()
	}

	/// Sum of every column except the caller's own, used by `get_write`
	/// while it waits for its own column to drop to at most 1 and every
	/// other column to drain to 0, used while `get_write` waits.
	pub fn sum_other_refs(&self, slot: usize, thr: u32) -> i32 {
		let own = self.column_of(thr);
		(0..self.width)
			.filter(|&column| column != own)
			.map(|column| self.cells[self.cell_index(column, slot)].load(Ordering::Acquire))
			.sum()
	}

	pub fn pin(&self, slot: usize) -> Result<(), PinOverflow> {
		let prior = self.pins[slot].fetch_add(1, Ordering::AcqRel);
		if prior == u8::MAX {
			self.pins[slot].fetch_sub(1, Ordering::AcqRel);
			return Err(PinOverflow { slot });
		}
		Ok(())
	}

	pub fn unpin(&self, slot: usize) {
		let prior = self.pins[slot].fetch_sub(1, Ordering::AcqRel);
		debug_assert!(prior > 0, "pin underflow on slot {slot}");
	}

	pub fn pin_count(&self, slot: usize) -> u8 {
		self.pins[slot].load(Ordering::Acquire)
	}
}
