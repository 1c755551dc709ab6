use crate::consts::{
	self, validate_extent_size, validate_page_size, ExtentSizeBoundsError, PageSizeBoundsError,
	BATCH_SIZE, CACHE_LINE, DEFAULT_CAPACITY, DEFAULT_CLEANER_GAP, DEFAULT_EXTENT_SIZE,
	DEFAULT_PAGE_SIZE, DEFAULT_REFCOUNT_WIDTH,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(transparent)]
	PageSize(#[from] PageSizeBoundsError),

	#[error(transparent)]
	ExtentSize(#[from] ExtentSizeBoundsError),

	#[error("capacity {capacity} is too small to hold even one full batch of {batch_slots} slots at page size {page_size}")]
	CapacityTooSmall {
		capacity: usize,
		page_size: usize,
		batch_slots: usize,
	},
}

/// User-supplied configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	pub page_size: usize,
	pub extent_size: usize,
	pub capacity: usize,
	pub cleaner_gap: usize,
	pub use_stats: bool,
	pub refcount_width: usize,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self {
			page_size: DEFAULT_PAGE_SIZE,
			extent_size: DEFAULT_EXTENT_SIZE,
			capacity: DEFAULT_CAPACITY,
			cleaner_gap: DEFAULT_CLEANER_GAP,
			use_stats: true,
			refcount_width: DEFAULT_REFCOUNT_WIDTH,
		}
	}
}

impl ConfigBuilder {
	pub fn page_size(mut self, page_size: usize) -> Self {
		self.page_size = page_size;
		self
	}

	pub fn extent_size(mut self, extent_size: usize) -> Self {
		self.extent_size = extent_size;
		self
	}

	pub fn capacity(mut self, capacity: usize) -> Self {
		self.capacity = capacity;
		self
	}

	pub fn cleaner_gap(mut self, batches: usize) -> Self {
		self.cleaner_gap = batches;
		self
	}

	pub fn use_stats(mut self, use_stats: bool) -> Self {
		self.use_stats = use_stats;
		self
	}

	pub fn build(self) -> Result<Config, ConfigError> {
		validate_page_size(self.page_size)?;
		validate_extent_size(self.extent_size, self.page_size)?;

		// page_capacity rounded down to a multiple of cache_line^2, to keep
		// the refcount transpose block fully populated.
		let cache_line_sq = CACHE_LINE * CACHE_LINE;
		let raw_page_capacity = self.capacity / self.page_size;
		let page_capacity = (raw_page_capacity / cache_line_sq) * cache_line_sq;

		if page_capacity < BATCH_SIZE {
			return Err(ConfigError::CapacityTooSmall {
				capacity: self.capacity,
				page_size: self.page_size,
				batch_slots: BATCH_SIZE,
			});
		}

		let batch_capacity = page_capacity / BATCH_SIZE;
		let log_page_size = self.page_size.ilog2() as u32;
		let pages_per_extent = self.extent_size / self.page_size;

		Ok(Config {
			page_size: self.page_size,
			log_page_size,
			extent_size: self.extent_size,
			pages_per_extent,
			page_capacity,
			batch_capacity,
			cleaner_gap: self.cleaner_gap.max(1).min(batch_capacity.saturating_sub(1).max(1)),
			use_stats: self.use_stats,
			refcount_width: self.refcount_width.min(consts::CACHE_LINE).max(1),
		})
	}
}

/// Fully validated, derived configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
	pub page_size: usize,
	pub log_page_size: u32,
	pub extent_size: usize,
	pub pages_per_extent: usize,
	pub page_capacity: usize,
	pub batch_capacity: usize,
	pub cleaner_gap: usize,
	pub use_stats: bool,
	pub refcount_width: usize,
}

impl Config {
	#[inline]
	pub fn page_number(&self, addr: u64) -> usize {
		(addr >> self.log_page_size) as usize
	}

	#[inline]
	pub fn extent_base(&self, addr: u64) -> u64 {
		addr - (addr % self.extent_size as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builds_with_defaults() {
		let config = ConfigBuilder::default().build().unwrap();
		assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
		assert!(config.page_capacity >= BATCH_SIZE);
		assert_eq!(config.batch_capacity * BATCH_SIZE, config.page_capacity);
	}

	#[test]
	fn rejects_too_small_capacity() {
		let result = ConfigBuilder::default()
			.page_size(4096)
			.capacity(4096 * 2)
			.build();
		assert!(result.is_err());
	}

	#[test]
	fn page_number_roundtrip() {
		let config = ConfigBuilder::default().page_size(4096).build().unwrap();
		assert_eq!(config.page_number(4096 * 7), 7);
	}
}
