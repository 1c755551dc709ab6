use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use pagecache::{Config, ConfigBuilder, FileIoDevice, InMemoryAllocator, PageCache, PageType, ThreadRegistry};

fn config() -> Config {
	ConfigBuilder::default().page_size(4096).build().unwrap()
}

fn make_cache() -> PageCache<FileIoDevice> {
	PageCache::new(
		config(),
		FileIoDevice::new(tempfile::tempfile().unwrap()),
		InMemoryAllocator::new(1 << 30),
		ThreadRegistry::new(),
	)
}

/// Alloc, write, release the whole lock ladder, force a blocking sync,
/// evict everything, then read the page back cold.
#[test]
fn write_then_sync_then_evict_then_read_back() {
	let cache = make_cache();

	let write = cache.alloc(0, PageType::Trunk);
	write.data_mut().fill(0xA5);
	let claim = cache.unlock(write);
	let read = cache.unclaim(claim);
	cache.unget(read);

	cache.page_sync(0, true);
	cache.evict_all(false);

	let page = cache.get(0, true, PageType::Trunk).unwrap();
	assert!(page.data().iter().all(|&b| b == 0xA5));
}

/// Two threads race a cold `get` on the same address; exactly one of
/// them issues the read, both observe the same contents and address,
/// and both leave the slot clean and unreferenced after `unget`.
#[test]
fn concurrent_cold_get_on_same_address_shares_one_read() {
	let cache = Arc::new(make_cache());
	let reads_issued_before = cache.stats().reads_issued.load(Ordering::Relaxed);

	let barrier = Arc::new(std::sync::Barrier::new(2));
	let mut handles = Vec::new();
	for _ in 0..2 {
		let cache = Arc::clone(&cache);
		let barrier = Arc::clone(&barrier);
		handles.push(thread::spawn(move || {
			barrier.wait();
			let page = cache.get(4096, true, PageType::Branch).unwrap();
			let addr = page.disk_addr();
			cache.unget(page);
			addr
		}));
	}

	let addrs: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
	assert_eq!(addrs, vec![4096, 4096]);
	assert_eq!(cache.stats().reads_issued.load(Ordering::Relaxed) - reads_issued_before, 1);
}

/// A claimer's `lock` blocks until the read-ref holder releases, then
/// proceeds within a bounded number of spins.
#[test]
fn lock_blocks_until_reader_releases() {
	let cache = Arc::new(make_cache());

	let write = cache.alloc(8192, PageType::Trunk);
	let claim = cache.unlock(write);
	let read_for_claimer = cache.unclaim(claim);
	cache.unget(read_for_claimer);

	let reader = cache.get(8192, true, PageType::Trunk).unwrap();

	let cache2 = Arc::clone(&cache);
	let locker = thread::spawn(move || {
		let claim = loop {
			if let Ok(claim) = cache2.claim(cache2.get(8192, true, PageType::Trunk).unwrap()) {
				break claim;
			}
		};
		let write = cache2.lock(claim);
		cache2.unlock(write);
	});

	thread::sleep(std::time::Duration::from_millis(20));
	cache.unget(reader);
	locker.join().unwrap();
}

/// Dirtying four contiguous pages in one extent and calling
/// `extent_sync` coalesces them into a single vectored write.
#[test]
fn extent_sync_coalesces_contiguous_dirty_pages() {
	let cache = make_cache();
	let extent_base = 0u64;

	for i in 0..4u64 {
		let addr = extent_base + i * 4096;
		let write = cache.alloc(addr, PageType::Branch);
		cache.unlock(write);
	}

	let outstanding = AtomicUsize::new(0);
	cache.extent_sync(extent_base, &outstanding);
	cache.wait();

	assert_eq!(outstanding.load(Ordering::Acquire), 4);
	for i in 0..4u64 {
		let page = cache.get(extent_base + i * 4096, true, PageType::Branch).unwrap();
		assert_ne!(page.page_type(), PageType::Invalid);
	}
}

/// Prefetching an empty 8-page extent issues one vectored read, and
/// every subsequent `get` inside that extent is a pure hit.
#[test]
fn prefetch_then_get_issues_no_further_reads() {
	let config = ConfigBuilder::default().page_size(4096).extent_size(4096 * 8).build().unwrap();
	let cache = PageCache::new(
		config,
		FileIoDevice::new(tempfile::tempfile().unwrap()),
		InMemoryAllocator::new(1 << 30),
		ThreadRegistry::new(),
	);
	let extent_base = 0u64;

	cache.prefetch(extent_base, PageType::Memtable);
	let reads_after_prefetch = cache.stats().reads_issued.load(Ordering::Relaxed);
	assert_eq!(reads_after_prefetch, 1);

	for i in 0..8u64 {
		let page = cache.get(extent_base + i * 4096, true, PageType::Memtable).unwrap();
		cache.unget(page);
	}

	assert_eq!(cache.stats().reads_issued.load(Ordering::Relaxed), reads_after_prefetch);
}

/// Filling the cache with clean, unreferenced pages and then asking for
/// one more address still succeeds, reclaiming a slot via the clock hand.
#[test]
fn get_under_full_cache_reclaims_a_slot() {
	let cache = make_cache();
	let capacity = cache.config().page_capacity;

	for i in 0..capacity as u64 {
		let addr = i * 4096;
		let write = cache.alloc(addr, PageType::Misc);
		write.data_mut().fill(0);
		let claim = cache.unlock(write);
		let read = cache.unclaim(claim);
		cache.unget(read);
		cache.page_sync(addr, true);
	}

	let new_addr = capacity as u64 * 4096;
	let page = cache.get(new_addr, true, PageType::Misc).unwrap();
	assert_eq!(page.disk_addr(), new_addr);
	cache.unget(page);

	assert!(cache.get_allocator_ref(0) >= 1);
}

/// Boundary behaviour: a single pinned slot survives `evict_all(true)`.
#[test]
fn evict_all_ignoring_pinned_leaves_pinned_slot_live() {
	let cache = make_cache();

	let write = cache.alloc(0, PageType::Trunk);
	cache.pin(&write);
	let claim = cache.unlock(write);
	let read = cache.unclaim(claim);
	cache.page_sync(0, true);
	cache.unget(read);

	cache.evict_all(true);

	let page = cache.get(0, false, PageType::Trunk);
	assert!(page.is_some());
}

/// Boundary behaviour: a non-blocking `get` on a write-locked page returns
/// `None` and leaves refcounts untouched.
#[test]
fn non_blocking_get_on_write_locked_page_is_null() {
	let cache = make_cache();

	let write = cache.alloc(0, PageType::Trunk);
	let reads_before =
		cache.stats().hits.load(Ordering::Relaxed) + cache.stats().misses.load(Ordering::Relaxed);

	assert!(cache.get(0, false, PageType::Trunk).is_none());
	assert_eq!(
		cache.stats().hits.load(Ordering::Relaxed) + cache.stats().misses.load(Ordering::Relaxed),
		reads_before
	);

	cache.unlock(write);
}
