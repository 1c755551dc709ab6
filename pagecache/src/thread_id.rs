use std::{
	cell::RefCell,
	collections::HashMap,
	sync::atomic::{AtomicU32, Ordering},
	thread,
};

use parking_lot::RwLock;

#[cfg(test)]
use mockall::automock;

/// The task/thread system collaborator: hands out a stable small-integer
/// id per OS thread. The core only ever uses this id modulo the refcount
/// matrix width, so callers that back it with their own scheduler's
/// thread registry are free to recycle ids as threads come and go.
#[cfg_attr(test, automock)]
pub trait ThreadIds {
	/// The calling thread's stable small integer id.
	fn current(&self) -> u32;
}

/// Default, process-wide thread id registry. Lazily assigns the next free
/// small integer to each new `std::thread::ThreadId` it sees, the same
/// "grow a lock-guarded table behind an atomic fast-path" shape as
/// `PageLocker::ensure_has_lock`.
pub struct ThreadRegistry {
	next_id: AtomicU32,
	ids: RwLock<HashMap<thread::ThreadId, u32>>,
}

// Keyed by registry identity (its address), not just the OS thread, since a
// single thread may call `current()` on several independent `ThreadRegistry`s
// (e.g. one per `PageCache`) and each must assign from its own id space.
thread_local! {
	static CACHED_IDS: RefCell<HashMap<usize, u32>> = RefCell::new(HashMap::new());
}

impl ThreadRegistry {
	pub fn new() -> Self {
		Self {
			next_id: AtomicU32::new(0),
			ids: RwLock::new(HashMap::new()),
		}
	}

	fn assign(&self) -> u32 {
		let tid = thread::current().id();
		if let Some(&id) = self.ids.read().get(&tid) {
			return id;
		}
		let mut ids = self.ids.write();
		*ids.entry(tid).or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed))
	}
}

impl Default for ThreadRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl ThreadIds for ThreadRegistry {
	fn current(&self) -> u32 {
		let key = self as *const Self as usize;
		if let Some(id) = CACHED_IDS.with(|cache| cache.borrow().get(&key).copied()) {
			return id;
		}
		let id = self.assign();
		CACHED_IDS.with(|cache| cache.borrow_mut().insert(key, id));
		id
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::Arc, thread};

	use super::*;

	#[test]
	fn assigns_stable_id_within_thread() {
		let registry = ThreadRegistry::new();
		let a = registry.current();
		let b = registry.current();
		assert_eq!(a, b);
	}

	#[test]
	fn assigns_distinct_ids_across_threads() {
		let registry = Arc::new(ThreadRegistry::new());
		let mut handles = Vec::new();
		for _ in 0..8 {
			let registry = Arc::clone(&registry);
			handles.push(thread::spawn(move || registry.current()));
		}
		let ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		let mut sorted = ids.clone();
		sorted.sort_unstable();
		sorted.dedup();
		assert_eq!(sorted.len(), ids.len());
	}

	#[test]
	fn independent_registries_assign_independently_on_one_thread() {
		let first = ThreadRegistry::new();
		let second = ThreadRegistry::new();
		assert_eq!(first.current(), 0);
		assert_eq!(second.current(), 0);
		assert_eq!(first.current(), 0);
	}
}
