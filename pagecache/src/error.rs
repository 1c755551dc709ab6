use std::io;

use thiserror::Error;

/// Conditions the cache treats as fatal: it has detected a state that the
/// core cannot recover from locally, and the process must abort after
/// dumping diagnostics.
///
/// Every variant here corresponds to one of: free-slot exhaustion in
/// blocking mode, a failed I/O completion, or an allocator-contract
/// violation.
#[derive(Debug, Error)]
pub enum FatalError {
	#[error(
		"free-slot acquisition exhausted the device's max latency ({max_latency_ms} ms) \
		 without finding a reclaimable slot; cache capacity is {capacity} pages"
	)]
	FreeSlotExhausted { capacity: usize, max_latency_ms: u128 },

	#[error("I/O completion for {op} at address {addr} failed: {source}")]
	IoFailed {
		op: &'static str,
		addr: u64,
		#[source]
		source: io::Error,
	},

	#[error("allocator reported refcount {refcount} for extent {extent} during dealloc, expected >= 1")]
	AllocatorMisuse { extent: u64, refcount: u32 },
}

impl FatalError {
	/// Abort the process after the caller has logged a diagnostic dump.
	/// Never returns.
	#[cold]
	pub fn abort(self) -> ! {
		log::error!("fatal page cache error, aborting process: {self}");
		std::process::abort();
	}
}

/// Outcome of a read-lock acquisition attempt (`try_get_read`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
	Success,
	Conflict,
	Evicted,
}

/// Outcome of a claim-lock acquisition attempt (`try_get_claim`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
	Success,
	Conflict,
}

/// Outcome of a non-blocking write-lock acquisition attempt
/// (`try_get_write`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
	Success,
	Conflict,
	Flushing,
}

/// Outcome of `get_async`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncGetOutcome {
	Locked,
	NoReqs,
	Success,
	IoStarted,
}
