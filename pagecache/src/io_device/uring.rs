use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use io_uring::{opcode, types, IoUring};
use parking_lot::Mutex;

use super::{IoCompletion, IoDevice, IoOp, IoVecRequest};

/// One outstanding request: everything needed to translate a completion
/// queue entry back into an `IoCompletion` the cache can apply. `iovecs`
/// keeps the `libc::iovec` array (for vectored requests) alive until the
/// kernel has consumed it — the kernel reads the array itself during
/// submission for `Readv`/`Writev`, so it must outlive `submit`, not just
/// the call that built it.
struct Pending {
	op: IoOp,
	slots: Vec<usize>,
	iovecs: Option<Vec<libc::iovec>>,
}

/// `io_uring`-backed asynchronous `IoDevice`: real submission and
/// completion queues instead of `FileIoDevice`'s synchronous stand-in.
/// `submit_*` only enqueue; the kernel performs the I/O in the background
/// and `cleanup`/`cleanup_all` harvest whatever the completion queue has
/// ready.
pub struct UringIoDevice {
	file: File,
	ring: Mutex<IoUring>,
	pending: Mutex<HashMap<u64, Pending>>,
	next_id: AtomicU64,
	max_latency: Duration,
}

impl UringIoDevice {
	pub fn new(file: File, queue_depth: u32) -> io::Result<Self> {
		Self::with_max_latency(file, queue_depth, Duration::from_millis(50))
	}

	pub fn with_max_latency(file: File, queue_depth: u32, max_latency: Duration) -> io::Result<Self> {
		Ok(Self {
			file,
			ring: Mutex::new(IoUring::new(queue_depth)?),
			pending: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(0),
			max_latency,
		})
	}

	fn next_id(&self) -> u64 {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}

	fn fd(&self) -> types::Fd {
		types::Fd(self.file.as_raw_fd())
	}

	/// Push one submission queue entry and flush it to the kernel. Every
	/// caller's own completion-harvesting loop already drains the queue, so
	/// `submit_*` only need `submit()` (no `submit_and_wait`) to hand the
	/// entry to the kernel without blocking.
	fn push(&self, id: u64, entry: io_uring::squeue::Entry, pending: Pending) {
		self.pending.lock().insert(id, pending);
		let mut ring = self.ring.lock();
		// Safety: `entry` points at buffers owned by the slot(s) recorded in
		// `pending`, which stay LOADING/WRITEBACK (exclusively owned by this
		// I/O subsystem) until the matching completion is
		// applied and the entry is removed from `pending`.
		unsafe {
			ring.submission()
				.push(&entry)
				.expect("submission queue full — queue_depth too small for concurrent request volume");
		}
		ring.submit().expect("io_uring submit failed");
	}

	fn drain(&self, max_events: usize) -> Vec<IoCompletion> {
		let mut ring = self.ring.lock();
		let _ = ring.submit();
		let mut out = Vec::new();
		let mut pending = self.pending.lock();
		for cqe in ring.completion().take(max_events) {
			let Some(entry) = pending.remove(&cqe.user_data()) else {
				continue;
			};
			let result = if cqe.result() < 0 {
				Err(io::Error::from_raw_os_error(-cqe.result()))
			} else {
				Ok(())
			};
			out.push(IoCompletion { op: entry.op, slots: entry.slots, result });
		}
		out
	}
}

impl IoDevice for UringIoDevice {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
		use std::os::unix::fs::FileExt;
		self.file.read_exact_at(buf, offset)
	}

	fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
		use std::os::unix::fs::FileExt;
		self.file.write_all_at(buf, offset)
	}

	fn submit_read(&self, slot_index: usize, buf: &mut [u8], offset: u64) {
		let id = self.next_id();
		let entry = opcode::Read::new(self.fd(), buf.as_mut_ptr(), buf.len() as u32)
			.offset(offset)
			.build()
			.user_data(id);
		self.push(id, entry, Pending { op: IoOp::Read, slots: vec![slot_index], iovecs: None });
	}

	fn submit_write(&self, slot_index: usize, buf: &[u8], offset: u64) {
		let id = self.next_id();
		let entry = opcode::Write::new(self.fd(), buf.as_ptr(), buf.len() as u32)
			.offset(offset)
			.build()
			.user_data(id);
		self.push(id, entry, Pending { op: IoOp::Write, slots: vec![slot_index], iovecs: None });
	}

	fn submit_readv(&self, slots: Vec<usize>, req: IoVecRequest<'_>) {
		let id = self.next_id();
		let mut iovecs: Vec<libc::iovec> = req
			.bufs
			.iter()
			.map(|buf| libc::iovec {
				iov_base: buf.as_ptr() as *mut libc::c_void,
				iov_len: buf.len(),
			})
			.collect();
		let entry = opcode::Readv::new(self.fd(), iovecs.as_mut_ptr(), iovecs.len() as u32)
			.offset(req.offset)
			.build()
			.user_data(id);
		self.push(id, entry, Pending { op: IoOp::Read, slots, iovecs: Some(iovecs) });
	}

	fn submit_writev(&self, slots: Vec<usize>, req: IoVecRequest<'_>) {
		let id = self.next_id();
		let mut iovecs: Vec<libc::iovec> = req
			.bufs
			.iter()
			.map(|buf| libc::iovec {
				iov_base: buf.as_ptr() as *mut libc::c_void,
				iov_len: buf.len(),
			})
			.collect();
		let entry = opcode::Writev::new(self.fd(), iovecs.as_mut_ptr(), iovecs.len() as u32)
			.offset(req.offset)
			.build()
			.user_data(id);
		self.push(id, entry, Pending { op: IoOp::Write, slots, iovecs: Some(iovecs) });
	}

	fn cleanup(&self, max_events: usize) -> Vec<IoCompletion> {
		self.drain(max_events)
	}

	fn cleanup_all(&self) -> Vec<IoCompletion> {
		self.drain(usize::MAX)
	}

	fn max_latency(&self) -> Duration {
		self.max_latency
	}
}
