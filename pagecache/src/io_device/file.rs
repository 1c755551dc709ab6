use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::time::Duration;

use parking_lot::Mutex;

use super::{IoCompletion, IoDevice, IoOp, IoVecRequest};

#[cfg(unix)]
fn platform_read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
	std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn platform_write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
	std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn platform_read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
	std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn platform_write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
	std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

#[cfg(not(any(unix, windows)))]
compile_error!("FileIoDevice has no positional read/write implementation for this platform");

/// Loop `platform_read_at` until `buf` is full; a short read past EOF is
/// zero-filled rather than treated as an error, since a freshly-extended
/// backing file reads as a hole until something is written there.
fn read_at_full(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
	while !buf.is_empty() {
		match platform_read_at(file, buf, offset)? {
			0 => {
				buf.fill(0);
				break;
			}
			n => {
				buf = &mut buf[n..];
				offset += n as u64;
			}
		}
	}
	Ok(())
}

fn write_at_full(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
	while !buf.is_empty() {
		let n = platform_write_at(file, buf, offset)?;
		if n == 0 {
			return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write whole buffer"));
		}
		buf = &buf[n..];
		offset += n as u64;
	}
	Ok(())
}

/// Synchronous, file-backed default `IoDevice`. There is no real
/// asynchronous reactor underneath: `submit_*` perform the positional I/O
/// immediately and park the outcome on an internal completion queue, so
/// every caller in this crate — written against "submit now, observe
/// later" — still gets a real, if synchronous, implementation of that
/// protocol. Good enough for standalone use, doctests, and the
/// `tempfile`-backed integration tests; `UringIoDevice` (behind the
/// `io_uring` feature) is the real asynchronous implementation for
/// production use.
pub struct FileIoDevice {
	file: File,
	pending: Mutex<VecDeque<IoCompletion>>,
	max_latency: Duration,
}

impl FileIoDevice {
	pub fn new(file: File) -> Self {
		Self::with_max_latency(file, Duration::from_millis(50))
	}

	pub fn with_max_latency(file: File, max_latency: Duration) -> Self {
		Self {
			file,
			pending: Mutex::new(VecDeque::new()),
			max_latency,
		}
	}

	fn push_completion(&self, op: IoOp, slots: Vec<usize>, result: io::Result<()>) {
		self.pending.lock().push_back(IoCompletion { op, slots, result });
	}
}

impl IoDevice for FileIoDevice {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
		read_at_full(&self.file, buf, offset)
	}

	fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
		write_at_full(&self.file, buf, offset)
	}

	fn submit_read(&self, slot_index: usize, buf: &mut [u8], offset: u64) {
		let result = read_at_full(&self.file, buf, offset);
		self.push_completion(IoOp::Read, vec![slot_index], result);
	}

	fn submit_write(&self, slot_index: usize, buf: &[u8], offset: u64) {
		let result = write_at_full(&self.file, buf, offset);
		self.push_completion(IoOp::Write, vec![slot_index], result);
	}

	fn submit_readv(&self, slots: Vec<usize>, req: IoVecRequest<'_>) {
		let IoVecRequest { mut offset, bufs } = req;
		let mut result = Ok(());
		for buf in bufs {
			let len = buf.len();
			if let Err(err) = read_at_full(&self.file, buf, offset) {
				result = Err(err);
				break;
			}
			offset += len as u64;
		}
		self.push_completion(IoOp::Read, slots, result);
	}

	fn submit_writev(&self, slots: Vec<usize>, req: IoVecRequest<'_>) {
		let IoVecRequest { mut offset, bufs } = req;
		let mut result = Ok(());
		for buf in bufs {
			let len = buf.len();
			if let Err(err) = write_at_full(&self.file, buf, offset) {
				result = Err(err);
				break;
			}
			offset += len as u64;
		}
		self.push_completion(IoOp::Write, slots, result);
	}

	fn cleanup(&self, max_events: usize) -> Vec<IoCompletion> {
		let mut pending = self.pending.lock();
		let n = max_events.min(pending.len());
		pending.drain(..n).collect()
	}

	fn cleanup_all(&self) -> Vec<IoCompletion> {
		self.pending.lock().drain(..).collect()
	}

	fn max_latency(&self) -> Duration {
		self.max_latency
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempfile;

	#[test]
	fn write_then_read_round_trips() {
		let device = FileIoDevice::new(tempfile().unwrap());
		let mut out = [0u8; 4096];
		device.write_at(&[0xA5; 4096], 0).unwrap();
		device.read_at(&mut out, 0).unwrap();
		assert!(out.iter().all(|&b| b == 0xA5));
	}

	#[test]
	fn read_past_eof_zero_fills() {
		let device = FileIoDevice::new(tempfile().unwrap());
		let mut out = [0xFFu8; 4096];
		device.read_at(&mut out, 0).unwrap();
		assert!(out.iter().all(|&b| b == 0));
	}

	#[test]
	fn submit_read_parks_a_completion() {
		let device = FileIoDevice::new(tempfile().unwrap());
		let mut buf = [0u8; 4096];
		device.submit_read(3, &mut buf, 0);
		let completions = device.cleanup_all();
		assert_eq!(completions.len(), 1);
		assert_eq!(completions[0].slots, vec![3]);
		assert!(completions[0].result.is_ok());
	}

	#[test]
	fn submit_writev_coalesces_into_one_completion() {
		let device = FileIoDevice::new(tempfile().unwrap());
		let mut a = [1u8; 4096];
		let mut b = [2u8; 4096];
		device.submit_writev(
			vec![0, 1],
			IoVecRequest {
				offset: 0,
				bufs: vec![&mut a, &mut b],
			},
		);
		let completions = device.cleanup(8);
		assert_eq!(completions.len(), 1);
		assert_eq!(completions[0].slots, vec![0, 1]);
	}
}
