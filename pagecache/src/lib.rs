#![allow(dead_code)]

mod allocator;
mod cache;
mod config;
mod consts;
mod error;
mod evict;
mod fetch;
mod free;
mod io_device;
mod lock;
mod lookup;
mod page_type;
mod refcount;
mod slot;
mod stats;
mod thread_id;
mod utils;
mod writeback;

pub use allocator::{Allocator, InMemoryAllocator};
pub use cache::{GetResult, PageCache};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use error::{AsyncGetOutcome, ClaimOutcome, FatalError, ReadOutcome, WriteOutcome};
pub use evict::EvictOutcome;
pub use fetch::AsyncContext;
pub use io_device::{FileIoDevice, IoCompletion, IoDevice, IoOp, IoVecRequest};
pub use lock::{ClaimGuard, ReadGuard, WriteGuard};
pub use page_type::PageType;
pub use stats::{SlotSnapshot, Stats};
pub use thread_id::{ThreadIds, ThreadRegistry};

#[cfg(feature = "io_uring")]
pub use io_device::UringIoDevice;
