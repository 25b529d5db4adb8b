// =============================================================================
// Per-connection outbound byte ring (single producer / single consumer).
//
// Cursors are monotonically increasing u64 counters; the physical index is
// `cursor & (capacity - 1)`. Invariant: `tail - head <= capacity`.
//
//   producer (fan-out broadcaster)  -> try_write, owns `tail`
//   consumer (reactor flush cycle)  -> read,      owns `head`
//
// Neither handle is Clone and both mutate through `&mut self`, so at most one
// thread can be on each side at any time.
// =============================================================================

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};

pub const DEFAULT_CAPACITY: usize = 65_536;
pub const DEFAULT_HIGH_WATERMARK: f64 = 0.8;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),
    #[error("high watermark must be in (0, 1], got {0}")]
    InvalidWatermark(f64),
}

struct Shared {
    storage: Box<[UnsafeCell<u8>]>,
    mask: usize,
    high_watermark: f64,
    head: AtomicU64,
    tail: AtomicU64,
    lag: AtomicU64,
    watermark_hits: AtomicU64,
}

// SAFETY: the producer only writes bytes in [tail, head + capacity) and the
// consumer only reads bytes in [head, tail). The regions never overlap, and
// each side publishes its cursor with Release after touching the bytes and
// observes the other side's cursor with Acquire before touching them.
unsafe impl Sync for Shared {}

impl Shared {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    fn occupancy(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    fn usage_percent(&self) -> f64 {
        self.occupancy() as f64 * 100.0 / self.capacity() as f64
    }
}

/// Fixed-capacity outbound buffer for one connection.
///
/// Create with [`ConnectionBuffer::new`], then [`split`](ConnectionBuffer::split)
/// into the producer and consumer handles.
pub struct ConnectionBuffer {
    shared: Arc<Shared>,
}

impl ConnectionBuffer {
    pub fn new(capacity: usize, high_watermark: f64) -> Result<Self, BufferError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(BufferError::InvalidCapacity(capacity));
        }
        if !(high_watermark > 0.0 && high_watermark <= 1.0) {
            return Err(BufferError::InvalidWatermark(high_watermark));
        }
        let storage = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        Ok(Self {
            shared: Arc::new(Shared {
                storage,
                mask: capacity - 1,
                high_watermark,
                head: AtomicU64::new(0),
                tail: AtomicU64::new(0),
                lag: AtomicU64::new(0),
                watermark_hits: AtomicU64::new(0),
            }),
        })
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, BufferError> {
        Self::new(capacity, DEFAULT_HIGH_WATERMARK)
    }

    pub fn split(self) -> (BufferProducer, BufferConsumer) {
        (
            BufferProducer {
                shared: self.shared.clone(),
            },
            BufferConsumer {
                shared: self.shared,
            },
        )
    }
}

/// Read-only view of a buffer's counters, shareable across tasks.
#[derive(Clone)]
pub struct BufferMonitor {
    shared: Arc<Shared>,
}

macro_rules! stats_accessors {
    ($ty:ty) => {
        impl $ty {
            pub fn capacity(&self) -> usize {
                self.shared.capacity()
            }

            /// Bytes currently buffered.
            pub fn occupancy(&self) -> usize {
                self.shared.occupancy()
            }

            pub fn usage_percent(&self) -> f64 {
                self.shared.usage_percent()
            }

            /// Number of refused writes since the last reset.
            pub fn lag_counter(&self) -> u64 {
                self.shared.lag.load(Ordering::Relaxed)
            }

            /// Successful writes that left the buffer above the high watermark.
            pub fn watermark_hits(&self) -> u64 {
                self.shared.watermark_hits.load(Ordering::Relaxed)
            }

            pub fn reset_lag(&self) {
                self.shared.lag.store(0, Ordering::Relaxed);
                self.shared.watermark_hits.store(0, Ordering::Relaxed);
            }

            /// Clear only the early-warning count; refusals are kept.
            pub fn reset_watermark_hits(&self) {
                self.shared.watermark_hits.store(0, Ordering::Relaxed);
            }
        }
    };
}

stats_accessors!(BufferMonitor);
stats_accessors!(BufferProducer);
stats_accessors!(BufferConsumer);

pub struct BufferProducer {
    shared: Arc<Shared>,
}

impl BufferProducer {
    /// All-or-nothing write. Returns `false` (and counts one unit of lag)
    /// if `data` does not fit in the free space.
    pub fn try_write(&mut self, data: &[u8]) -> bool {
        let shared = &*self.shared;
        let cap = shared.capacity();
        let len = data.len();
        if len == 0 {
            return true;
        }

        let tail = shared.tail.load(Ordering::Relaxed);
        let head = shared.head.load(Ordering::Acquire);
        let used = (tail - head) as usize;
        if len > cap - used {
            shared.lag.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let start = tail as usize & shared.mask;
        let first = len.min(cap - start);
        // SAFETY: [start, start + first) and [0, len - first) lie in the free
        // region, which the consumer does not read until `tail` is published.
        unsafe {
            let base = shared.base();
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(start), first);
            std::ptr::copy_nonoverlapping(data[first..].as_ptr(), base, len - first);
        }
        shared.tail.store(tail + len as u64, Ordering::Release);

        if (used + len) as f64 > cap as f64 * shared.high_watermark {
            shared.watermark_hits.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    pub fn monitor(&self) -> BufferMonitor {
        BufferMonitor {
            shared: self.shared.clone(),
        }
    }
}

pub struct BufferConsumer {
    shared: Arc<Shared>,
}

impl BufferConsumer {
    /// Up to `max_bytes` buffered bytes in FIFO order. Empty when nothing is
    /// buffered.
    pub fn read(&mut self, max_bytes: usize) -> Bytes {
        let mut out = BytesMut::new();
        self.read_into(&mut out, max_bytes);
        out.freeze()
    }

    /// Append up to `max_bytes` to `dst`; returns the number of bytes moved.
    pub fn read_into(&mut self, dst: &mut BytesMut, max_bytes: usize) -> usize {
        let shared = &*self.shared;
        let cap = shared.capacity();
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        let n = ((tail - head) as usize).min(max_bytes);
        if n == 0 {
            return 0;
        }

        let start = head as usize & shared.mask;
        let first = n.min(cap - start);
        dst.reserve(n);
        // SAFETY: [head, head + n) was published by the producer's Release
        // store of `tail`; the producer will not overwrite it until `head`
        // moves past it below.
        unsafe {
            let base = shared.base();
            dst.extend_from_slice(std::slice::from_raw_parts(base.add(start), first));
            dst.extend_from_slice(std::slice::from_raw_parts(base, n - first));
        }
        shared.head.store(head + n as u64, Ordering::Release);
        n
    }

    /// Drop everything currently buffered.
    pub fn clear(&mut self) -> usize {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        self.shared.head.store(tail, Ordering::Release);
        (tail - head) as usize
    }

    pub fn monitor(&self) -> BufferMonitor {
        BufferMonitor {
            shared: self.shared.clone(),
        }
    }
}
