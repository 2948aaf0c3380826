//! In-memory block device with an asynchronous read completion path.
//!
//! Each device stands in for one replica's storage. Synchronous reads and
//! writes go straight to the block map; [`Device::getblk`] queues a read to
//! the device's completion thread, which invokes the caller's callback once
//! the extent is available.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bref::{bytes_to_radix, OFF_MASK_RADIX};
use crate::error::{ChainError, ChainResult};

/// Shared handle to a device.
pub type DeviceRef = Arc<Device>;

/// Completion callback for [`Device::getblk`].
pub type IoCallback = Box<dyn FnOnce(ChainResult<Vec<u8>>) + Send + 'static>;

/// First allocatable offset; offset 0 means "not placed".
const ALLOC_BASE: u64 = 1 << 16;

/// Configuration for an in-memory device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, used in logs and errors.
    pub name: String,
    /// Addressable capacity in bytes.
    pub capacity_bytes: u64,
    /// Smallest allocation radix (allocations are at least `1 << radix` bytes).
    pub min_alloc_radix: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "node0".to_string(),
            capacity_bytes: 1 << 30,
            min_alloc_radix: 10,
        }
    }
}

impl DeviceConfig {
    /// Creates a config with the given name and default sizes.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// I/O statistics for a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoStats {
    /// Total read operations completed.
    pub reads_completed: u64,
    /// Reads served through the asynchronous completion path.
    pub async_reads: u64,
    /// Total write operations completed.
    pub writes_completed: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Total errors returned.
    pub errors: u64,
}

struct IoRequest {
    data_off: u64,
    bytes: usize,
    done: IoCallback,
}

struct DeviceInner {
    config: DeviceConfig,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    next_off: AtomicU64,
    fail_reads: AtomicBool,
    read_delay_ms: AtomicU64,
    stats: Mutex<IoStats>,
}

impl DeviceInner {
    fn read(&self, data_off: u64, bytes: usize) -> ChainResult<Vec<u8>> {
        let delay = self.read_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_reads.load(Ordering::Acquire) {
            self.stats.lock().errors += 1;
            return Err(ChainError::ReadFailed {
                device: self.config.name.clone(),
                data_off,
            });
        }
        let offset = data_off & !OFF_MASK_RADIX;
        let blocks = self.blocks.lock();
        let Some(block) = blocks.get(&offset) else {
            drop(blocks);
            self.stats.lock().errors += 1;
            return Err(ChainError::Unallocated {
                device: self.config.name.clone(),
                data_off,
            });
        };
        let mut out = block.clone();
        drop(blocks);
        out.resize(bytes, 0);

        let mut stats = self.stats.lock();
        stats.reads_completed += 1;
        stats.bytes_read += bytes as u64;
        Ok(out)
    }
}

/// One replica's in-memory storage.
pub struct Device {
    inner: Arc<DeviceInner>,
    // The completion thread exits once this sender is dropped.
    io_tx: mpsc::UnboundedSender<IoRequest>,
}

impl Device {
    /// Creates a device and starts its completion thread.
    pub fn new(config: DeviceConfig) -> ChainResult<DeviceRef> {
        let (io_tx, mut io_rx) = mpsc::unbounded_channel::<IoRequest>();
        let inner = Arc::new(DeviceInner {
            config,
            blocks: Mutex::new(HashMap::new()),
            next_off: AtomicU64::new(ALLOC_BASE),
            fail_reads: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
            stats: Mutex::new(IoStats::default()),
        });

        let worker_inner = Arc::clone(&inner);
        let _detached = std::thread::Builder::new()
            .name(format!("{}-iodone", inner.config.name))
            .spawn(move || {
                while let Some(req) = io_rx.blocking_recv() {
                    let result = worker_inner.read(req.data_off, req.bytes);
                    if result.is_ok() {
                        worker_inner.stats.lock().async_reads += 1;
                    }
                    (req.done)(result);
                }
            })?;

        debug!(device = %inner.config.name, "device created");
        Ok(Arc::new(Self { inner, io_tx }))
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Allocates space for `bytes` bytes; returns a `data_off` with the
    /// allocation radix in its low bits.
    pub fn alloc(&self, bytes: usize) -> ChainResult<u64> {
        let radix = bytes_to_radix(bytes).max(self.inner.config.min_alloc_radix);
        let size = 1u64 << radix;
        let mut cur = self.inner.next_off.load(Ordering::Relaxed);
        loop {
            let aligned = (cur + size - 1) & !(size - 1);
            let end = aligned + size;
            if end > self.inner.config.capacity_bytes {
                return Err(ChainError::OutOfSpace {
                    device: self.name().to_string(),
                    bytes: bytes as u64,
                });
            }
            match self.inner.next_off.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(aligned | radix as u64),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Writes a block at `data_off`.
    pub fn write(&self, data_off: u64, data: &[u8]) -> ChainResult<()> {
        let offset = data_off & !OFF_MASK_RADIX;
        if offset == 0 {
            return Err(ChainError::InvalidArgument {
                reason: "write to unplaced offset".to_string(),
            });
        }
        self.inner.blocks.lock().insert(offset, data.to_vec());
        let mut stats = self.inner.stats.lock();
        stats.writes_completed += 1;
        stats.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Synchronously reads `bytes` bytes at `data_off`.
    pub fn read(&self, data_off: u64, bytes: usize) -> ChainResult<Vec<u8>> {
        self.inner.read(data_off, bytes)
    }

    /// Queues an asynchronous read. `done` runs exactly once, on the
    /// device's completion thread.
    pub fn getblk(&self, data_off: u64, bytes: usize, done: IoCallback) {
        let req = IoRequest {
            data_off,
            bytes,
            done,
        };
        if let Err(mpsc::error::SendError(req)) = self.io_tx.send(req) {
            warn!(device = %self.name(), "completion thread gone, failing read");
            (req.done)(Err(ChainError::ReadFailed {
                device: self.name().to_string(),
                data_off,
            }));
        }
    }

    /// Makes every subsequent read fail (fault injection).
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::Release);
    }

    /// Delays every read, synchronous or asynchronous, by `ms` milliseconds.
    pub fn set_read_delay_ms(&self, ms: u64) {
        self.inner.read_delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of blocks stored.
    pub fn block_count(&self) -> usize {
        self.inner.blocks.lock().len()
    }

    /// Snapshot of the device's I/O statistics.
    pub fn stats(&self) -> IoStats {
        self.inner.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    fn make_device() -> DeviceRef {
        Device::new(DeviceConfig::named("test0")).unwrap()
    }

    #[test]
    fn test_alloc_alignment_and_radix() {
        let dev = make_device();
        let a = dev.alloc(100).unwrap();
        assert_eq!(a & OFF_MASK_RADIX, 10);
        assert_eq!((a & !OFF_MASK_RADIX) % 1024, 0);

        let b = dev.alloc(4096).unwrap();
        assert_eq!(b & OFF_MASK_RADIX, 12);
        assert_eq!((b & !OFF_MASK_RADIX) % 4096, 0);
        assert!((b & !OFF_MASK_RADIX) > (a & !OFF_MASK_RADIX));
    }

    #[test]
    fn test_alloc_out_of_space() {
        let dev = Device::new(DeviceConfig {
            name: "tiny".to_string(),
            capacity_bytes: ALLOC_BASE + 2048,
            min_alloc_radix: 10,
        })
        .unwrap();
        dev.alloc(1024).unwrap();
        dev.alloc(1024).unwrap();
        assert!(matches!(
            dev.alloc(1024),
            Err(ChainError::OutOfSpace { .. })
        ));
    }

    #[test]
    fn test_write_read() {
        let dev = make_device();
        let off = dev.alloc(5).unwrap();
        dev.write(off, b"hello").unwrap();
        assert_eq!(dev.read(off, 5).unwrap(), b"hello");
        assert_eq!(dev.read(off, 3).unwrap(), b"hel");

        let stats = dev.stats();
        assert_eq!(stats.writes_completed, 1);
        assert_eq!(stats.reads_completed, 2);
    }

    #[test]
    fn test_read_unallocated() {
        let dev = make_device();
        assert!(matches!(
            dev.read(ALLOC_BASE | 10, 4),
            Err(ChainError::Unallocated { .. })
        ));
    }

    #[test]
    fn test_fail_reads() {
        let dev = make_device();
        let off = dev.alloc(4).unwrap();
        dev.write(off, b"abcd").unwrap();
        dev.set_fail_reads(true);
        assert!(matches!(dev.read(off, 4), Err(ChainError::ReadFailed { .. })));
        dev.set_fail_reads(false);
        assert!(dev.read(off, 4).is_ok());
    }

    #[test]
    fn test_getblk_completes_on_other_thread() {
        let dev = make_device();
        let off = dev.alloc(4).unwrap();
        dev.write(off, b"data").unwrap();

        let caller = std::thread::current().id();
        let (tx, rx) = std_mpsc::channel();
        dev.getblk(
            off,
            4,
            Box::new(move |res| {
                tx.send((std::thread::current().id(), res.unwrap())).unwrap();
            }),
        );
        let (tid, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(tid, caller);
        assert_eq!(data, b"data");
        assert_eq!(dev.stats().async_reads, 1);
    }
}
