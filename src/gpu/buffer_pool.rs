use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wgpu::BufferUsages;

use crate::error::{CoreError, Result};

/// A shareable reference to a GPU buffer.
pub type GpuBuf = Arc<wgpu::Buffer>;

/// Dtype tag carried alongside a buffer (spec §3 "Buffer").
///
/// Half- and full-precision buffers of the same byte size are not
/// interchangeable from a shader's perspective, so the pool keys free lists
/// by `(bucket, dtype)`, not just `bucket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferDType {
    F32,
    F16,
    U32,
    U8PackedQ4K,
    U8PackedMxfp4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    bucket: u64,
    dtype: BufferDType,
}

/// Size-bucketed free list keyed by `(rounded-up size, dtype)` (spec §4.1).
///
/// `acquire` returns a free buffer matching the key if one exists, otherwise
/// allocates fresh. `release` re-inserts. The caller (not the pool) is
/// responsible for never releasing a buffer that a recorded-but-unsubmitted
/// command still references — the command recorder's temporary-buffer list
/// (see `recorder.rs`) exists to enforce exactly that ordering.
pub struct BufferPool {
    device: Arc<wgpu::Device>,
    free: Mutex<HashMap<PoolKey, Vec<wgpu::Buffer>>>,
    read_back_counter: AtomicU64,
}

impl BufferPool {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            free: Mutex::new(HashMap::new()),
            read_back_counter: AtomicU64::new(0),
        }
    }

    /// Round a byte size up to a bucket boundary. Buckets are 16-byte steps
    /// below 256 bytes (so small uniform buffers don't all collapse onto one
    /// bucket), and powers of two above that.
    fn round_to_bucket(size: u64) -> u64 {
        let size = size.max(4);
        if size <= 256 {
            size.next_multiple_of(16)
        } else {
            size.next_power_of_two()
        }
    }

    /// Acquire a buffer of at least `size` bytes tagged with `dtype`, for use
    /// with the given usage flags. Returns a pooled buffer if one of matching
    /// bucket+dtype is free, otherwise allocates a new one.
    pub fn acquire(&self, size: u64, dtype: BufferDType, usage: BufferUsages, label: &str) -> GpuBuf {
        let bucket = Self::round_to_bucket(size);
        let key = PoolKey { bucket, dtype };

        let mut free = self.free.lock().expect("buffer pool mutex poisoned");
        if let Some(list) = free.get_mut(&key) {
            if let Some(buf) = list.pop() {
                return Arc::new(buf);
            }
        }
        drop(free);

        Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bucket,
            usage,
            mapped_at_creation: false,
        }))
    }

    /// Acquire without a meaningful dtype tag, for raw parameter/staging
    /// buffers whose reuse bucket doesn't depend on element type.
    pub fn acquire_untagged(&self, size: u64, usage: BufferUsages, label: &str) -> GpuBuf {
        self.acquire(size, BufferDType::U32, usage, label)
    }

    /// Return a buffer to its bucket's free list.
    ///
    /// Precondition: no pending (recorded-but-unsubmitted) command references
    /// `buf`. Callers route releases through `CommandRecorder` during
    /// recording so this precondition holds by construction.
    pub fn release(&self, buf: GpuBuf, dtype: BufferDType) {
        let Ok(buffer) = Arc::try_unwrap(buf) else {
            // Still referenced elsewhere (e.g. retained as a bind-group
            // input across a reused forward pass). Drop our handle only.
            return;
        };
        let bucket = buffer.size();
        let key = PoolKey { bucket, dtype };
        let mut free = self.free.lock().expect("buffer pool mutex poisoned");
        free.entry(key).or_default().push(buffer);
    }

    /// Copy a GPU buffer back to host memory via a staging buffer.
    /// Tracked against `read_back_counter` for telemetry (spec §4.1).
    pub async fn read(&self, queue: &wgpu::Queue, buf: &wgpu::Buffer, byte_len: u64) -> Result<Vec<u8>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("buffer_pool_staging"),
            size: byte_len,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(buf, 0, &staging, 0, byte_len);
        queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.await
            .map_err(|_| CoreError::BufferMap)?
            .map_err(|_| CoreError::BufferMap)?;

        let data = staging.slice(..).get_mapped_range().to_vec();
        staging.unmap();

        self.read_back_counter
            .fetch_add(byte_len, Ordering::Relaxed);

        Ok(data)
    }

    /// Total bytes copied device→host since process start (spec §4.1).
    pub fn read_back_counter(&self) -> u64 {
        self.read_back_counter.load(Ordering::Relaxed)
    }

    /// Drop all pooled (free) buffers, e.g. after a `ResourceExhausted` error
    /// before the caller retries (spec §7).
    pub fn shrink(&self) {
        let mut free = self.free.lock().expect("buffer pool mutex poisoned");
        free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_rounding_is_monotone_and_idempotent() {
        assert_eq!(BufferPool::round_to_bucket(1), 16);
        assert_eq!(BufferPool::round_to_bucket(16), 16);
        assert_eq!(BufferPool::round_to_bucket(17), 32);
        assert_eq!(BufferPool::round_to_bucket(256), 256);
        assert_eq!(BufferPool::round_to_bucket(257), 512);
        assert_eq!(BufferPool::round_to_bucket(1024), 1024);
        for size in [1u64, 4, 15, 16, 100, 256, 257, 4096, 1 << 20] {
            let bucket = BufferPool::round_to_bucket(size);
            assert!(bucket >= size);
            assert_eq!(BufferPool::round_to_bucket(bucket), bucket);
        }
    }
}
