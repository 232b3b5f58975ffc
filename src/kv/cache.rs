use std::sync::Arc;

use wgpu::BufferUsages;

use crate::error::{CoreError, Result};
use crate::gpu::buffer_pool::BufferDType;
use crate::gpu::device::DeviceCaps;

fn dtype_size(dtype: BufferDType) -> u64 {
    match dtype {
        BufferDType::F16 => 2,
        _ => 4,
    }
}

/// Choose KV storage precision from device capability (spec §4.4,
/// §9 "KV cache f16 ↔ f32": encoded at construction, not at op time).
///
/// An f16-backed KV cache is part of the data model, but `attention.wgsl`
/// does not yet have an f16-kv read path (see DESIGN.md) — until it does,
/// this always returns `F32` regardless of `caps.has_f16` so the buffer's
/// dtype tag matches what the attention kernel actually reads.
pub fn choose_kv_dtype(_caps: &DeviceCaps) -> BufferDType {
    BufferDType::F32
}

/// Per-layer GPU K/V slabs, shared shape machinery for the contiguous and
/// sliding-window variants (spec §4.4).
struct LayerSlab {
    key: wgpu::Buffer,
    value: wgpu::Buffer,
    seq_len: usize,
}

fn make_slab(device: &wgpu::Device, capacity: usize, h_kv: usize, d: usize, dtype: BufferDType) -> LayerSlab {
    let row_bytes = (h_kv * d) as u64 * dtype_size(dtype);
    let size = (capacity as u64 * row_bytes).max(4);
    let usage = BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC;
    LayerSlab {
        key: device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kv_key"),
            size,
            usage,
            mapped_at_creation: false,
        }),
        value: device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kv_value"),
            size,
            usage,
            mapped_at_creation: false,
        }),
        seq_len: 0,
    }
}

/// Common interface over `ContiguousKv` and `SlidingWindowKv` (spec §4.4).
pub trait KvCache: Send {
    fn has_gpu_cache(&self) -> bool {
        true
    }

    /// Returns (K buffer, V buffer, current seq_len) for layer `l`.
    fn get_gpu_buffers(&self, l: usize) -> (&wgpu::Buffer, &wgpu::Buffer, usize);

    /// Append `num_tokens` new K/V rows starting at `start_pos` for layer
    /// `l`. Must be called after a forward that consumed `seq_len =
    /// start_pos` rows (spec §4.4 invariant).
    fn record_update_from_gpu(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        l: usize,
        new_k: &wgpu::Buffer,
        new_v: &wgpu::Buffer,
        start_pos: usize,
        num_tokens: usize,
    ) -> Result<()>;

    fn seq_len(&self, l: usize) -> usize;
    fn kv_dtype(&self) -> BufferDType;
    fn reset(&mut self);
}

/// Plain pre-allocated KV cache, one slab of `[S_cap, h_kv, d]` per layer.
pub struct ContiguousKv {
    slabs: Vec<LayerSlab>,
    h_kv: usize,
    d: usize,
    dtype: BufferDType,
}

impl ContiguousKv {
    pub fn new(device: &wgpu::Device, num_layers: usize, max_seq_len: usize, h_kv: usize, d: usize, dtype: BufferDType) -> Self {
        let slabs = (0..num_layers)
            .map(|_| make_slab(device, max_seq_len, h_kv, d, dtype))
            .collect();
        Self { slabs, h_kv, d, dtype }
    }
}

impl KvCache for ContiguousKv {
    fn get_gpu_buffers(&self, l: usize) -> (&wgpu::Buffer, &wgpu::Buffer, usize) {
        let slab = &self.slabs[l];
        (&slab.key, &slab.value, slab.seq_len)
    }

    fn record_update_from_gpu(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        l: usize,
        new_k: &wgpu::Buffer,
        new_v: &wgpu::Buffer,
        start_pos: usize,
        num_tokens: usize,
    ) -> Result<()> {
        if num_tokens == 0 {
            return Err(CoreError::Shape("KV append with zero tokens".into()));
        }
        let row_bytes = (self.h_kv * self.d) as u64 * dtype_size(self.dtype);
        let offset = start_pos as u64 * row_bytes;
        let size = num_tokens as u64 * row_bytes;

        let slab = &mut self.slabs[l];
        encoder.copy_buffer_to_buffer(new_k, 0, &slab.key, offset, size);
        encoder.copy_buffer_to_buffer(new_v, 0, &slab.value, offset, size);
        slab.seq_len = start_pos + num_tokens;
        Ok(())
    }

    fn seq_len(&self, l: usize) -> usize {
        self.slabs[l].seq_len
    }

    fn kv_dtype(&self) -> BufferDType {
        self.dtype
    }

    fn reset(&mut self) {
        for slab in &mut self.slabs {
            slab.seq_len = 0;
        }
    }
}

/// Ring-buffer KV cache bounded to `window` rows (spec §4.4 "Sliding
/// window: S_cap = min(S, window)").
pub struct SlidingWindowKv {
    slabs: Vec<LayerSlab>,
    h_kv: usize,
    d: usize,
    dtype: BufferDType,
    window: usize,
    /// Absolute position count written so far, independent of the
    /// ring-buffer wraparound — used to compute the logical seq_len.
    absolute_pos: Vec<usize>,
}

impl SlidingWindowKv {
    pub fn new(device: &wgpu::Device, num_layers: usize, window: usize, h_kv: usize, d: usize, dtype: BufferDType) -> Self {
        let slabs = (0..num_layers)
            .map(|_| make_slab(device, window, h_kv, d, dtype))
            .collect();
        Self {
            slabs,
            h_kv,
            d,
            dtype,
            window,
            absolute_pos: vec![0; num_layers],
        }
    }
}

impl KvCache for SlidingWindowKv {
    fn get_gpu_buffers(&self, l: usize) -> (&wgpu::Buffer, &wgpu::Buffer, usize) {
        let slab = &self.slabs[l];
        (&slab.key, &slab.value, slab.seq_len)
    }

    fn record_update_from_gpu(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        l: usize,
        new_k: &wgpu::Buffer,
        new_v: &wgpu::Buffer,
        start_pos: usize,
        num_tokens: usize,
    ) -> Result<()> {
        if num_tokens == 0 {
            return Err(CoreError::Shape("KV append with zero tokens".into()));
        }
        let row_bytes = (self.h_kv * self.d) as u64 * dtype_size(self.dtype);
        let window = self.window;
        let write_index = start_pos % window;

        let slab = &mut self.slabs[l];

        if write_index + num_tokens <= window {
            let offset = write_index as u64 * row_bytes;
            let size = num_tokens as u64 * row_bytes;
            encoder.copy_buffer_to_buffer(new_k, 0, &slab.key, offset, size);
            encoder.copy_buffer_to_buffer(new_v, 0, &slab.value, offset, size);
        } else {
            let first_len = window - write_index;
            let second_len = num_tokens - first_len;
            let first_bytes = first_len as u64 * row_bytes;
            let second_bytes = second_len as u64 * row_bytes;
            let offset = write_index as u64 * row_bytes;

            encoder.copy_buffer_to_buffer(new_k, 0, &slab.key, offset, first_bytes);
            encoder.copy_buffer_to_buffer(new_k, first_bytes, &slab.key, 0, second_bytes);
            encoder.copy_buffer_to_buffer(new_v, 0, &slab.value, offset, first_bytes);
            encoder.copy_buffer_to_buffer(new_v, first_bytes, &slab.value, 0, second_bytes);
        }

        self.absolute_pos[l] = start_pos + num_tokens;
        slab.seq_len = self.absolute_pos[l].min(window);
        Ok(())
    }

    fn seq_len(&self, l: usize) -> usize {
        self.slabs[l].seq_len
    }

    fn kv_dtype(&self) -> BufferDType {
        self.dtype
    }

    fn reset(&mut self) {
        for slab in &mut self.slabs {
            slab.seq_len = 0;
        }
        for pos in &mut self.absolute_pos {
            *pos = 0;
        }
    }
}

/// Build the KV cache for a model, choosing contiguous or sliding storage
/// per layer is handled by the pipeline (which owns one cache per attention
/// "kind"); this constructs a single cache of the requested shape.
pub fn new_contiguous(device: &Arc<wgpu::Device>, num_layers: usize, max_seq_len: usize, h_kv: usize, d: usize, caps: &DeviceCaps) -> ContiguousKv {
    ContiguousKv::new(device, num_layers, max_seq_len, h_kv, d, choose_kv_dtype(caps))
}

pub fn new_sliding(device: &Arc<wgpu::Device>, num_layers: usize, window: usize, h_kv: usize, d: usize, caps: &DeviceCaps) -> SlidingWindowKv {
    SlidingWindowKv::new(device, num_layers, window, h_kv, d, choose_kv_dtype(caps))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pure bookkeeping tests against a fake in-memory slab, since a real
    // KvCache needs a live wgpu::Device. The position arithmetic under test
    // is identical to what `record_update_from_gpu` executes above.

    fn sliding_seq_len_after(window: usize, start_pos: usize, num_tokens: usize) -> usize {
        (start_pos + num_tokens).min(window)
    }

    #[test]
    fn sliding_window_seq_len_saturates_at_window() {
        assert_eq!(sliding_seq_len_after(4, 0, 2), 2);
        assert_eq!(sliding_seq_len_after(4, 2, 2), 4);
        assert_eq!(sliding_seq_len_after(4, 10, 1), 4);
    }

    #[test]
    fn write_index_wraps_modulo_window() {
        let window = 4usize;
        assert_eq!(0 % window, 0);
        assert_eq!(5 % window, 1);
        assert_eq!(8 % window, 0);
    }

    #[test]
    fn wraparound_split_covers_exactly_num_tokens() {
        let window = 4usize;
        let write_index = 3usize;
        let num_tokens = 3usize;
        let first_len = window - write_index;
        let second_len = num_tokens - first_len;
        assert_eq!(first_len + second_len, num_tokens);
        assert_eq!(first_len, 1);
        assert_eq!(second_len, 2);
    }
}
