use std::collections::HashMap;
use std::sync::Arc;

use wgpu::BufferUsages;

use crate::gpu::buffer_pool::GpuBuf;

/// Maps manifest tensor names to GPU buffers. A tensor larger than the
/// device's max storage-buffer binding is split across several buffers
/// ("shards" in the buffer sense, distinct from manifest weight shards).
pub struct WeightStore {
    buffers: HashMap<String, Vec<GpuBuf>>,
    device: Arc<wgpu::Device>,
}

impl WeightStore {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            buffers: HashMap::new(),
            device,
        }
    }

    /// Upload a tensor to the GPU as a single storage buffer.
    pub fn upload(&mut self, name: &str, data: &[u8]) -> GpuBuf {
        let size = data.len().max(4) as u64;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: true,
        });
        {
            let mut view = buffer.slice(..).get_mapped_range_mut();
            view[..data.len()].copy_from_slice(data);
        }
        buffer.unmap();
        let buf = Arc::new(buffer);
        self.buffers.insert(name.to_string(), vec![Arc::clone(&buf)]);
        buf
    }

    /// Upload a large tensor, splitting it into binding-size-limited shards.
    pub fn upload_sharded(&mut self, name: &str, data: &[u8], max_binding_size: u32) -> Vec<GpuBuf> {
        let max = max_binding_size as usize;
        if data.len() <= max {
            let buf = self.upload(name, data);
            return vec![buf];
        }

        let mut shards = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + max).min(data.len());
            let shard_idx = shards.len();
            let shard_name = format!("{name}.part_{shard_idx}");
            let label = shard_name.clone();
            let size = (end - offset).max(4) as u64;
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&label),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
                mapped_at_creation: true,
            });
            {
                let mut view = buffer.slice(..).get_mapped_range_mut();
                view[..end - offset].copy_from_slice(&data[offset..end]);
            }
            buffer.unmap();
            shards.push(Arc::new(buffer));
            offset = end;
        }
        self.buffers.insert(name.to_string(), shards.clone());
        shards
    }

    /// The first (or only) buffer for a tensor.
    pub fn get(&self, name: &str) -> Option<&GpuBuf> {
        self.buffers.get(name).and_then(|v| v.first())
    }

    /// All buffer shards for a tensor, in order.
    pub fn get_shards(&self, name: &str) -> Option<&[GpuBuf]> {
        self.buffers.get(name).map(|v| v.as_slice())
    }

    pub fn has(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    /// Drop a tensor's buffers, e.g. an evicted expert's weights.
    pub fn remove(&mut self, name: &str) -> Option<Vec<GpuBuf>> {
        self.buffers.remove(name)
    }
}
