use wgpu::{CommandEncoder, CommandEncoderDescriptor};

use super::buffer_pool::{BufferDType, BufferPool, GpuBuf};

/// Wraps a single `wgpu::CommandEncoder` for one forward pass (spec §3
/// "Command recorder", §5 "single recorder per phase").
///
/// Kernels `record_*` into the encoder without submitting; intermediate
/// buffers they allocate from the pool are registered here instead of being
/// released immediately, since the GPU has not executed anything yet and
/// releasing early would hand a live buffer back to the pool while a
/// not-yet-submitted command still references it. `submit` flushes the
/// encoder to the queue, waits for completion, and only then releases every
/// registered temporary back to the pool.
pub struct CommandRecorder<'a> {
    encoder: CommandEncoder,
    pool: &'a BufferPool,
    temporaries: Vec<(GpuBuf, BufferDType)>,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(device: &wgpu::Device, pool: &'a BufferPool, label: &str) -> Self {
        let encoder = device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some(label),
        });
        Self {
            encoder,
            pool,
            temporaries: Vec::new(),
        }
    }

    pub fn encoder_mut(&mut self) -> &mut CommandEncoder {
        &mut self.encoder
    }

    pub fn pool(&self) -> &BufferPool {
        self.pool
    }

    /// Register a buffer to be released to the pool only after `submit`
    /// completes. Use for every intermediate acquired mid-recording.
    pub fn register_temporary(&mut self, buf: GpuBuf, dtype: BufferDType) {
        self.temporaries.push((buf, dtype));
    }

    /// Flush the recorded commands to the queue, block until they complete,
    /// then release all registered temporaries back to the pool.
    pub fn submit(self, queue: &wgpu::Queue, device: &wgpu::Device) {
        queue.submit(std::iter::once(self.encoder.finish()));
        device.poll(wgpu::Maintain::Wait);
        for (buf, dtype) in self.temporaries {
            self.pool.release(buf, dtype);
        }
    }

    /// Flush without waiting for GPU completion. Temporaries are NOT
    /// released — the caller must track the submission index and release
    /// once it is known to have completed (used by the streaming decode
    /// loop to overlap submission with host-side sampling).
    pub fn submit_async(self, queue: &wgpu::Queue) -> (wgpu::SubmissionIndex, Vec<(GpuBuf, BufferDType)>) {
        let index = queue.submit(std::iter::once(self.encoder.finish()));
        (index, self.temporaries)
    }
}

/// Release buffers previously deferred by `submit_async`, once the caller
/// has confirmed (via `device.poll` with the submission index) that the
/// corresponding commands completed.
pub fn release_deferred(pool: &BufferPool, temporaries: Vec<(GpuBuf, BufferDType)>) {
    for (buf, dtype) in temporaries {
        pool.release(buf, dtype);
    }
}
