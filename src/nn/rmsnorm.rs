use wgpu::BufferUsages;

use crate::gpu::buffer_pool::{BufferDType, BufferPool, GpuBuf};
use crate::gpu::pipeline::PipelineManager;
use crate::gpu::recorder::CommandRecorder;
use crate::nn::gpu_util::{buf_entry, create_uniform_raw};

const RMSNORM_WGSL: &str = include_str!("../shaders/rmsnorm.wgsl");

/// `y[i] = (x[i] / rms) * w[i]`, `rms = sqrt(mean(x^2) + eps)` (spec §4.3).
///
/// When the model's `rmsnorm_weight_offset` is true, the weight tensor was
/// already rewritten to `1 + w[i]` at upload time (see `loader.rs`) — the
/// shader never branches on it. Returns the output buffer; the caller
/// registers it as a recorder temporary once it is no longer needed as an
/// input further down the layer.
pub fn record_rmsnorm(
    recorder: &mut CommandRecorder,
    pipelines: &mut PipelineManager,
    device: &wgpu::Device,
    input: &GpuBuf,
    weight: &GpuBuf,
    n: usize,
    hidden_size: usize,
    eps: f32,
) -> GpuBuf {
    let entry = pipelines.get_or_create_default("rmsnorm", RMSNORM_WGSL);
    let pool: &BufferPool = recorder.pool();
    let output = pool.acquire(
        (n * hidden_size * 4) as u64,
        BufferDType::F32,
        BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        "rmsnorm_out",
    );

    let params_data = [
        (n as u32).to_le_bytes(),
        (hidden_size as u32).to_le_bytes(),
        eps.to_le_bytes(),
    ]
    .concat();
    let params = create_uniform_raw(device, &params_data);

    let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("rmsnorm"),
        layout: &entry.bind_group_layout,
        entries: &[
            buf_entry(0, input),
            buf_entry(1, weight),
            buf_entry(2, &output),
            buf_entry(3, &params),
        ],
    });

    {
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(n as u32, 1, 1);
    }

    output
}

/// Apply the `1 + w[i]` rewrite once, at upload time, for models whose
/// manifest sets `rmsnorm_weight_offset` (spec §4.3).
pub fn apply_weight_offset(raw: &mut [f32]) {
    for w in raw.iter_mut() {
        *w += 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_offset_shifts_every_element_by_one() {
        let mut w = vec![-1.0f32, 0.0, 0.5];
        apply_weight_offset(&mut w);
        assert_eq!(w, vec![0.0, 1.0, 1.5]);
    }
}
