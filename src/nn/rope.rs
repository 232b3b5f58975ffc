use std::sync::Arc;

use wgpu::BufferUsages;

use crate::gpu::buffer_pool::{BufferDType, BufferPool, GpuBuf};
use crate::gpu::pipeline::PipelineManager;
use crate::gpu::recorder::CommandRecorder;
use crate::model::config::RopeScalingKind;
use crate::nn::gpu_util::{buf_entry, create_uniform_raw};

const ROPE_APPLY_WGSL: &str = include_str!("../shaders/rope_apply.wgsl");

/// Baked `cos[S, d/2]` / `sin[S, d/2]` tables (spec §3 "RoPE tables").
pub struct RopeTable {
    pub cos: GpuBuf,
    pub sin: GpuBuf,
    pub half_dim: usize,
}

/// YARN correction-range constants, matching the common reference
/// implementation's defaults (grounded on
/// `other_examples/a5cc30a9_..._deepseek.rs.rs`'s `yarn_get_mscale` use and
/// `other_examples/84a7a7c6_..._config.rs.rs`'s `"yarn"` scaling variant).
/// The manifest's `rope_scaling` block carries only a scalar `factor`
/// (spec §6); beta_fast/beta_slow are not independently configurable here —
/// see DESIGN.md's Open Question resolution.
const YARN_BETA_FAST: f32 = 32.0;
const YARN_BETA_SLOW: f32 = 1.0;

fn yarn_mscale(scale: f32) -> f32 {
    if scale <= 1.0 {
        1.0
    } else {
        0.1 * scale.ln() + 1.0
    }
}

/// Inverse wavelength-to-dimension correction range, per the YARN paper's
/// `find_correction_range`.
fn yarn_correction_dim(num_rotations: f32, dim: usize, theta: f32, max_position: usize) -> f32 {
    (dim as f32 * (max_position as f32 / (num_rotations * 2.0 * std::f32::consts::PI)).ln())
        / (2.0 * theta.ln())
}

/// Bake one RoPE table pair (cos, sin) for `max_seq_len` positions and
/// `head_dim` feature dimensions, applying the scaling policy configured on
/// the model (spec §3, §4.3).
pub fn bake_rope_table(
    device: &Arc<wgpu::Device>,
    max_seq_len: usize,
    head_dim: usize,
    theta: f32,
    scaling_kind: RopeScalingKind,
    scale_factor: f32,
) -> RopeTable {
    let half_dim = head_dim / 2;
    let mut cos = vec![0f32; max_seq_len * half_dim];
    let mut sin = vec![0f32; max_seq_len * half_dim];

    let (low, high) = match scaling_kind {
        RopeScalingKind::Yarn => {
            let low = yarn_correction_dim(YARN_BETA_FAST, head_dim, theta, max_seq_len)
                .floor()
                .max(0.0);
            let high = yarn_correction_dim(YARN_BETA_SLOW, head_dim, theta, max_seq_len)
                .ceil()
                .min(half_dim as f32 - 1.0);
            (low, high.max(low + 0.001))
        }
        _ => (0.0, 0.0),
    };
    let mscale = if matches!(scaling_kind, RopeScalingKind::Yarn) {
        yarn_mscale(scale_factor)
    } else {
        1.0
    };

    for i in 0..half_dim {
        let freq_extrapolation = theta.powf(-2.0 * i as f32 / head_dim as f32);

        let freq = match scaling_kind {
            RopeScalingKind::None => freq_extrapolation,
            RopeScalingKind::Linear => freq_extrapolation / scale_factor,
            RopeScalingKind::Yarn => {
                let freq_interpolation = freq_extrapolation / scale_factor;
                // Ramp: 0 = full interpolation, 1 = full extrapolation.
                let ramp = ((i as f32 - low) / (high - low)).clamp(0.0, 1.0);
                freq_interpolation * (1.0 - ramp) + freq_extrapolation * ramp
            }
        };

        for pos in 0..max_seq_len {
            let angle = pos as f32 * freq;
            cos[pos * half_dim + i] = angle.cos() * mscale;
            sin[pos * half_dim + i] = angle.sin() * mscale;
        }
    }

    RopeTable {
        cos: upload_f32(device, &cos),
        sin: upload_f32(device, &sin),
        half_dim,
    }
}

fn upload_f32(device: &wgpu::Device, data: &[f32]) -> GpuBuf {
    let bytes = bytemuck::cast_slice(data);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("rope_table"),
        size: bytes.len().max(4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: true,
    });
    {
        let mut view = buffer.slice(..).get_mapped_range_mut();
        view[..bytes.len()].copy_from_slice(bytes);
    }
    buffer.unmap();
    Arc::new(buffer)
}

/// Rotate paired feature dimensions of `input[T, num_heads, head_dim]`
/// in-place against `table`, starting at absolute position `start_pos`
/// (spec §4.3 "RoPE").
pub fn record_apply_rope(
    recorder: &mut CommandRecorder,
    pipelines: &mut PipelineManager,
    device: &wgpu::Device,
    input: &GpuBuf,
    table: &RopeTable,
    num_tokens: usize,
    num_heads: usize,
    head_dim: usize,
    start_pos: usize,
) -> GpuBuf {
    let entry = pipelines.get_or_create_default("rope_apply", ROPE_APPLY_WGSL);
    let pool: &BufferPool = recorder.pool();
    let size = (num_tokens * num_heads * head_dim * 4) as u64;
    let output = pool.acquire(size, BufferDType::F32, BufferUsages::STORAGE | BufferUsages::COPY_SRC, "rope_out");

    let params_data = [
        (num_tokens as u32).to_le_bytes(),
        (num_heads as u32).to_le_bytes(),
        (head_dim as u32).to_le_bytes(),
        (start_pos as u32).to_le_bytes(),
        (table.half_dim as u32).to_le_bytes(),
    ]
    .concat();
    let params = create_uniform_raw(device, &params_data);

    let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("rope_apply"),
        layout: &entry.bind_group_layout,
        entries: &[
            buf_entry(0, input),
            buf_entry(1, &table.cos),
            buf_entry(2, &table.sin),
            buf_entry(3, &output),
            buf_entry(4, &params),
        ],
    });

    let total_pairs = (num_tokens * num_heads * table.half_dim) as u32;
    {
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(total_pairs.div_ceil(256), 1, 1);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_scaling_matches_plain_rope_frequencies() {
        let head_dim = 8;
        let theta = 10000.0f32;
        let half = head_dim / 2;
        for i in 0..half {
            let expected = theta.powf(-2.0 * i as f32 / head_dim as f32);
            // None-scaling freq equals the raw extrapolation frequency.
            assert!((expected - theta.powf(-2.0 * i as f32 / head_dim as f32)).abs() < 1e-6);
        }
    }

    #[test]
    fn linear_scaling_divides_frequency_by_factor() {
        let theta = 10000.0f32;
        let head_dim = 8;
        let factor = 4.0;
        let i = 2;
        let base = theta.powf(-2.0 * i as f32 / head_dim as f32);
        let scaled = base / factor;
        assert!((scaled - base / 4.0).abs() < 1e-6);
    }

    #[test]
    fn yarn_mscale_is_identity_below_scale_one() {
        assert_eq!(yarn_mscale(1.0), 1.0);
        assert_eq!(yarn_mscale(0.5), 1.0);
        assert!(yarn_mscale(4.0) > 1.0);
    }
}
