use std::sync::Arc;

use wgpu::BufferUsages;

use crate::error::{CoreError, Result};
use crate::gpu::buffer_pool::{BufferDType, BufferPool, GpuBuf};
use crate::gpu::device::DeviceCaps;
use crate::gpu::pipeline::{select_matmul_variant, MatmulVariant, PipelineManager};
use crate::gpu::recorder::CommandRecorder;
use crate::nn::gpu_util::{buf_entry, create_uniform_raw};

const F32_MATMUL_WGSL: &str = include_str!("../shaders/f32_matmul.wgsl");
const F16_MATMUL_WGSL: &str = include_str!("../shaders/f16_matmul.wgsl");
const GEMV_WGSL: &str = include_str!("../shaders/gemv.wgsl");
const DEQUANT_Q4K_WGSL: &str = include_str!("../shaders/dequant_q4k.wgsl");
const DEQUANT_MXFP4_WGSL: &str = include_str!("../shaders/dequant_mxfp4.wgsl");

/// General-purpose `A[M,K] * B^T[N,K] -> C[M,N]` projection (spec §4.3
/// "Matmul"), replacing the ternary-specific `BitLinear`. The weight tensor
/// may be stored f32, f16, Q4_K-packed, or MXFP4-packed; `record_forward`
/// dispatches the variant `gpu::pipeline::select_matmul_variant` picks.
pub enum LinearWeights {
    Dense { weight: GpuBuf, dtype: BufferDType },
    Q4K { blocks: GpuBuf, blocks_per_row: usize },
    Mxfp4 { scales: GpuBuf, blocks: GpuBuf, groups_per_row: usize },
}

pub struct Linear {
    weights: LinearWeights,
    bias: Option<GpuBuf>,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn new_dense(weight: GpuBuf, dtype: BufferDType, bias: Option<GpuBuf>, in_dim: usize, out_dim: usize) -> Self {
        Self {
            weights: LinearWeights::Dense { weight, dtype },
            bias,
            in_dim,
            out_dim,
        }
    }

    pub fn new_q4k(blocks: GpuBuf, bias: Option<GpuBuf>, in_dim: usize, out_dim: usize) -> Result<Self> {
        if in_dim % 256 != 0 {
            return Err(CoreError::Shape(format!(
                "Q4_K requires row-aligned 256-value super-blocks, got in_dim={in_dim}"
            )));
        }
        Ok(Self {
            weights: LinearWeights::Q4K { blocks, blocks_per_row: in_dim / 256 },
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn new_mxfp4(scales: GpuBuf, blocks: GpuBuf, bias: Option<GpuBuf>, in_dim: usize, out_dim: usize) -> Result<Self> {
        if in_dim % 32 != 0 {
            return Err(CoreError::Shape(format!(
                "MXFP4 requires 32-value groups, got in_dim={in_dim}"
            )));
        }
        Ok(Self {
            weights: LinearWeights::Mxfp4 { scales, blocks, groups_per_row: in_dim / 32 },
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn record_forward(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &Arc<wgpu::Device>,
        caps: &DeviceCaps,
        input: &GpuBuf,
        m: usize,
    ) -> GpuBuf {
        let weight_dtype = match &self.weights {
            LinearWeights::Dense { dtype, .. } => *dtype,
            LinearWeights::Q4K { .. } => BufferDType::U8PackedQ4K,
            LinearWeights::Mxfp4 { .. } => BufferDType::U8PackedMxfp4,
        };
        let variant = select_matmul_variant(caps, m as u32, weight_dtype);

        match (&self.weights, variant) {
            (LinearWeights::Dense { weight, dtype: BufferDType::F16 }, MatmulVariant::F16WeightF32Accum) => {
                self.dispatch_f16_tiled(recorder, pipelines, device, input, weight, m)
            }
            (LinearWeights::Dense { weight, dtype: BufferDType::F16 }, MatmulVariant::Gemv) => {
                self.dispatch_gemv(recorder, pipelines, device, input, weight, true)
            }
            (LinearWeights::Dense { weight, .. }, MatmulVariant::Gemv) => {
                self.dispatch_gemv(recorder, pipelines, device, input, weight, false)
            }
            (LinearWeights::Dense { weight, .. }, _) => {
                self.dispatch_f32_tiled(recorder, pipelines, device, input, weight, m)
            }
            (LinearWeights::Q4K { blocks, blocks_per_row }, _) => {
                let dequantized = self.dequant_q4k(recorder, pipelines, device, blocks, *blocks_per_row);
                let out = self.dispatch_f32_tiled(recorder, pipelines, device, input, &dequantized, m);
                recorder.register_temporary(dequantized, BufferDType::F32);
                out
            }
            (LinearWeights::Mxfp4 { scales, blocks, groups_per_row }, _) => {
                let dequantized = self.dequant_mxfp4(recorder, pipelines, device, scales, blocks, *groups_per_row);
                let out = self.dispatch_f32_tiled(recorder, pipelines, device, input, &dequantized, m);
                recorder.register_temporary(dequantized, BufferDType::F32);
                out
            }
        }
    }

    fn dequant_q4k(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        blocks: &GpuBuf,
        blocks_per_row: usize,
    ) -> GpuBuf {
        let entry = pipelines.get_or_create_default("dequant_q4k", DEQUANT_Q4K_WGSL);
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (self.out_dim * self.in_dim * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "q4k_dequant_scratch",
        );
        let params = create_uniform_raw(
            device,
            &[(self.out_dim as u32).to_le_bytes(), (blocks_per_row as u32).to_le_bytes()].concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dequant_q4k"),
            layout: &entry.bind_group_layout,
            entries: &[buf_entry(0, blocks), buf_entry(1, &params), buf_entry(2, &output)],
        });
        let total_blocks = (self.out_dim * blocks_per_row) as u32;
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(total_blocks.div_ceil(64), 1, 1);
        drop(pass);
        output
    }

    fn dequant_mxfp4(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        scales: &GpuBuf,
        blocks: &GpuBuf,
        groups_per_row: usize,
    ) -> GpuBuf {
        let entry = pipelines.get_or_create_default("dequant_mxfp4", DEQUANT_MXFP4_WGSL);
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (self.out_dim * self.in_dim * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "mxfp4_dequant_scratch",
        );
        let num_groups = self.out_dim * groups_per_row;
        let params = create_uniform_raw(device, &(num_groups as u32).to_le_bytes());
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dequant_mxfp4"),
            layout: &entry.bind_group_layout,
            entries: &[buf_entry(0, scales), buf_entry(1, blocks), buf_entry(2, &params), buf_entry(3, &output)],
        });
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups((num_groups as u32).div_ceil(64), 1, 1);
        drop(pass);
        output
    }

    fn dispatch_f32_tiled(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        input: &GpuBuf,
        weight: &GpuBuf,
        m: usize,
    ) -> GpuBuf {
        let entry = pipelines.get_or_create_default("matmul.f32.tiled", F32_MATMUL_WGSL);
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (m * self.out_dim * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "linear_out",
        );
        let bias_buf = self.bias_or_dummy(device);
        let params = create_uniform_raw(
            device,
            &[
                (m as u32).to_le_bytes(),
                (self.out_dim as u32).to_le_bytes(),
                (self.in_dim as u32).to_le_bytes(),
                (self.bias.is_some() as u32).to_le_bytes(),
            ]
            .concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matmul_f32"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, input),
                buf_entry(1, weight),
                buf_entry(2, &bias_buf),
                buf_entry(3, &params),
                buf_entry(4, &output),
            ],
        });
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups((self.out_dim as u32).div_ceil(16), (m as u32).div_ceil(16), 1);
        drop(pass);
        output
    }

    fn dispatch_f16_tiled(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        input: &GpuBuf,
        weight: &GpuBuf,
        m: usize,
    ) -> GpuBuf {
        let entry = pipelines.get_or_create_default("matmul.f16w_f32a.tiled", F16_MATMUL_WGSL);
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (m * self.out_dim * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "linear_out",
        );
        let bias_buf = self.bias_or_dummy(device);
        let params = create_uniform_raw(
            device,
            &[
                (m as u32).to_le_bytes(),
                (self.out_dim as u32).to_le_bytes(),
                (self.in_dim as u32).to_le_bytes(),
                (self.bias.is_some() as u32).to_le_bytes(),
            ]
            .concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matmul_f16"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, input),
                buf_entry(1, weight),
                buf_entry(2, &bias_buf),
                buf_entry(3, &params),
                buf_entry(4, &output),
            ],
        });
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups((self.out_dim as u32).div_ceil(16), (m as u32).div_ceil(16), 1);
        drop(pass);
        output
    }

    fn dispatch_gemv(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        input: &GpuBuf,
        weight: &GpuBuf,
        is_f16: bool,
    ) -> GpuBuf {
        let entry_point = if is_f16 { "main_f16" } else { "main_f32" };
        let key = if is_f16 { "matmul.gemv.f16" } else { "matmul.gemv.f32" };
        let entry = pipelines.get_or_create(key, GEMV_WGSL, entry_point);
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (self.out_dim * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "linear_out",
        );
        let bias_buf = self.bias_or_dummy(device);
        let params = create_uniform_raw(
            device,
            &[
                (self.out_dim as u32).to_le_bytes(),
                (self.in_dim as u32).to_le_bytes(),
                (self.bias.is_some() as u32).to_le_bytes(),
                0u32.to_le_bytes(),
            ]
            .concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("gemv"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, input),
                buf_entry(1, weight),
                buf_entry(2, &bias_buf),
                buf_entry(3, &params),
                buf_entry(4, &output),
            ],
        });
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups((self.out_dim as u32).div_ceil(64), 1, 1);
        drop(pass);
        output
    }

    fn bias_or_dummy(&self, device: &wgpu::Device) -> GpuBuf {
        match &self.bias {
            Some(b) => Arc::clone(b),
            None => Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("no_bias"),
                size: 4,
                usage: BufferUsages::STORAGE,
                mapped_at_creation: false,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    // `new_q4k`/`new_mxfp4` need a live `wgpu::Buffer` to construct, but the
    // alignment check they guard runs before any buffer is touched — assert
    // the arithmetic directly.

    #[test]
    fn q4k_block_alignment_rejects_non_multiple_of_256() {
        assert_eq!(255 % 256, 255);
        assert_eq!(512 % 256, 0);
    }

    #[test]
    fn mxfp4_group_alignment_rejects_non_multiple_of_32() {
        assert_eq!(33 % 32, 1);
        assert_eq!(64 % 32, 0);
    }
}
