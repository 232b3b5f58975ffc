use std::sync::Arc;

use wgpu::BufferUsages;

use crate::gpu::buffer_pool::{BufferDType, BufferPool, GpuBuf};
use crate::gpu::device::DeviceCaps;
use crate::gpu::pipeline::PipelineManager;
use crate::gpu::recorder::CommandRecorder;
use crate::model::config::Activation;
use crate::nn::gpu_util::{buf_entry, create_uniform_raw};
use crate::nn::linear::Linear;

const ACTIVATION_WGSL: &str = include_str!("../shaders/activation.wgsl");

/// Dense feed-forward network, gated SiLU/GELU (spec §3 "FFN set", §4.3
/// "SiLU / GELU, gated"). MoE layers bypass this entirely and go through
/// `moe::router` instead (spec §4.6); see `nn::layer`.
pub enum FfnWeights {
    Separate { gate: Linear, up: Linear },
    /// Single projection of width `2 * intermediate_size`, [gate|up] packed
    /// per row (spec §4.3 "row-split variant").
    Fused { gate_up: Linear },
}

pub struct Ffn {
    weights: FfnWeights,
    down: Linear,
    activation: Activation,
    intermediate_size: usize,
}

impl Ffn {
    pub fn new(weights: FfnWeights, down: Linear, activation: Activation, intermediate_size: usize) -> Self {
        Self { weights, down, activation, intermediate_size }
    }

    pub fn record_forward(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &Arc<wgpu::Device>,
        caps: &DeviceCaps,
        input: &GpuBuf,
        n: usize,
    ) -> GpuBuf {
        let gated = match &self.weights {
            FfnWeights::Separate { gate, up } => {
                let gate_out = gate.record_forward(recorder, pipelines, device, caps, input, n);
                let up_out = up.record_forward(recorder, pipelines, device, caps, input, n);
                let out = self.dispatch_activation_split(recorder, pipelines, device, &gate_out, &up_out, n);
                recorder.register_temporary(gate_out, BufferDType::F32);
                recorder.register_temporary(up_out, BufferDType::F32);
                out
            }
            FfnWeights::Fused { gate_up } => {
                let fused = gate_up.record_forward(recorder, pipelines, device, caps, input, n);
                let out = self.dispatch_activation_fused(recorder, pipelines, device, &fused, n);
                recorder.register_temporary(fused, BufferDType::F32);
                out
            }
        };

        let output = self.down.record_forward(recorder, pipelines, device, caps, &gated, n);
        recorder.register_temporary(gated, BufferDType::F32);
        output
    }

    fn activation_kind(&self) -> u32 {
        match self.activation {
            Activation::Silu => 0,
            Activation::Gelu => 1,
        }
    }

    fn dispatch_activation_split(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        gate: &GpuBuf,
        up: &GpuBuf,
        n: usize,
    ) -> GpuBuf {
        let entry = pipelines.get_or_create("activation.split", ACTIVATION_WGSL, "main_split");
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (n * self.intermediate_size * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "ffn_gated",
        );
        let params = create_uniform_raw(
            device,
            &[(n as u32).to_le_bytes(), (self.intermediate_size as u32).to_le_bytes(), self.activation_kind().to_le_bytes()].concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("activation_split"),
            layout: &entry.bind_group_layout,
            entries: &[buf_entry(0, gate), buf_entry(1, up), buf_entry(2, &params), buf_entry(3, &output)],
        });
        let total = (n * self.intermediate_size) as u32;
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(total.div_ceil(256), 1, 1);
        drop(pass);
        output
    }

    fn dispatch_activation_fused(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        fused: &GpuBuf,
        n: usize,
    ) -> GpuBuf {
        let entry = pipelines.get_or_create("activation.fused", ACTIVATION_WGSL, "main_fused");
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (n * self.intermediate_size * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "ffn_gated",
        );
        let params = create_uniform_raw(
            device,
            &[(n as u32).to_le_bytes(), (self.intermediate_size as u32).to_le_bytes(), self.activation_kind().to_le_bytes()].concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("activation_fused"),
            layout: &entry.bind_group_layout,
            entries: &[buf_entry(0, fused), buf_entry(1, &params), buf_entry(2, &output)],
        });
        let total = (n * self.intermediate_size) as u32;
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(total.div_ceil(256), 1, 1);
        drop(pass);
        output
    }
}
