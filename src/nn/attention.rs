use std::sync::Arc;

use wgpu::BufferUsages;

use crate::gpu::buffer_pool::{BufferDType, BufferPool, GpuBuf};
use crate::gpu::device::DeviceCaps;
use crate::gpu::pipeline::{attention_cache_key, select_attention_variant, PipelineManager};
use crate::gpu::recorder::CommandRecorder;
use crate::kv::cache::KvCache;
use crate::nn::gpu_util::{buf_entry, create_uniform_raw};
use crate::nn::linear::Linear;
use crate::nn::rmsnorm::record_rmsnorm;
use crate::nn::rope::{record_apply_rope, RopeTable};

const ATTENTION_WGSL: &str = include_str!("../shaders/attention.wgsl");

/// Multi-head (grouped-query) attention sublayer (spec §3 "Layer weights",
/// §4.3 "Attention"), replacing the ternary-specific BitLinear-based
/// `Attention`. Q/K/V/O projections are general `Linear`s so any of the
/// matmul variants (dense f32/f16, Q4_K, MXFP4) can back them.
pub struct Attention {
    pub(crate) q_proj: Linear,
    pub(crate) k_proj: Linear,
    pub(crate) v_proj: Linear,
    pub(crate) o_proj: Linear,
    q_norm: Option<GpuBuf>,
    k_norm: Option<GpuBuf>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rms_eps: f32,
    sliding_window: Option<usize>,
}

impl Attention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        o_proj: Linear,
        q_norm: Option<GpuBuf>,
        k_norm: Option<GpuBuf>,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        rms_eps: f32,
        sliding_window: Option<usize>,
    ) -> Self {
        Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
            rms_eps,
            sliding_window,
        }
    }

    /// Forward pass: `input[n, hidden]` -> `output[n, hidden]` (spec §4.3).
    /// `start_pos` is the KV position the first of the `n` new tokens lands
    /// at; `kv` and `layer` identify which cache slab to append into.
    #[allow(clippy::too_many_arguments)]
    pub fn record_forward(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &Arc<wgpu::Device>,
        caps: &DeviceCaps,
        input: &GpuBuf,
        n: usize,
        start_pos: usize,
        kv: &mut dyn KvCache,
        layer: usize,
        rope_table: &RopeTable,
    ) -> GpuBuf {
        let q = self.q_proj.record_forward(recorder, pipelines, device, caps, input, n);
        let k = self.k_proj.record_forward(recorder, pipelines, device, caps, input, n);
        let v = self.v_proj.record_forward(recorder, pipelines, device, caps, input, n);

        let q_normed = match &self.q_norm {
            Some(w) => {
                let out = record_rmsnorm(recorder, pipelines, device, &q, w, n * self.num_heads, self.head_dim, self.rms_eps);
                recorder.register_temporary(q, BufferDType::F32);
                out
            }
            None => q,
        };
        let k_normed = match &self.k_norm {
            Some(w) => {
                let out = record_rmsnorm(recorder, pipelines, device, &k, w, n * self.num_kv_heads, self.head_dim, self.rms_eps);
                recorder.register_temporary(k, BufferDType::F32);
                out
            }
            None => k,
        };

        let q_roped = record_apply_rope(recorder, pipelines, device, &q_normed, rope_table, n, self.num_heads, self.head_dim, start_pos);
        let k_roped = record_apply_rope(recorder, pipelines, device, &k_normed, rope_table, n, self.num_kv_heads, self.head_dim, start_pos);
        recorder.register_temporary(q_normed, BufferDType::F32);
        recorder.register_temporary(k_normed, BufferDType::F32);

        kv.record_update_from_gpu(recorder.encoder_mut(), layer, &k_roped, &v, start_pos, n)
            .expect("KV append with n > 0 tokens");
        recorder.register_temporary(k_roped, BufferDType::F32);
        recorder.register_temporary(v, BufferDType::F32);

        let (k_buf, v_buf, kv_len) = kv.get_gpu_buffers(layer);
        let attn_out = self.dispatch_attention(recorder, pipelines, device, caps, &q_roped, k_buf, v_buf, n, kv_len, start_pos);
        recorder.register_temporary(q_roped, BufferDType::F32);

        let output = self.o_proj.record_forward(recorder, pipelines, device, caps, &attn_out, n);
        recorder.register_temporary(attn_out, BufferDType::F32);
        output
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_attention(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        caps: &DeviceCaps,
        q: &GpuBuf,
        k: &wgpu::Buffer,
        v: &wgpu::Buffer,
        n: usize,
        kv_len: usize,
        start_pos: usize,
    ) -> GpuBuf {
        let variant = select_attention_variant(caps, n as u32, kv_len as u32);
        let entry = pipelines.get_or_create_default(attention_cache_key(variant), ATTENTION_WGSL);
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (n * self.num_heads * self.head_dim * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "attn_out",
        );

        let window = self.sliding_window.unwrap_or(0) as u32;
        let inv_sqrt_d = 1.0 / (self.head_dim as f32).sqrt();
        let params_data = [
            (n as u32).to_le_bytes(),
            (self.num_heads as u32).to_le_bytes(),
            (self.num_kv_heads as u32).to_le_bytes(),
            (self.head_dim as u32).to_le_bytes(),
            (kv_len as u32).to_le_bytes(),
            (start_pos as u32).to_le_bytes(),
            window.to_le_bytes(),
            inv_sqrt_d.to_le_bytes(),
        ]
        .concat();
        let params = create_uniform_raw(device, &params_data);

        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("attention"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, q),
                buf_entry(1, k),
                buf_entry(2, v),
                buf_entry(3, &params),
                buf_entry(4, &output),
            ],
        });

        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(n as u32, self.num_heads as u32, 1);
        drop(pass);

        output
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn gqa_group_size_divides_heads_by_kv_heads() {
        assert_eq!(32 / 8, 4);
        assert_eq!(8 / 8, 1);
    }
}
