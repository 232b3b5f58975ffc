use std::sync::Arc;

use wgpu::BufferUsages;

use crate::error::Result;
use crate::gpu::buffer_pool::{BufferDType, BufferPool, GpuBuf};
use crate::gpu::device::DeviceCaps;
use crate::gpu::pipeline::PipelineManager;
use crate::gpu::recorder::CommandRecorder;
use crate::kv::cache::KvCache;
use crate::moe::expert_cache::ExpertCache;
use crate::moe::router::MoeRouter;
use crate::nn::attention::Attention;
use crate::nn::ffn::Ffn;
use crate::nn::gpu_util::buf_entry;
use crate::nn::rmsnorm::record_rmsnorm;
use crate::nn::rope::RopeTable;

const ELEMENTWISE_WGSL: &str = include_str!("../shaders/elementwise.wgsl");

/// Which residual/norm template a layer follows (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// `x <- x + attn(rmsnorm(x)); x <- x + ffn(rmsnorm(x))`.
    Standard,
    /// `x <- x + rmsnorm(attn(rmsnorm(x))); x <- x + rmsnorm(ffn(rmsnorm(x)))`.
    Sandwich,
}

pub enum LayerFfn {
    Dense(Ffn),
    Moe {
        router: MoeRouter,
        expert_cache: Arc<ExpertCache>,
        layer_index: usize,
    },
}

/// One transformer layer: attention + FFN (dense or MoE), pre-norm or
/// sandwich-norm (spec §4.7).
pub struct Layer {
    norm_kind: NormKind,
    input_norm: GpuBuf,
    post_attn_norm: GpuBuf,
    pre_ffn_norm: Option<GpuBuf>,
    post_ffn_norm: Option<GpuBuf>,
    pub(crate) attention: Attention,
    pub(crate) ffn: LayerFfn,
    hidden_size: usize,
    rms_eps: f32,
}

impl Layer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        norm_kind: NormKind,
        input_norm: GpuBuf,
        post_attn_norm: GpuBuf,
        pre_ffn_norm: Option<GpuBuf>,
        post_ffn_norm: Option<GpuBuf>,
        attention: Attention,
        ffn: LayerFfn,
        hidden_size: usize,
        rms_eps: f32,
    ) -> Self {
        Self {
            norm_kind,
            input_norm,
            post_attn_norm,
            pre_ffn_norm,
            post_ffn_norm,
            attention,
            ffn,
            hidden_size,
            rms_eps,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_forward(
        &self,
        recorder: &mut CommandRecorder<'_>,
        pipelines: &mut PipelineManager,
        device: &Arc<wgpu::Device>,
        queue: &wgpu::Queue,
        pool: &BufferPool,
        caps: &DeviceCaps,
        input: &GpuBuf,
        n: usize,
        start_pos: usize,
        kv: &mut dyn KvCache,
        layer: usize,
        rope_table: &RopeTable,
    ) -> Result<GpuBuf> {
        let normed_in = record_rmsnorm(recorder, pipelines, device, input, &self.input_norm, n, self.hidden_size, self.rms_eps);
        let mut attn_out = self
            .attention
            .record_forward(recorder, pipelines, device, caps, &normed_in, n, start_pos, kv, layer, rope_table);
        recorder.register_temporary(normed_in, BufferDType::F32);

        if self.norm_kind == NormKind::Sandwich {
            let sandwiched = record_rmsnorm(recorder, pipelines, device, &attn_out, &self.post_attn_norm, n, self.hidden_size, self.rms_eps);
            recorder.register_temporary(attn_out, BufferDType::F32);
            attn_out = sandwiched;
        }

        let after_attn = self.dispatch_add(recorder, pipelines, device, input, &attn_out, n * self.hidden_size);
        recorder.register_temporary(attn_out, BufferDType::F32);

        let ffn_norm_weight = if self.norm_kind == NormKind::Sandwich {
            self.pre_ffn_norm.as_ref().expect("sandwich-norm layer must carry pre_ffn_norm")
        } else {
            &self.post_attn_norm
        };
        let normed_ffn = record_rmsnorm(recorder, pipelines, device, &after_attn, ffn_norm_weight, n, self.hidden_size, self.rms_eps);

        let mut ffn_out = match &self.ffn {
            LayerFfn::Dense(ffn) => ffn.record_forward(recorder, pipelines, device, caps, &normed_ffn, n),
            LayerFfn::Moe { router, expert_cache, layer_index } => {
                // The MoE step needs a host readback of `token_counts` partway
                // through (spec §4.6), so it manages its own submissions
                // rather than recording into the caller's recorder.
                router
                    .record_forward(device, queue, pool, pipelines, caps, expert_cache, *layer_index, &normed_ffn, n)
                    .await?
            }
        };
        recorder.register_temporary(normed_ffn, BufferDType::F32);

        if self.norm_kind == NormKind::Sandwich {
            let post_ffn = self.post_ffn_norm.as_ref().expect("sandwich-norm layer must carry post_ffn_norm");
            let sandwiched = record_rmsnorm(recorder, pipelines, device, &ffn_out, post_ffn, n, self.hidden_size, self.rms_eps);
            recorder.register_temporary(ffn_out, BufferDType::F32);
            ffn_out = sandwiched;
        }

        let output = self.dispatch_add(recorder, pipelines, device, &after_attn, &ffn_out, n * self.hidden_size);
        recorder.register_temporary(after_attn, BufferDType::F32);
        recorder.register_temporary(ffn_out, BufferDType::F32);
        Ok(output)
    }

    fn dispatch_add(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        a: &GpuBuf,
        b: &GpuBuf,
        num_elements: usize,
    ) -> GpuBuf {
        let entry = pipelines.get_or_create_default("elementwise.add", ELEMENTWISE_WGSL);
        let pool: &BufferPool = recorder.pool();
        let output = pool.acquire(
            (num_elements * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "residual_out",
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("residual_add"),
            layout: &entry.bind_group_layout,
            entries: &[buf_entry(0, a), buf_entry(1, b), buf_entry(2, &output)],
        });
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(((num_elements as u32) + 255) / 256, 1, 1);
        drop(pass);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_kind_equality_distinguishes_templates() {
        assert_eq!(NormKind::Standard, NormKind::Standard);
        assert_ne!(NormKind::Standard, NormKind::Sandwich);
    }
}
