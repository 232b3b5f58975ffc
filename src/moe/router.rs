use std::sync::Arc;

use wgpu::BufferUsages;

use crate::error::{CoreError, Result};
use crate::gpu::buffer_pool::{BufferDType, BufferPool, GpuBuf};
use crate::gpu::device::DeviceCaps;
use crate::gpu::pipeline::PipelineManager;
use crate::gpu::recorder::CommandRecorder;
use crate::model::config::Activation;
use crate::moe::expert_cache::{ExpertCache, ExpertWeights};
use crate::nn::ffn::{Ffn, FfnWeights};
use crate::nn::gpu_util::{buf_entry, create_uniform_raw};
use crate::nn::linear::Linear;

const SOFTMAX_TOPK_WGSL: &str = include_str!("../shaders/softmax_topk.wgsl");
const MOE_GATHER_WGSL: &str = include_str!("../shaders/moe_gather.wgsl");
const MOE_SCATTER_ADD_WGSL: &str = include_str!("../shaders/moe_scatter_add.wgsl");

/// Mirrors `shaders/moe_gather.wgsl`'s `DROPPED` sentinel: a `token_map`
/// slot that never got assigned because its expert bucket was full.
const DROPPED_SENTINEL: u32 = 0xFFFF_FFFF;

/// Per-layer MoE engine step (spec §4.6): router -> softmax+top-k -> gather
/// -> per-expert FFN via the `ExpertCache` -> weighted scatter-add.
pub struct MoeRouter {
    router_weight: Linear,
    num_experts: usize,
    top_k: usize,
    normalize: bool,
    hidden_size: usize,
    intermediate_size: usize,
    activation: Activation,
}

impl MoeRouter {
    pub fn new(
        router_weight: Linear,
        num_experts: usize,
        top_k: usize,
        normalize: bool,
        hidden_size: usize,
        intermediate_size: usize,
        activation: Activation,
    ) -> Self {
        Self {
            router_weight,
            num_experts,
            top_k,
            normalize,
            hidden_size,
            intermediate_size,
            activation,
        }
    }

    /// Run the full per-layer MoE step for `input[n, hidden_size]`, returning
    /// `Y[n, hidden_size]`. Spans two submissions: the router+gather pass and
    /// the per-expert-FFN+scatter pass, separated by the host readback of
    /// `token_counts` the spec calls the only unavoidable host-sync point in
    /// a forward (spec §4.6, §5 "suspension points").
    #[allow(clippy::too_many_arguments)]
    pub async fn record_forward(
        &self,
        device: &Arc<wgpu::Device>,
        queue: &wgpu::Queue,
        pool: &BufferPool,
        pipelines: &mut PipelineManager,
        caps: &DeviceCaps,
        expert_cache: &ExpertCache,
        layer: usize,
        input: &GpuBuf,
        n: usize,
    ) -> Result<GpuBuf> {
        // Every token can route to a given expert at most once (top-k picks
        // distinct experts per token), so `n` is a safe worst-case capacity
        // per expert slot.
        let max_tokens_per_expert = n.max(1);

        let mut recorder = CommandRecorder::new(device, pool, "moe_router_gather");

        let logits = self
            .router_weight
            .record_forward(&mut recorder, pipelines, device, caps, input, n);

        let indices = pool.acquire(
            (n * self.top_k * 4) as u64,
            BufferDType::U32,
            BufferUsages::STORAGE,
            "moe_indices",
        );
        let weights = pool.acquire(
            (n * self.top_k * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE,
            "moe_weights",
        );
        self.dispatch_softmax_topk(&mut recorder, pipelines, device, &logits, &indices, &weights, n);
        recorder.register_temporary(logits, BufferDType::F32);

        let token_counts = pool.acquire(
            (self.num_experts * 4) as u64,
            BufferDType::U32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "moe_token_counts",
        );
        recorder.encoder_mut().clear_buffer(&token_counts, 0, None);

        let token_map = pool.acquire(
            (n * self.top_k * 4) as u64,
            BufferDType::U32,
            BufferUsages::STORAGE,
            "moe_token_map",
        );
        self.dispatch_gather_assign(&mut recorder, pipelines, device, &indices, &token_counts, &token_map, n, max_tokens_per_expert);

        let gathered = pool.acquire(
            (self.num_experts * max_tokens_per_expert * self.hidden_size * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            "moe_gathered",
        );
        self.dispatch_gather_copy(&mut recorder, pipelines, device, input, &token_map, &gathered, n, max_tokens_per_expert);

        recorder.submit(queue, device);

        let counts_raw = pool.read(queue, &token_counts, (self.num_experts * 4) as u64).await?;
        let counts: Vec<u32> = counts_raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().expect("chunks_exact(4)")))
            .collect();

        // Build token_offsets from token_map on the host and validate full
        // coverage (spec §4.6 step 4): every (token, k-slot) pair must have
        // claimed a real slot. A surviving DROPPED sentinel means a token
        // was routed to an expert bucket that was already at capacity,
        // which `max_tokens_per_expert` is sized to make unreachable under
        // the one-slot-per-token-per-k invariant — if it ever happens, that
        // invariant broke somewhere upstream, so this is a hard error, not
        // a silent drop.
        let token_map_raw = pool.read(queue, &token_map, (n * self.top_k * 4) as u64).await?;
        let token_offsets: Vec<u32> = token_map_raw
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes(b.try_into().expect("chunks_exact(4)")))
            .collect();
        if let Some(pair) = token_offsets.iter().position(|&slot| slot == DROPPED_SENTINEL) {
            let token = pair / self.top_k.max(1);
            return Err(CoreError::Dispatch(format!(
                "moe routing: token {token} has no assigned slot (expert bucket over capacity {max_tokens_per_expert}); token_map coverage check failed"
            )));
        }

        let expert_outputs = pool.acquire(
            (self.num_experts * max_tokens_per_expert * self.hidden_size * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            "moe_expert_outputs",
        );

        let mut recorder2 = CommandRecorder::new(device, pool, "moe_experts_scatter");
        for (e, &raw_count) in counts.iter().enumerate() {
            let count = (raw_count as usize).min(max_tokens_per_expert);
            if count == 0 {
                continue;
            }
            expert_cache.mark_in_use(layer, e).await;
            let result = self
                .record_expert_ffn(&mut recorder2, pipelines, device, caps, expert_cache, layer, e, &gathered, &expert_outputs, max_tokens_per_expert, count)
                .await;
            expert_cache.mark_not_in_use(layer, e).await;
            result?;
        }

        let hidden = self.hidden_size;
        let output = pool.acquire(
            (n * hidden * 4) as u64,
            BufferDType::F32,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "moe_layer_out",
        );
        self.dispatch_scatter_add(&mut recorder2, pipelines, device, &expert_outputs, &weights, &token_map, &output, n, max_tokens_per_expert);

        recorder2.register_temporary(indices, BufferDType::U32);
        recorder2.register_temporary(weights, BufferDType::F32);
        recorder2.register_temporary(token_counts, BufferDType::U32);
        recorder2.register_temporary(token_map, BufferDType::U32);
        recorder2.register_temporary(gathered, BufferDType::F32);
        recorder2.register_temporary(expert_outputs, BufferDType::F32);
        recorder2.submit(queue, device);

        Ok(output)
    }

    fn dispatch_softmax_topk(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        logits: &GpuBuf,
        indices: &GpuBuf,
        weights: &GpuBuf,
        n: usize,
    ) {
        let entry = pipelines.get_or_create_default("moe.softmax_topk", SOFTMAX_TOPK_WGSL);
        let params = create_uniform_raw(
            device,
            &[
                (n as u32).to_le_bytes(),
                (self.num_experts as u32).to_le_bytes(),
                (self.top_k as u32).to_le_bytes(),
                (self.normalize as u32).to_le_bytes(),
            ]
            .concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("moe_softmax_topk"),
            layout: &entry.bind_group_layout,
            entries: &[buf_entry(0, logits), buf_entry(1, &params), buf_entry(2, indices), buf_entry(3, weights)],
        });
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups((n as u32).div_ceil(64), 1, 1);
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_gather_assign(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        indices: &GpuBuf,
        token_counts: &GpuBuf,
        token_map: &GpuBuf,
        n: usize,
        max_tokens_per_expert: usize,
    ) {
        let entry = pipelines.get_or_create("moe.gather.assign", MOE_GATHER_WGSL, "main_assign");
        let params = create_uniform_raw(
            device,
            &[
                (n as u32).to_le_bytes(),
                (self.top_k as u32).to_le_bytes(),
                (self.hidden_size as u32).to_le_bytes(),
                (self.num_experts as u32).to_le_bytes(),
                (max_tokens_per_expert as u32).to_le_bytes(),
            ]
            .concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("moe_gather_assign"),
            layout: &entry.bind_group_layout,
            entries: &[buf_entry(0, indices), buf_entry(1, &params), buf_entry(2, token_counts), buf_entry(3, token_map)],
        });
        let total = (n * self.top_k) as u32;
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(total.div_ceil(64), 1, 1);
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_gather_copy(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        hidden: &GpuBuf,
        token_map: &GpuBuf,
        gathered: &GpuBuf,
        n: usize,
        max_tokens_per_expert: usize,
    ) {
        let entry = pipelines.get_or_create("moe.gather.copy", MOE_GATHER_WGSL, "main_copy");
        let params = create_uniform_raw(
            device,
            &[
                (n as u32).to_le_bytes(),
                (self.top_k as u32).to_le_bytes(),
                (self.hidden_size as u32).to_le_bytes(),
                (self.num_experts as u32).to_le_bytes(),
                (max_tokens_per_expert as u32).to_le_bytes(),
            ]
            .concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("moe_gather_copy"),
            layout: &entry.bind_group_layout,
            entries: &[buf_entry(0, hidden), buf_entry(1, token_map), buf_entry(2, &params), buf_entry(3, gathered)],
        });
        let total = (n * self.top_k * self.hidden_size) as u32;
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(total.div_ceil(256), 1, 1);
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_expert_ffn(
        &self,
        recorder: &mut CommandRecorder<'_>,
        pipelines: &mut PipelineManager,
        device: &Arc<wgpu::Device>,
        caps: &DeviceCaps,
        expert_cache: &ExpertCache,
        layer: usize,
        expert: usize,
        gathered: &GpuBuf,
        expert_outputs: &GpuBuf,
        max_tokens_per_expert: usize,
        count: usize,
    ) -> Result<()> {
        let weights = expert_cache.ensure_loaded(layer, expert).await?;
        let ffn = self.build_expert_ffn(&weights)?;

        let row_bytes = (self.hidden_size * 4) as u64;
        let slot_offset = (expert * max_tokens_per_expert) as u64 * row_bytes;
        let slice_bytes = count as u64 * row_bytes;

        let pool: &BufferPool = recorder.pool();
        let expert_input = pool.acquire(slice_bytes, BufferDType::F32, BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST, "moe_expert_input");
        recorder
            .encoder_mut()
            .copy_buffer_to_buffer(gathered, slot_offset, &expert_input, 0, slice_bytes);

        let expert_out = ffn.record_forward(recorder, pipelines, device, caps, &expert_input, count);
        recorder
            .encoder_mut()
            .copy_buffer_to_buffer(&expert_out, 0, expert_outputs, slot_offset, slice_bytes);

        recorder.register_temporary(expert_input, BufferDType::F32);
        recorder.register_temporary(expert_out, BufferDType::F32);
        Ok(())
    }

    fn build_expert_ffn(&self, weights: &ExpertWeights) -> Result<Ffn> {
        let hidden = self.hidden_size;
        let inter = self.intermediate_size;
        let ffn = match weights {
            ExpertWeights::Dense { w_gate, w_up, w_down } => Ffn::new(
                FfnWeights::Separate {
                    gate: Linear::new_dense(Arc::clone(w_gate), BufferDType::F32, None, hidden, inter),
                    up: Linear::new_dense(Arc::clone(w_up), BufferDType::F32, None, hidden, inter),
                },
                Linear::new_dense(Arc::clone(w_down), BufferDType::F32, None, inter, hidden),
                self.activation,
                inter,
            ),
            ExpertWeights::Mxfp4 {
                w_gate_up_blocks,
                w_gate_up_scales,
                w_gate_up_bias,
                w_down_blocks,
                w_down_scales,
                w_down_bias,
            } => Ffn::new(
                FfnWeights::Fused {
                    gate_up: Linear::new_mxfp4(Arc::clone(w_gate_up_scales), Arc::clone(w_gate_up_blocks), w_gate_up_bias.clone(), hidden, 2 * inter)?,
                },
                Linear::new_mxfp4(Arc::clone(w_down_scales), Arc::clone(w_down_blocks), w_down_bias.clone(), inter, hidden)?,
                self.activation,
                inter,
            ),
        };
        Ok(ffn)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_scatter_add(
        &self,
        recorder: &mut CommandRecorder,
        pipelines: &mut PipelineManager,
        device: &wgpu::Device,
        expert_outputs: &GpuBuf,
        weights: &GpuBuf,
        token_map: &GpuBuf,
        output: &GpuBuf,
        n: usize,
        max_tokens_per_expert: usize,
    ) {
        let entry = pipelines.get_or_create_default("moe.scatter_add", MOE_SCATTER_ADD_WGSL);
        let params = create_uniform_raw(
            device,
            &[
                (n as u32).to_le_bytes(),
                (self.top_k as u32).to_le_bytes(),
                (self.hidden_size as u32).to_le_bytes(),
                (max_tokens_per_expert as u32).to_le_bytes(),
            ]
            .concat(),
        );
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("moe_scatter_add"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, expert_outputs),
                buf_entry(1, weights),
                buf_entry(2, token_map),
                buf_entry(3, &params),
                buf_entry(4, output),
            ],
        });
        let total = (n * self.hidden_size) as u32;
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(total.div_ceil(256), 1, 1);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn per_expert_capacity_bounded_by_token_count() {
        // Every token contributes at most one slot per expert (top-k picks
        // distinct experts), so n is always a safe per-expert capacity.
        let n = 17usize;
        assert!(n.max(1) >= n);
    }
}
