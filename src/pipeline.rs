use std::sync::Arc;

use wgpu::BufferUsages;

use crate::error::{CoreError, Result};
use crate::gpu::buffer_pool::{BufferDType, BufferPool, GpuBuf};
use crate::gpu::device::DeviceCaps;
use crate::gpu::pipeline::PipelineManager;
use crate::gpu::recorder::CommandRecorder;
use crate::kv::cache::{self, ContiguousKv, KvCache, SlidingWindowKv};
use crate::model::config::{ModelConfig, Quantization};
use crate::model::weights::WeightStore;
use crate::moe::expert_cache::ExpertCache;
use crate::moe::router::MoeRouter;
use crate::nn::attention::Attention;
use crate::nn::ffn::{Ffn, FfnWeights};
use crate::nn::gpu_util::{buf_entry, ceil_div, create_uniform_raw};
use crate::nn::layer::{Layer, LayerFfn, NormKind};
use crate::nn::linear::Linear;
use crate::nn::rmsnorm::record_rmsnorm;
use crate::nn::rope::{bake_rope_table, RopeTable};

const EMBEDDING_WGSL: &str = include_str!("shaders/embedding.wgsl");
const SCALE_WGSL: &str = include_str!("shaders/scale.wgsl");

fn weight(weights: &WeightStore, name: &str) -> Result<GpuBuf> {
    weights
        .get(name)
        .cloned()
        .ok_or_else(|| CoreError::MissingWeight(name.to_string()))
}

fn optional_weight(weights: &WeightStore, name: &str) -> Option<GpuBuf> {
    weights.get(name).cloned()
}

/// Build a `Linear` for a dense projection, dispatching on the model's
/// global quantization kind (spec §3 "Weight tensor").
fn build_linear(weights: &WeightStore, config: &ModelConfig, prefix: &str, in_dim: usize, out_dim: usize, bias: Option<GpuBuf>) -> Result<Linear> {
    match config.quantization {
        Quantization::Q4KM => Linear::new_q4k(weight(weights, &format!("{prefix}.weight"))?, bias, in_dim, out_dim),
        Quantization::Mxfp4 => Linear::new_mxfp4(weight(weights, &format!("{prefix}.scales"))?, weight(weights, &format!("{prefix}.blocks"))?, bias, in_dim, out_dim),
        Quantization::F32 | Quantization::F16 | Quantization::Bf16 => {
            Ok(Linear::new_dense(weight(weights, &format!("{prefix}.weight"))?, BufferDType::F32, bias, in_dim, out_dim))
        }
    }
}

/// Gather `table[ids]` into `[n, hidden_size]`, then optionally scale by
/// `sqrt(hidden_size)` (spec §4.8 "embedding scale").
fn dispatch_embedding(
    recorder: &mut CommandRecorder,
    pipelines: &mut PipelineManager,
    device: &wgpu::Device,
    pool: &BufferPool,
    embed_tokens: &GpuBuf,
    token_ids: &[u32],
    hidden_size: usize,
    vocab_size: usize,
    scale_embeddings: bool,
) -> GpuBuf {
    let n = token_ids.len();
    let entry = pipelines.get_or_create_default("embedding", EMBEDDING_WGSL);

    let ids_bytes: Vec<u8> = token_ids.iter().flat_map(|id| id.to_le_bytes()).collect();
    let ids_buf = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("embedding_ids"),
        size: ids_bytes.len().max(4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: true,
    });
    {
        let mut view = ids_buf.slice(..).get_mapped_range_mut();
        view[..ids_bytes.len()].copy_from_slice(&ids_bytes);
    }
    ids_buf.unmap();

    let gathered = pool.acquire((n * hidden_size * 4) as u64, BufferDType::F32, BufferUsages::STORAGE | BufferUsages::COPY_SRC, "embed_out");

    let params_data = [(n as u32).to_le_bytes(), (hidden_size as u32).to_le_bytes(), (vocab_size as u32).to_le_bytes()].concat();
    let params = create_uniform_raw(device, &params_data);

    let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("embedding"),
        layout: &entry.bind_group_layout,
        entries: &[buf_entry(0, &ids_buf), buf_entry(1, embed_tokens), buf_entry(2, &gathered), buf_entry(3, &params)],
    });
    {
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        pass.dispatch_workgroups(ceil_div((n * hidden_size) as u32, 256), 1, 1);
    }

    if !scale_embeddings {
        return gathered;
    }

    let scale_entry = pipelines.get_or_create_default("scale", SCALE_WGSL);
    let scaled = pool.acquire((n * hidden_size * 4) as u64, BufferDType::F32, BufferUsages::STORAGE | BufferUsages::COPY_SRC, "embed_scaled");
    let scale_value = (hidden_size as f32).sqrt();
    let scale_params = create_uniform_raw(device, &scale_value.to_le_bytes());
    let scale_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("embed_scale"),
        layout: &scale_entry.bind_group_layout,
        entries: &[buf_entry(0, &gathered), buf_entry(1, &scaled), buf_entry(2, &scale_params)],
    });
    {
        let encoder = recorder.encoder_mut();
        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&scale_entry.pipeline);
        pass.set_bind_group(0, Some(&scale_bg), &[]);
        pass.dispatch_workgroups(ceil_div((n * hidden_size) as u32, 256), 1, 1);
    }
    recorder.register_temporary(gathered, BufferDType::F32);
    scaled
}

/// Full model forward pipeline: embedding -> L layers -> final norm -> lm
/// head (spec §4.8). Owns the KV caches, RoPE tables, and layer stack; the
/// buffer pool and pipeline cache are process-scoped and live with it.
pub struct ModelPipeline {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    caps: DeviceCaps,
    config: ModelConfig,
    pool: Arc<BufferPool>,
    pipelines: PipelineManager,
    layers: Vec<Layer>,
    final_norm: GpuBuf,
    lm_head: Linear,
    rope_full: RopeTable,
    rope_local: Option<RopeTable>,
    full_kv: ContiguousKv,
    sliding_kv: Option<SlidingWindowKv>,
    embed_tokens: GpuBuf,
    seq_len: usize,
}

impl ModelPipeline {
    pub fn build(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        caps: DeviceCaps,
        config: ModelConfig,
        weights: &WeightStore,
        expert_cache: Option<Arc<ExpertCache>>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(BufferPool::new(Arc::clone(&device)));
        let pipelines = PipelineManager::new(Arc::clone(&device));

        let embed_tokens = weight(weights, "model.embed_tokens.weight")?;
        let final_norm = weight(weights, "model.norm.weight")?;
        let lm_head = if config.tied_embeddings {
            Linear::new_dense(Arc::clone(&embed_tokens), BufferDType::F32, None, config.hidden_size, config.vocab_size)
        } else {
            build_linear(weights, &config, "lm_head", config.hidden_size, config.vocab_size, None)?
        };

        let rope_full = bake_rope_table(&device, config.max_seq_len, config.head_dim, config.rope_theta, config.rope_scaling_kind, config.rope_scale);
        let rope_local = config
            .rope_theta_local
            .map(|theta_local| bake_rope_table(&device, config.max_seq_len, config.head_dim, theta_local, config.rope_scaling_kind, config.rope_scale));

        let mut layers = Vec::with_capacity(config.num_layers);
        for l in 0..config.num_layers {
            layers.push(Self::build_layer(weights, &config, l, expert_cache.clone())?);
        }

        let full_kv = cache::new_contiguous(&device, config.num_layers, config.max_seq_len, config.num_kv_heads, config.head_dim, &caps);
        let sliding_kv = config
            .sliding_window
            .map(|window| cache::new_sliding(&device, config.num_layers, window, config.num_kv_heads, config.head_dim, &caps));

        Ok(Self {
            device,
            queue,
            caps,
            config,
            pool,
            pipelines,
            layers,
            final_norm,
            lm_head,
            rope_full,
            rope_local,
            full_kv,
            sliding_kv,
            embed_tokens,
            seq_len: 0,
        })
    }

    fn build_layer(weights: &WeightStore, config: &ModelConfig, l: usize, expert_cache: Option<Arc<ExpertCache>>) -> Result<Layer> {
        let p = format!("model.layers.{l}");
        let input_norm = weight(weights, &format!("{p}.input_layernorm.weight"))?;
        let post_attn_norm = weight(weights, &format!("{p}.post_attention_layernorm.weight"))?;
        let is_sandwich = weights.has(&format!("{p}.pre_feedforward_layernorm.weight"));
        let (pre_ffn_norm, post_ffn_norm) = if is_sandwich {
            (
                Some(weight(weights, &format!("{p}.pre_feedforward_layernorm.weight"))?),
                Some(weight(weights, &format!("{p}.post_feedforward_layernorm.weight"))?),
            )
        } else {
            (None, None)
        };
        let norm_kind = if is_sandwich { NormKind::Sandwich } else { NormKind::Standard };

        let attn_bias = |suffix: &str| -> Option<GpuBuf> {
            if config.attention_bias {
                optional_weight(weights, &format!("{p}.self_attn.{suffix}.bias"))
            } else {
                None
            }
        };
        let hidden = config.hidden_size;
        let kv_dim = config.num_kv_heads * config.head_dim;
        let q_proj = build_linear(weights, config, &format!("{p}.self_attn.q_proj"), hidden, hidden, attn_bias("q_proj"))?;
        let k_proj = build_linear(weights, config, &format!("{p}.self_attn.k_proj"), hidden, kv_dim, attn_bias("k_proj"))?;
        let v_proj = build_linear(weights, config, &format!("{p}.self_attn.v_proj"), hidden, kv_dim, attn_bias("v_proj"))?;
        let o_proj = build_linear(weights, config, &format!("{p}.self_attn.o_proj"), hidden, hidden, None)?;
        let q_norm = optional_weight(weights, &format!("{p}.self_attn.q_norm.weight"));
        let k_norm = optional_weight(weights, &format!("{p}.self_attn.k_norm.weight"));

        let sliding_window = if config.is_sliding_layer(l) { config.sliding_window } else { None };
        let attention = Attention::new(q_proj, k_proj, v_proj, o_proj, q_norm, k_norm, config.num_heads, config.num_kv_heads, config.head_dim, config.rms_eps, sliding_window);

        let ffn = if config.is_moe_layer(l) {
            let moe_cfg = config.moe.as_ref().ok_or_else(|| CoreError::Config(format!("layer {l} is MoE but model has no moe config")))?;
            let expert_cache = expert_cache
                .clone()
                .ok_or_else(|| CoreError::Config(format!("layer {l} is MoE but no expert cache was provided")))?;
            let router_weight = Linear::new_dense(weight(weights, &format!("{p}.mlp.router.weight"))?, BufferDType::F32, None, hidden, moe_cfg.num_experts);
            let router = MoeRouter::new(router_weight, moe_cfg.num_experts, moe_cfg.top_k, true, hidden, config.intermediate_size, config.activation);
            LayerFfn::Moe { router, expert_cache, layer_index: l }
        } else {
            let down = build_linear(weights, config, &format!("{p}.mlp.down_proj"), config.intermediate_size, hidden, None)?;
            let weights_enum = if weights.has(&format!("{p}.mlp.gate_up_proj.weight")) {
                FfnWeights::Fused {
                    gate_up: build_linear(weights, config, &format!("{p}.mlp.gate_up_proj"), hidden, 2 * config.intermediate_size, None)?,
                }
            } else {
                FfnWeights::Separate {
                    gate: build_linear(weights, config, &format!("{p}.mlp.gate_proj"), hidden, config.intermediate_size, None)?,
                    up: build_linear(weights, config, &format!("{p}.mlp.up_proj"), hidden, config.intermediate_size, None)?,
                }
            };
            LayerFfn::Dense(Ffn::new(weights_enum, down, config.activation, config.intermediate_size))
        };

        Ok(Layer::new(norm_kind, input_norm, post_attn_norm, pre_ffn_norm, post_ffn_norm, attention, ffn, hidden, config.rms_eps))
    }

    pub fn reset_kv_cache(&mut self) {
        self.full_kv.reset();
        if let Some(sliding) = &mut self.sliding_kv {
            sliding.reset();
        }
        self.seq_len = 0;
    }

    pub fn current_seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Prefill(prompt_ids) (spec §4.8): run all layers over the whole
    /// prompt, but only final-norm + lm-head the last position.
    pub async fn prefill(&mut self, prompt_ids: &[u32]) -> Result<GpuBuf> {
        let logits = self.run_forward(prompt_ids, 0).await?;
        self.seq_len = prompt_ids.len();
        Ok(logits)
    }

    /// Decode(last_token_id) (spec §4.8): one new token, full logits.
    pub async fn decode(&mut self, last_token_id: u32) -> Result<GpuBuf> {
        let start_pos = self.seq_len;
        let logits = self.run_forward(&[last_token_id], start_pos).await?;
        self.seq_len += 1;
        Ok(logits)
    }

    /// Read a logits buffer back to the host, padding with `-inf` if the
    /// caller's vocabulary is larger than the model's embedding matrix
    /// (spec §4.8 "vocab padding").
    pub async fn read_logits(&self, logits: &GpuBuf, output_vocab_size: usize) -> Result<Vec<f32>> {
        let raw = self.pool.read(&self.queue, logits, (self.config.vocab_size * 4) as u64).await?;
        let mut values: Vec<f32> = raw.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect();
        if output_vocab_size > values.len() {
            values.resize(output_vocab_size, f32::NEG_INFINITY);
        }
        Ok(values)
    }

    async fn run_forward(&mut self, token_ids: &[u32], start_pos: usize) -> Result<GpuBuf> {
        if token_ids.is_empty() {
            return Err(CoreError::Shape("forward requires at least one token".into()));
        }
        let n = token_ids.len();
        let hidden = self.config.hidden_size;
        let vocab_size = self.config.vocab_size;
        let scale_embeddings = self.config.scale_embeddings;
        let rms_eps = self.config.rms_eps;

        let mut recorder = CommandRecorder::new(&self.device, &self.pool, "forward");
        let mut x = dispatch_embedding(&mut recorder, &mut self.pipelines, &self.device, &self.pool, &self.embed_tokens, token_ids, hidden, vocab_size, scale_embeddings);

        for (l, layer) in self.layers.iter().enumerate() {
            let rope_table = if self.config.is_sliding_layer(l) {
                self.rope_local.as_ref().unwrap_or(&self.rope_full)
            } else {
                &self.rope_full
            };
            let kv: &mut dyn KvCache = if self.config.is_sliding_layer(l) {
                self.sliding_kv.as_mut().expect("sliding layer without a sliding KV cache") as &mut dyn KvCache
            } else {
                &mut self.full_kv as &mut dyn KvCache
            };
            let next = layer
                .record_forward(&mut recorder, &mut self.pipelines, &self.device, &self.queue, &self.pool, &self.caps, &x, n, start_pos, kv, l, rope_table)
                .await?;
            recorder.register_temporary(x, BufferDType::F32);
            x = next;
        }

        // Only the last position needs final-norm + lm-head (spec §4.8).
        let last_row = if n > 1 {
            let row = self.pool.acquire((hidden * 4) as u64, BufferDType::F32, BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST, "last_row");
            recorder.encoder_mut().copy_buffer_to_buffer(&x, ((n - 1) * hidden * 4) as u64, &row, 0, (hidden * 4) as u64);
            recorder.register_temporary(x, BufferDType::F32);
            row
        } else {
            x
        };

        let normed = record_rmsnorm(&mut recorder, &mut self.pipelines, &self.device, &last_row, &self.final_norm, 1, hidden, rms_eps);
        recorder.register_temporary(last_row, BufferDType::F32);

        let logits = self.lm_head.record_forward(&mut recorder, &mut self.pipelines, &self.device, &self.caps, &normed, 1);
        recorder.register_temporary(normed, BufferDType::F32);

        recorder.submit(&self.queue, &self.device);
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logits_padding_extends_with_neg_infinity() {
        let mut values = vec![1.0f32, 2.0, 3.0];
        let target = 5usize;
        if target > values.len() {
            values.resize(target, f32::NEG_INFINITY);
        }
        assert_eq!(values, vec![1.0, 2.0, 3.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
    }
}
