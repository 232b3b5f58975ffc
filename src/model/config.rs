/// Architecture-level model configuration M (spec §3).
///
/// Parsed from the manifest's free-form `config` object by
/// `manifest::config_from_manifest`. Field names follow the spec's
/// normalized names, not any one source convention (HF / GGUF / GPT-OSS all
/// spell these differently — see `manifest.rs` for the alias table).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub rope_theta: f32,
    pub rope_theta_local: Option<f32>,
    pub rope_scale: f32,
    pub rope_scaling_kind: RopeScalingKind,
    pub rms_eps: f32,
    pub activation: Activation,
    pub quantization: Quantization,
    pub tied_embeddings: bool,
    pub scale_embeddings: bool,
    pub rmsnorm_weight_offset: bool,
    pub sliding_window: Option<usize>,
    pub sliding_pattern: Option<usize>,
    pub layer_kinds: Option<Vec<LayerKind>>,
    pub moe: Option<MoeConfig>,
    pub attention_bias: bool,
    pub eos_token_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Silu,
    Gelu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantization {
    F32,
    F16,
    Bf16,
    Q4KM,
    Mxfp4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeScalingKind {
    None,
    Linear,
    Yarn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    FullAttention,
    SlidingAttention,
    Moe,
}

#[derive(Debug, Clone, Copy)]
pub struct MoeConfig {
    pub num_experts: usize,
    pub top_k: usize,
}

impl ModelConfig {
    /// Whether layer `l` runs MoE FFN: per-layer `layer_kinds` wins over the
    /// model-level `moe` flag (spec §4.7).
    pub fn is_moe_layer(&self, l: usize) -> bool {
        match &self.layer_kinds {
            Some(kinds) => matches!(kinds.get(l), Some(LayerKind::Moe)),
            None => self.moe.is_some(),
        }
    }

    /// Whether layer `l` uses the sliding-window KV cache and local RoPE
    /// table, per `layer_kinds` or the `sliding_pattern` fallback (every Nth
    /// layer is full attention, the rest slide).
    pub fn is_sliding_layer(&self, l: usize) -> bool {
        if self.sliding_window.is_none() {
            return false;
        }
        match &self.layer_kinds {
            Some(kinds) => matches!(kinds.get(l), Some(LayerKind::SlidingAttention)),
            None => match self.sliding_pattern {
                Some(pattern) if pattern > 0 => (l + 1) % pattern != 0,
                _ => true,
            },
        }
    }

    /// GQA group size = num_heads / num_kv_heads.
    pub fn gqa_group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Validate the invariants of spec §3: `h % h_kv = 0`, `H = h*d`, and
    /// (if MoE) `top_k <= num_experts`.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CoreError;

        if self.num_kv_heads == 0 || self.num_heads % self.num_kv_heads != 0 {
            return Err(CoreError::Config(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.hidden_size != self.num_heads * self.head_dim {
            return Err(CoreError::Config(format!(
                "hidden_size ({}) must equal num_heads ({}) * head_dim ({})",
                self.hidden_size, self.num_heads, self.head_dim
            )));
        }
        if let Some(moe) = &self.moe {
            if moe.top_k > moe.num_experts {
                return Err(CoreError::Config(format!(
                    "moe.top_k ({}) must not exceed moe.num_experts ({})",
                    moe.top_k, moe.num_experts
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ModelConfig {
        ModelConfig {
            num_layers: 2,
            hidden_size: 64,
            intermediate_size: 128,
            num_heads: 8,
            num_kv_heads: 2,
            head_dim: 8,
            vocab_size: 100,
            max_seq_len: 512,
            rope_theta: 10000.0,
            rope_theta_local: None,
            rope_scale: 1.0,
            rope_scaling_kind: RopeScalingKind::None,
            rms_eps: 1e-5,
            activation: Activation::Silu,
            quantization: Quantization::F32,
            tied_embeddings: true,
            scale_embeddings: false,
            rmsnorm_weight_offset: false,
            sliding_window: None,
            sliding_pattern: None,
            layer_kinds: None,
            moe: None,
            attention_bias: false,
            eos_token_ids: vec![0],
        }
    }

    #[test]
    fn rejects_head_count_not_dividing_kv_heads() {
        let mut cfg = base_config();
        cfg.num_kv_heads = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_moe_top_k_above_expert_count() {
        let mut cfg = base_config();
        cfg.moe = Some(MoeConfig {
            num_experts: 4,
            top_k: 5,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sliding_pattern_marks_every_nth_layer_full_attention() {
        let mut cfg = base_config();
        cfg.num_layers = 6;
        cfg.sliding_window = Some(128);
        cfg.sliding_pattern = Some(3);
        let expect_full = [false, false, true, false, false, true];
        for (l, want_full) in expect_full.iter().enumerate() {
            assert_eq!(!cfg.is_sliding_layer(l), *want_full, "layer {l}");
        }
    }

    #[test]
    fn explicit_layer_kinds_override_sliding_pattern() {
        let mut cfg = base_config();
        cfg.sliding_window = Some(128);
        cfg.sliding_pattern = Some(2);
        cfg.layer_kinds = Some(vec![LayerKind::Moe, LayerKind::SlidingAttention]);
        assert!(cfg.is_moe_layer(0));
        assert!(!cfg.is_sliding_layer(0));
        assert!(cfg.is_sliding_layer(1));
    }
}
