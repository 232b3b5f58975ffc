use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::model::config::{
    Activation, LayerKind, ModelConfig, MoeConfig, Quantization, RopeScalingKind,
};

/// A JSON manifest describing one model (spec §6). `config` is deliberately
/// untyped at the `serde` boundary — different converters spell the same
/// field differently (`hidden_size` vs `n_embd` vs `embeddingLength`) — and
/// normalized by `config_from_manifest` below.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub architecture: String,
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub config: serde_json::Value,
    pub tensors: HashMap<String, TensorMeta>,
    #[serde(default)]
    pub tokenizer: Option<TokenizerMeta>,
    pub quantization: String,
    #[serde(rename = "expertShardMap", default)]
    pub expert_shard_map: HashMap<String, ShardRef>,
    #[serde(rename = "shardingStrategy", default)]
    pub sharding_strategy: Option<String>,
}

/// Per-dimension tensor slicing (a converter splitting one logical tensor
/// across several manifest entries) is not supported: no manifest in the
/// wild we load actually uses it, and reconstructing a sliced tensor would
/// need a shard-assembly pass of its own. `layout`/`weightsTransposed` are
/// real adapter-facing fields (see `model::loader::upload_tensor`); a
/// manifest asking for slicing is rejected at load time instead of being
/// silently ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct TensorMeta {
    pub shape: Vec<u64>,
    pub dtype: String,
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(rename = "weightsTransposed", default)]
    pub weights_transposed: Option<bool>,
    #[serde(rename = "sliceCount", default)]
    pub slice_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ShardRef {
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct TokenizerMeta {
    pub vocab_size: Option<usize>,
}

fn get_int(config: &serde_json::Value, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .find_map(|k| config.get(k)).and_then(|v| v.as_u64())
}

fn get_float(config: &serde_json::Value, keys: &[&str]) -> Option<f32> {
    keys.iter()
        .find_map(|k| config.get(k))
        .and_then(|v| v.as_f64())
        .map(|v| v as f32)
}

fn get_str(config: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| config.get(k))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn get_bool(config: &serde_json::Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| config.get(k)).and_then(|v| v.as_bool())
}

/// Normalize the manifest's free-form `config` object and `quantization`
/// field into a `ModelConfig`, per the alias table of spec §6.
pub fn config_from_manifest(manifest: &Manifest) -> Result<ModelConfig> {
    let c = &manifest.config;

    let hidden_size = get_int(c, &["hidden_size", "n_embd", "embeddingLength"])
        .ok_or_else(|| CoreError::Config("manifest config missing hidden_size".into()))?
        as usize;
    let num_layers = get_int(c, &["num_hidden_layers", "n_layer", "blockCount"])
        .ok_or_else(|| CoreError::Config("manifest config missing num_hidden_layers".into()))?
        as usize;
    let num_heads = get_int(c, &["num_attention_heads", "n_head", "attentionHeadCount"])
        .ok_or_else(|| CoreError::Config("manifest config missing num_attention_heads".into()))?
        as usize;
    let num_kv_heads =
        get_int(c, &["num_key_value_heads", "attentionHeadCountKV"]).unwrap_or(num_heads as u64) as usize;
    let head_dim = get_int(c, &["head_dim"])
        .map(|v| v as usize)
        .unwrap_or(hidden_size / num_heads.max(1));
    let intermediate_size = get_int(c, &["intermediate_size", "n_inner", "feedForwardLength"])
        .ok_or_else(|| CoreError::Config("manifest config missing intermediate_size".into()))?
        as usize;
    let max_seq_len = get_int(c, &["max_position_embeddings", "contextLength"])
        .ok_or_else(|| CoreError::Config("manifest config missing max_position_embeddings".into()))?
        as usize;

    let vocab_size = get_int(c, &["vocab_size"])
        .map(|v| v as usize)
        .or_else(|| manifest.tokenizer.as_ref().and_then(|t| t.vocab_size))
        .ok_or_else(|| CoreError::Config("unable to infer vocab_size".into()))?;

    let rope_theta = get_float(c, &["rope_theta", "ropeFreqBase"]).unwrap_or(10000.0);
    let rope_theta_local = get_float(c, &["rope_local_base_freq"]);

    let (rope_scaling_kind, rope_scale) = match c.get("rope_scaling") {
        Some(scaling) if !scaling.is_null() => {
            let kind_str = get_str(scaling, &["type", "rope_type"]).unwrap_or_default();
            let kind = match kind_str.as_str() {
                "linear" => RopeScalingKind::Linear,
                "yarn" => RopeScalingKind::Yarn,
                _ => RopeScalingKind::None,
            };
            let factor = scaling.get("factor").and_then(|v| v.as_f64()).unwrap_or(1.0) as f32;
            (kind, factor)
        }
        _ => (RopeScalingKind::None, 1.0),
    };

    let rms_eps = get_float(c, &["rms_norm_eps"]).unwrap_or(1e-5);

    let activation = match get_str(c, &["hidden_activation", "hidden_act"])
        .unwrap_or_default()
        .as_str()
    {
        "gelu" | "gelu_new" | "gelu_pytorch_tanh" => Activation::Gelu,
        _ => Activation::Silu,
    };

    let quantization = match manifest.quantization.as_str() {
        "f32" => Quantization::F32,
        "f16" => Quantization::F16,
        "bf16" => Quantization::Bf16,
        "q4_k_m" => Quantization::Q4KM,
        "mxfp4" => Quantization::Mxfp4,
        other => {
            return Err(CoreError::Config(format!(
                "unknown quantization \"{other}\""
            )))
        }
    };

    let sliding_window = get_int(c, &["sliding_window"]).map(|v| v as usize);
    let sliding_pattern = get_int(c, &["sliding_window_pattern"]).map(|v| v as usize);

    let layer_kinds = c.get("layer_types").and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .map(|v| match v.as_str().unwrap_or("") {
                "sliding_attention" => LayerKind::SlidingAttention,
                "moe" => LayerKind::Moe,
                _ => LayerKind::FullAttention,
            })
            .collect::<Vec<_>>()
    });

    let moe = match (
        get_int(c, &["num_local_experts", "num_experts"]),
        get_int(c, &["experts_per_token", "num_experts_per_tok", "top_k"]),
    ) {
        (Some(num_experts), Some(top_k)) => Some(MoeConfig {
            num_experts: num_experts as usize,
            top_k: top_k as usize,
        }),
        _ => None,
    };

    let eos_token_ids = match c.get("eos_token_id") {
        Some(serde_json::Value::Array(arr)) => {
            arr.iter().filter_map(|v| v.as_u64()).map(|v| v as u32).collect()
        }
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|v| vec![v as u32]).unwrap_or_default(),
        _ => Vec::new(),
    };

    let config = ModelConfig {
        num_layers,
        hidden_size,
        intermediate_size,
        num_heads,
        num_kv_heads,
        head_dim,
        vocab_size,
        max_seq_len,
        rope_theta,
        rope_theta_local,
        rope_scale,
        rope_scaling_kind,
        rms_eps,
        activation,
        quantization,
        tied_embeddings: get_bool(c, &["tie_word_embeddings"]).unwrap_or(false),
        scale_embeddings: get_bool(c, &["scale_embeddings"]).unwrap_or(false),
        rmsnorm_weight_offset: get_bool(c, &["rms_norm_weight_offset"]).unwrap_or(false),
        sliding_window,
        sliding_pattern,
        layer_kinds,
        moe,
        attention_bias: get_bool(c, &["attention_bias"]).unwrap_or(false),
        eos_token_ids,
    };

    config.validate()?;
    Ok(config)
}

pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest_json() -> &'static str {
        r#"{
            "architecture": "test-arch",
            "modelId": "test/model",
            "config": {
                "hidden_size": 64,
                "num_hidden_layers": 2,
                "num_attention_heads": 8,
                "num_key_value_heads": 2,
                "intermediate_size": 128,
                "max_position_embeddings": 2048,
                "rope_theta": 10000.0,
                "rope_scaling": {"type": "yarn", "factor": 4.0},
                "num_local_experts": 8,
                "experts_per_token": 2,
                "sliding_window": 512
            },
            "tensors": {},
            "tokenizer": {"vocab_size": 1000},
            "quantization": "f16"
        }"#
    }

    #[test]
    fn parses_aliased_fields_and_rope_scaling() {
        let manifest = parse_manifest(sample_manifest_json().as_bytes()).unwrap();
        let config = config_from_manifest(&manifest).unwrap();
        assert_eq!(config.hidden_size, 64);
        assert_eq!(config.head_dim, 8);
        assert_eq!(config.vocab_size, 1000);
        assert_eq!(config.rope_scaling_kind, RopeScalingKind::Yarn);
        assert_eq!(config.rope_scale, 4.0);
        let moe = config.moe.unwrap();
        assert_eq!(moe.num_experts, 8);
        assert_eq!(moe.top_k, 2);
    }

    #[test]
    fn unknown_quantization_is_a_config_error() {
        let bad = sample_manifest_json().replace("\"f16\"", "\"int3\"");
        let manifest = parse_manifest(bad.as_bytes()).unwrap();
        assert!(config_from_manifest(&manifest).is_err());
    }
}
