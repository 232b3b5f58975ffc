use std::collections::HashMap;
use std::sync::Arc;

use half::f16;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::model::config::{ModelConfig, Quantization};
use crate::model::manifest::{self, Manifest, TensorMeta};
use crate::model::shard::ShardAdapter;
use crate::model::weights::WeightStore;

#[derive(Debug, Clone, Copy)]
pub enum LoadPhase {
    Manifest,
    Shard,
    Upload,
}

#[derive(Debug, Clone)]
pub struct LoadProgress {
    pub phase: LoadPhase,
    pub loaded: u64,
    pub total: u64,
    pub fraction: f64,
}

#[derive(Default)]
pub struct LoadOptions {
    pub on_progress: Option<Box<dyn Fn(LoadProgress) + Send>>,
}

/// Per-(layer, expert) tensor metadata, deferred from eager upload. The
/// expert cache resolves these lazily via `load_expert_tensor` on first
/// routed hit (spec §3 "Expert weights", §4.5).
pub type ExpertTensorIndex = HashMap<(usize, usize), HashMap<String, TensorMeta>>;

pub struct LoadResult {
    pub architecture: String,
    pub model_id: String,
    pub config: ModelConfig,
    pub weights: WeightStore,
    pub expert_tensors: ExpertTensorIndex,
}

/// Load a model: parse the manifest, fetch every non-expert-FFN tensor's
/// shard, upload to the GPU. Expert FFN tensors are indexed but not fetched
/// — they load lazily through the expert cache.
pub async fn load_model(
    manifest_bytes: &[u8],
    shard_adapter: Arc<dyn ShardAdapter>,
    device: Arc<wgpu::Device>,
    options: LoadOptions,
) -> Result<LoadResult> {
    let progress = |p: LoadProgress| {
        if let Some(ref cb) = options.on_progress {
            cb(p);
        }
    };

    progress(LoadProgress {
        phase: LoadPhase::Manifest,
        loaded: 0,
        total: 1,
        fraction: 0.0,
    });

    let manifest = manifest::parse_manifest(manifest_bytes)?;
    let config = manifest::config_from_manifest(&manifest)?;

    debug!(
        layers = config.num_layers,
        hidden = config.hidden_size,
        heads = config.num_heads,
        kv_heads = config.num_kv_heads,
        moe = config.moe.is_some(),
        "parsed model configuration"
    );

    let mut expert_tensors = ExpertTensorIndex::new();
    let mut eager: Vec<(&String, &TensorMeta)> = Vec::new();

    for (name, meta) in &manifest.tensors {
        match parse_expert_tensor_name(name) {
            Some((layer, expert, suffix)) => {
                expert_tensors
                    .entry((layer, expert))
                    .or_default()
                    .insert(suffix, meta.clone());
            }
            None => eager.push((name, meta)),
        }
    }

    // Group eager tensors by shard so each shard is fetched once.
    let mut by_shard: HashMap<u32, Vec<(&String, &TensorMeta)>> = HashMap::new();
    for entry in eager {
        by_shard.entry(entry.1.shard).or_default().push(entry);
    }

    let mut store = WeightStore::new(Arc::clone(&device));
    let max_binding = device.limits().max_storage_buffer_binding_size;
    let total = by_shard.values().map(|v| v.len()).sum::<usize>().max(1);
    let mut done = 0usize;

    let mut shard_indices: Vec<u32> = by_shard.keys().copied().collect();
    shard_indices.sort_unstable();

    for shard_index in shard_indices {
        progress(LoadProgress {
            phase: LoadPhase::Shard,
            loaded: shard_index as u64,
            total: 0,
            fraction: 0.0,
        });
        let shard_bytes = shard_adapter.load_shard(shard_index).await?;
        let entries = by_shard.remove(&shard_index).unwrap_or_default();

        for (name, meta) in entries {
            let start = meta.offset as usize;
            let end = start
                .checked_add(meta.size as usize)
                .ok_or_else(|| CoreError::Shape(format!("tensor \"{name}\" size overflow")))?;
            if end > shard_bytes.len() {
                return Err(CoreError::Shape(format!(
                    "tensor \"{name}\" extends past shard {shard_index} (shard is {} bytes)",
                    shard_bytes.len()
                )));
            }
            let raw = &shard_bytes[start..end];
            validate_tensor_layout(name, meta, config.quantization)?;
            upload_tensor(&mut store, name, raw, meta, max_binding, config.rmsnorm_weight_offset)?;

            done += 1;
            progress(LoadProgress {
                phase: LoadPhase::Upload,
                loaded: done as u64,
                total: total as u64,
                fraction: done as f64 / total as f64,
            });
        }
    }

    info!(
        tensors = total,
        experts_indexed = expert_tensors.len(),
        "model weights loaded"
    );

    Ok(LoadResult {
        architecture: manifest.architecture,
        model_id: manifest.model_id,
        config,
        weights: store,
        expert_tensors,
    })
}

/// Fetch and upload a single deferred expert tensor (spec §4.5
/// `ensure_loaded`). Looked up by the `(layer, expert)` key and the tensor
/// kind suffix (e.g. `"gate_proj.weight"`, `"gate_up_proj_blocks"`).
pub async fn load_expert_tensor(
    shard_adapter: &dyn ShardAdapter,
    meta: &TensorMeta,
) -> Result<Vec<u8>> {
    let shard_bytes = shard_adapter.load_shard(meta.shard).await?;
    let start = meta.offset as usize;
    let end = start
        .checked_add(meta.size as usize)
        .ok_or_else(|| CoreError::Shape("expert tensor size overflow".into()))?;
    if end > shard_bytes.len() {
        return Err(CoreError::Shape(format!(
            "expert tensor extends past shard {} ({} bytes)",
            meta.shard,
            shard_bytes.len()
        )));
    }
    Ok(shard_bytes[start..end].to_vec())
}

/// Tensors whose values feed an RMSNorm weight multiply (spec §4.3): every
/// norm tensor in the naming convention ends in `norm.weight`, including
/// the bare `model.norm.weight` and the per-head `q_norm.weight`/
/// `k_norm.weight` variants.
fn is_norm_weight(name: &str) -> bool {
    name.contains("norm.weight")
}

/// Reject manifests asking for adapter behavior the loader does not
/// implement, instead of silently loading a tensor wrong (spec's Q4_K
/// layout Open Question: "the core requires row-wise; the adapter must
/// refuse flat-packed with a clear error rather than silently
/// dequantizing").
fn validate_tensor_layout(name: &str, meta: &TensorMeta, quantization: Quantization) -> Result<()> {
    if meta.slice_count.is_some_and(|n| n > 1) {
        return Err(CoreError::Config(format!(
            "tensor \"{name}\" is split across {} slices; per-dimension tensor slicing is not supported, repack it into a single tensor before loading",
            meta.slice_count.unwrap()
        )));
    }
    if quantization == Quantization::Q4KM {
        if let Some(layout) = meta.layout.as_deref() {
            if layout != "row_wise" {
                return Err(CoreError::Config(format!(
                    "tensor \"{name}\" has layout \"{layout}\" but Q4_K weights require row-wise super-blocks; repack it row-wise rather than relying on the loader to transpose packed data"
                )));
            }
        }
    }
    Ok(())
}

fn upload_tensor(
    store: &mut WeightStore,
    name: &str,
    raw: &[u8],
    meta: &TensorMeta,
    max_binding: u32,
    rmsnorm_weight_offset: bool,
) -> Result<()> {
    let apply_offset = rmsnorm_weight_offset && is_norm_weight(name);
    let needs_transpose = meta.weights_transposed == Some(false);

    match meta.dtype.as_str() {
        "f16" => {
            let num_elements = meta.shape.iter().product::<u64>() as usize;
            let mut f32_data = convert_f16_to_f32(raw, num_elements);
            if needs_transpose {
                f32_data = transpose_tensor(name, &f32_data, meta)?;
            }
            if apply_offset {
                apply_weight_offset_bytes(&mut f32_data);
            }
            store.upload_sharded(name, &f32_data, max_binding);
        }
        "f32" if needs_transpose || apply_offset => {
            let mut f32_data = raw.to_vec();
            if needs_transpose {
                f32_data = transpose_tensor(name, &f32_data, meta)?;
            }
            if apply_offset {
                apply_weight_offset_bytes(&mut f32_data);
            }
            store.upload_sharded(name, &f32_data, max_binding);
        }
        _ => {
            if needs_transpose {
                return Err(CoreError::Config(format!(
                    "tensor \"{name}\" is dtype \"{}\" with weightsTransposed=false; only dense f32/f16 tensors can be transposed at load time, packed/quantized tensors must already be row-wise",
                    meta.dtype
                )));
            }
            store.upload_sharded(name, raw, max_binding);
        }
    }
    Ok(())
}

/// Transpose a dense 2-D tensor whose manifest declares it stored as
/// `[in_features, out_features]` rather than the `[out_features,
/// in_features]` layout every matmul kernel expects (spec's "auto"
/// transpose-B resolution).
fn transpose_tensor(name: &str, data: &[f32], meta: &TensorMeta) -> Result<Vec<f32>> {
    let [rows, cols] = match meta.shape.as_slice() {
        [r, c] => [*r as usize, *c as usize],
        other => {
            return Err(CoreError::Shape(format!(
                "tensor \"{name}\" has weightsTransposed=false but shape {other:?} is not 2-D"
            )))
        }
    };
    if data.len() != rows * cols {
        return Err(CoreError::Shape(format!(
            "tensor \"{name}\": shape {rows}x{cols} does not match {} elements",
            data.len()
        )));
    }
    let mut out = vec![0f32; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    Ok(out)
}

/// Rewrite `w[i]` to `1 + w[i]` in an f32 byte buffer (spec §4.3, models
/// with `rmsnorm_weight_offset` set). Applied once at upload time so the
/// rmsnorm kernel never has to branch on it.
fn apply_weight_offset_bytes(data: &mut [u8]) {
    let mut floats: Vec<f32> = data.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect();
    crate::nn::rmsnorm::apply_weight_offset(&mut floats);
    for (chunk, v) in data.chunks_exact_mut(4).zip(floats.iter()) {
        chunk.copy_from_slice(&v.to_le_bytes());
    }
}

fn convert_f16_to_f32(src: &[u8], num_elements: usize) -> Vec<u8> {
    let mut dst = vec![0u8; num_elements * 4];
    for i in 0..num_elements {
        let h = u16::from_le_bytes([src[i * 2], src[i * 2 + 1]]);
        let f = f16::from_bits(h).to_f32();
        dst[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
    }
    dst
}

/// Parse `"model.layers.{l}.mlp.experts.{e}.{suffix}"` into `(l, e, suffix)`.
fn parse_expert_tensor_name(name: &str) -> Option<(usize, usize, String)> {
    let rest = name.strip_prefix("model.layers.")?;
    let (layer_str, rest) = rest.split_once('.')?;
    let layer: usize = layer_str.parse().ok()?;
    let rest = rest.strip_prefix("mlp.experts.")?;
    let (expert_str, suffix) = rest.split_once('.')?;
    let expert: usize = expert_str.parse().ok()?;
    Some((layer, expert, suffix.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_expert_tensor_names() {
        let parsed = parse_expert_tensor_name("model.layers.3.mlp.experts.7.gate_proj.weight");
        assert_eq!(
            parsed,
            Some((3, 7, "gate_proj.weight".to_string()))
        );
    }

    #[test]
    fn non_expert_tensor_names_do_not_parse() {
        assert_eq!(
            parse_expert_tensor_name("model.layers.3.self_attn.q_proj.weight"),
            None
        );
        assert_eq!(parse_expert_tensor_name("model.embed_tokens.weight"), None);
    }
}
