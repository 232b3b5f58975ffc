use std::collections::HashMap;
use std::sync::Arc;

use super::buffer_pool::BufferDType;
use super::device::DeviceCaps;

pub struct PipelineEntry {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

/// Creates and caches wgpu compute pipelines, keyed by the *variant* string
/// a `select_*` function below chose — not just a bare kernel name (spec
/// §4.2 "kernel dispatch").
pub struct PipelineManager {
    cache: HashMap<String, Arc<PipelineEntry>>,
    device: Arc<wgpu::Device>,
}

impl PipelineManager {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            cache: HashMap::new(),
            device,
        }
    }

    /// Get or create a compute pipeline from WGSL source code.
    pub fn get_or_create(&mut self, key: &str, wgsl: &str, entry_point: &str) -> Arc<PipelineEntry> {
        if let Some(entry) = self.cache.get(key) {
            return Arc::clone(entry);
        }

        let shader_module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(key),
            source: wgpu::ShaderSource::Wgsl(wgsl.into()),
        });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(key),
                layout: None,
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        let bind_group_layout = pipeline.get_bind_group_layout(0);

        let entry = Arc::new(PipelineEntry {
            pipeline,
            bind_group_layout,
        });
        self.cache.insert(key.to_string(), Arc::clone(&entry));
        entry
    }

    pub fn get_or_create_default(&mut self, key: &str, wgsl: &str) -> Arc<PipelineEntry> {
        self.get_or_create(key, wgsl, "main")
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Matmul kernel variants (spec §4.2 dispatch table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatmulVariant {
    /// Full f32 activations and weights, tiled shared-memory kernel.
    F32Tiled,
    /// f16 weights, f32 accumulation — used whenever `has_f16` and the
    /// weight buffer's dtype is `F16`.
    F16WeightF32Accum,
    /// Dequantize-then-matmul for Q4_K packed weights.
    Q4K,
    /// Dequantize-then-matmul for MXFP4 packed expert weights.
    Mxfp4,
    /// Single-row (decode, M=1) GEMV specialization — skips the
    /// shared-memory tiling the prefill path needs for M>1.
    Gemv,
}

/// Choose a matmul kernel variant from device capability and operand shape.
///
/// `m` is the batch/sequence dimension of the activation (1 during decode,
/// >1 during prefill); `weight_dtype` is the storage dtype of the weight
/// buffer as tagged by the buffer pool.
pub fn select_matmul_variant(caps: &DeviceCaps, m: u32, weight_dtype: BufferDType) -> MatmulVariant {
    match weight_dtype {
        BufferDType::U8PackedQ4K => MatmulVariant::Q4K,
        BufferDType::U8PackedMxfp4 => MatmulVariant::Mxfp4,
        BufferDType::F16 if caps.has_f16 => {
            if m == 1 {
                MatmulVariant::Gemv
            } else {
                MatmulVariant::F16WeightF32Accum
            }
        }
        _ => {
            if m == 1 {
                MatmulVariant::Gemv
            } else {
                MatmulVariant::F32Tiled
            }
        }
    }
}

/// Attention kernel variants (spec §4.2, §4.3 "attention").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionVariant {
    /// Flash-style tiled online-softmax kernel for long contexts, using
    /// workgroup shared memory to stage K/V tiles.
    TiledLarge,
    /// Same algorithm, smaller tile size — chosen when the device's shared
    /// memory budget can't fit the large-tile working set.
    TiledSmall,
    /// One query row (decode step) streamed against the whole KV cache
    /// without tiling, since there is nothing to tile over M.
    Streaming,
}

/// Choose an attention kernel variant from device capability and the
/// current KV cache length.
pub fn select_attention_variant(caps: &DeviceCaps, query_len: u32, kv_len: u32) -> AttentionVariant {
    if query_len == 1 {
        return AttentionVariant::Streaming;
    }
    // Large tile needs roughly 2 * tile_k * head_dim * 4 bytes of shared
    // memory for K and V tiles; fall back to a smaller tile on constrained
    // devices rather than failing to dispatch.
    const LARGE_TILE_SHARED_BYTES: u32 = 48 * 1024;
    if caps.max_shared_mem_bytes >= LARGE_TILE_SHARED_BYTES && kv_len >= 128 {
        AttentionVariant::TiledLarge
    } else {
        AttentionVariant::TiledSmall
    }
}

/// Build the pipeline cache key for a matmul variant, so two call sites
/// requesting the same variant share one compiled pipeline.
pub fn matmul_cache_key(variant: MatmulVariant) -> &'static str {
    match variant {
        MatmulVariant::F32Tiled => "matmul.f32.tiled",
        MatmulVariant::F16WeightF32Accum => "matmul.f16w_f32a.tiled",
        MatmulVariant::Q4K => "matmul.q4k.dequant_then_tiled",
        MatmulVariant::Mxfp4 => "matmul.mxfp4.dequant_then_tiled",
        MatmulVariant::Gemv => "matmul.gemv",
    }
}

pub fn attention_cache_key(variant: AttentionVariant) -> &'static str {
    match variant {
        AttentionVariant::TiledLarge => "attention.tiled_large",
        AttentionVariant::TiledSmall => "attention.tiled_small",
        AttentionVariant::Streaming => "attention.streaming",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(has_f16: bool, shared: u32) -> DeviceCaps {
        DeviceCaps {
            has_f16,
            has_subgroups: false,
            max_shared_mem_bytes: shared,
            max_storage_buffer_bytes: 1 << 30,
        }
    }

    #[test]
    fn decode_step_always_selects_gemv_or_streaming() {
        let c = caps(true, 64 * 1024);
        assert_eq!(
            select_matmul_variant(&c, 1, BufferDType::F32),
            MatmulVariant::Gemv
        );
        assert_eq!(
            select_matmul_variant(&c, 1, BufferDType::F16),
            MatmulVariant::Gemv
        );
        assert_eq!(select_attention_variant(&c, 1, 500), AttentionVariant::Streaming);
    }

    #[test]
    fn quantized_weights_always_dispatch_dequant_variant_regardless_of_m() {
        let c = caps(true, 64 * 1024);
        assert_eq!(
            select_matmul_variant(&c, 1, BufferDType::U8PackedQ4K),
            MatmulVariant::Q4K
        );
        assert_eq!(
            select_matmul_variant(&c, 64, BufferDType::U8PackedMxfp4),
            MatmulVariant::Mxfp4
        );
    }

    #[test]
    fn prefill_falls_back_to_small_tile_on_constrained_shared_memory() {
        let constrained = caps(true, 16 * 1024);
        assert_eq!(
            select_attention_variant(&constrained, 128, 128),
            AttentionVariant::TiledSmall
        );
        let ample = caps(true, 64 * 1024);
        assert_eq!(
            select_attention_variant(&ample, 128, 128),
            AttentionVariant::TiledLarge
        );
    }

    #[test]
    fn f16_weight_without_device_support_falls_back_to_f32_tiled() {
        let no_f16 = caps(false, 64 * 1024);
        assert_eq!(
            select_matmul_variant(&no_f16, 32, BufferDType::F16),
            MatmulVariant::F32Tiled
        );
    }
}
