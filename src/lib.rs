//! # gpulm-core
//!
//! GPU-resident transformer inference: prefill/decode orchestration, a
//! paged KV cache, and a Mixture-of-Experts engine with LRU expert-weight
//! paging, all dispatched over `wgpu`.
//!
//! ```no_run
//! use gpulm_core::{Session, LoadOptions, GenerateOptions};
//! use gpulm_core::tokenizer::StaticTokenizerAdapter;
//! use gpulm_core::model::shard::LocalFileShardAdapter;
//! use std::sync::Arc;
//!
//! # async fn example() -> gpulm_core::Result<()> {
//! let manifest_bytes = std::fs::read("model/manifest.json")?;
//! let shard_adapter = Arc::new(LocalFileShardAdapter::new("model", None));
//! let tokenizer = Arc::new(StaticTokenizerAdapter::from_file("model/tokenizer.json")?);
//!
//! let mut session = Session::load(&manifest_bytes, shard_adapter, tokenizer, LoadOptions::default()).await?;
//! let result = session.generate_to_completion("Hello!", GenerateOptions::default()).await?;
//! println!("{}", result.output_text);
//! # Ok(())
//! # }
//! ```

pub mod config_profile;
pub mod error;
pub mod generate;
pub mod gpu;
pub mod kv;
pub mod model;
pub mod moe;
pub mod nn;
pub mod pipeline;
pub mod sampling;
pub mod tokenizer;

pub use error::{CoreError, Result};
pub use generate::{GenerateEvent, GenerateOptions, GenerateResult, GeneratedToken};
pub use model::config::ModelConfig;
pub use model::loader::{LoadOptions, LoadProgress};
pub use pipeline::ModelPipeline;
pub use tokenizer::{ChatMessage, TokenizerAdapter};

use std::sync::Arc;

use futures::{Stream, StreamExt};

use gpu::device::init_gpu;
use model::loader::load_model;
use model::shard::ShardAdapter;
use moe::expert_cache::ExpertCache;

/// Default VRAM budget for the expert-weight LRU cache when a caller
/// doesn't override it (spec §4.5). Generous enough for a handful of
/// resident experts on a mid-range discrete GPU.
const DEFAULT_EXPERT_CACHE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// A loaded model ready to generate: owns the GPU forward pipeline, the
/// expert cache (if the model is MoE), and the tokenizer adapter.
pub struct Session {
    pipeline: ModelPipeline,
    tokenizer: Arc<dyn TokenizerAdapter>,
}

impl Session {
    /// Load a model from its manifest and shard adapter, probing the GPU
    /// and uploading every non-expert-FFN tensor (spec §4.1, §6).
    pub async fn load(
        manifest_bytes: &[u8],
        shard_adapter: Arc<dyn ShardAdapter>,
        tokenizer: Arc<dyn TokenizerAdapter>,
        options: LoadOptions,
    ) -> Result<Self> {
        Self::load_with_expert_budget(manifest_bytes, shard_adapter, tokenizer, options, DEFAULT_EXPERT_CACHE_BYTES).await
    }

    pub async fn load_with_expert_budget(
        manifest_bytes: &[u8],
        shard_adapter: Arc<dyn ShardAdapter>,
        tokenizer: Arc<dyn TokenizerAdapter>,
        options: LoadOptions,
        expert_cache_budget_bytes: u64,
    ) -> Result<Self> {
        let gpu = init_gpu().await?;

        let result = load_model(manifest_bytes, Arc::clone(&shard_adapter), Arc::clone(&gpu.device), options).await?;

        let expert_cache = if result.config.moe.is_some() {
            Some(Arc::new(ExpertCache::new(
                Arc::clone(&gpu.device),
                shard_adapter,
                result.expert_tensors,
                expert_cache_budget_bytes,
            )))
        } else {
            None
        };

        let pipeline = ModelPipeline::build(Arc::clone(&gpu.device), Arc::clone(&gpu.queue), gpu.caps, result.config, &result.weights, expert_cache)?;

        Ok(Self { pipeline, tokenizer })
    }

    /// Stream of generation events for `prompt`; see `generate::generate`.
    pub fn generate(&mut self, prompt: &str, opts: GenerateOptions) -> impl Stream<Item = Result<GenerateEvent>> + '_ {
        generate::generate(&mut self.pipeline, self.tokenizer.as_ref(), prompt, opts)
    }

    /// Drain the generation stream and return only the terminal summary
    /// (spec §6 "final result"), discarding per-token events. Convenient
    /// for callers that don't need incremental streaming.
    pub async fn generate_to_completion(&mut self, prompt: &str, opts: GenerateOptions) -> Result<GenerateResult> {
        let mut stream = Box::pin(self.generate(prompt, opts));
        let mut last: Option<GenerateResult> = None;
        while let Some(event) = stream.next().await {
            if let GenerateEvent::Done(result) = event? {
                last = Some(result);
            }
        }
        last.ok_or_else(|| CoreError::Other("generation stream ended without a terminal event".into()))
    }

    pub fn reset_kv_cache(&mut self) {
        self.pipeline.reset_kv_cache();
    }
}
