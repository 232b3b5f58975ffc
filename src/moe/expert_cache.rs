use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};
use wgpu::BufferUsages;

use crate::error::{CoreError, Result};
use crate::gpu::buffer_pool::GpuBuf;
use crate::model::loader::{load_expert_tensor, ExpertTensorIndex};
use crate::model::manifest::TensorMeta;
use crate::model::shard::ShardAdapter;

/// Expert FFN weights for one (layer, expert) pair (spec §3 "Expert
/// weights"). The dense Mixtral-style shape and the MXFP4-packed GPT-OSS
/// shape are both first-class — which one is populated is determined by
/// the model's `quantization` at load time.
pub enum ExpertWeights {
    Dense {
        w_gate: GpuBuf,
        w_up: GpuBuf,
        w_down: GpuBuf,
    },
    Mxfp4 {
        w_gate_up_blocks: GpuBuf,
        w_gate_up_scales: GpuBuf,
        w_gate_up_bias: Option<GpuBuf>,
        w_down_blocks: GpuBuf,
        w_down_scales: GpuBuf,
        w_down_bias: Option<GpuBuf>,
    },
}

struct Entry {
    weights: Arc<ExpertWeights>,
    bytes: u64,
    in_use: bool,
    pinned: bool,
    last_used: u64,
}

struct State {
    entries: HashMap<(usize, usize), Entry>,
    bytes_cached: u64,
    in_flight: HashMap<(usize, usize), Arc<Notify>>,
}

/// LRU cache of expert FFN weights, paged from the shard adapter on first
/// routed hit and evicted under a VRAM byte budget (spec §4.5).
pub struct ExpertCache {
    device: Arc<wgpu::Device>,
    shard_adapter: Arc<dyn ShardAdapter>,
    tensor_index: ExpertTensorIndex,
    budget_bytes: u64,
    state: Mutex<State>,
    tick: AtomicU64,
}

impl ExpertCache {
    pub fn new(
        device: Arc<wgpu::Device>,
        shard_adapter: Arc<dyn ShardAdapter>,
        tensor_index: ExpertTensorIndex,
        budget_bytes: u64,
    ) -> Self {
        Self {
            device,
            shard_adapter,
            tensor_index,
            budget_bytes,
            state: Mutex::new(State {
                entries: HashMap::new(),
                bytes_cached: 0,
                in_flight: HashMap::new(),
            }),
            tick: AtomicU64::new(0),
        }
    }

    pub fn bytes_cached(&self) -> u64 {
        // Best-effort snapshot; callers needing a precise value should hold
        // no concurrent forward pass, per the one-forward-at-a-time
        // contract of spec §5.
        self.state
            .try_lock()
            .map(|s| s.bytes_cached)
            .unwrap_or(0)
    }

    /// Return the cached weights for `(l, e)`, loading them via the shard
    /// adapter on a cache miss. Concurrent misses on the same key coalesce
    /// to a single load (spec §5 "same-key concurrent loads must coalesce").
    pub async fn ensure_loaded(&self, l: usize, e: usize) -> Result<Arc<ExpertWeights>> {
        loop {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.entries.get_mut(&(l, e)) {
                entry.last_used = self.tick.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.weights));
            }
            if let Some(notify) = state.in_flight.get(&(l, e)).cloned() {
                drop(state);
                notify.notified().await;
                continue;
            }
            let notify = Arc::new(Notify::new());
            state.in_flight.insert((l, e), Arc::clone(&notify));
            drop(state);

            let result = self.load_and_insert(l, e).await;

            let mut state = self.state.lock().await;
            state.in_flight.remove(&(l, e));
            notify.notify_waiters();

            return result;
        }
    }

    async fn load_and_insert(&self, l: usize, e: usize) -> Result<Arc<ExpertWeights>> {
        let tensors = self
            .tensor_index
            .get(&(l, e))
            .ok_or_else(|| CoreError::MissingWeight(format!("no tensors indexed for expert ({l}, {e})")))?;

        let (weights, bytes) = if let Some(blocks) = tensors.get("gate_up_proj_blocks") {
            self.load_mxfp4(l, e, tensors, blocks).await?
        } else {
            self.load_dense(l, e, tensors).await?
        };

        let weights = Arc::new(weights);
        self.make_room_for(bytes).await?;

        let mut state = self.state.lock().await;
        let last_used = self.tick.fetch_add(1, Ordering::Relaxed);
        state.entries.insert(
            (l, e),
            Entry {
                weights: Arc::clone(&weights),
                bytes,
                in_use: false,
                pinned: false,
                last_used,
            },
        );
        state.bytes_cached += bytes;
        debug!(layer = l, expert = e, bytes, "expert weights loaded");
        Ok(weights)
    }

    async fn load_dense(
        &self,
        l: usize,
        e: usize,
        tensors: &HashMap<String, TensorMeta>,
    ) -> Result<(ExpertWeights, u64)> {
        let gate = self.fetch_tensor(l, e, tensors, "gate_proj.weight").await?;
        let up = self.fetch_tensor(l, e, tensors, "up_proj.weight").await?;
        let down = self.fetch_tensor(l, e, tensors, "down_proj.weight").await?;

        let bytes = (gate.len() + up.len() + down.len()) as u64;
        let weights = ExpertWeights::Dense {
            w_gate: self.upload(&format!("expert.{l}.{e}.gate"), &gate),
            w_up: self.upload(&format!("expert.{l}.{e}.up"), &up),
            w_down: self.upload(&format!("expert.{l}.{e}.down"), &down),
        };
        Ok((weights, bytes))
    }

    async fn load_mxfp4(
        &self,
        l: usize,
        e: usize,
        tensors: &HashMap<String, TensorMeta>,
        _blocks_meta: &TensorMeta,
    ) -> Result<(ExpertWeights, u64)> {
        let gate_up_blocks = self.fetch_tensor(l, e, tensors, "gate_up_proj_blocks").await?;
        let gate_up_scales = self.fetch_tensor(l, e, tensors, "gate_up_proj_scales").await?;
        let down_blocks = self.fetch_tensor(l, e, tensors, "down_proj_blocks").await?;
        let down_scales = self.fetch_tensor(l, e, tensors, "down_proj_scales").await?;

        let gate_up_bias = self.try_fetch_tensor(l, e, tensors, "gate_up_proj_bias").await?;
        let down_bias = self.try_fetch_tensor(l, e, tensors, "down_proj_bias").await?;

        let mut bytes = (gate_up_blocks.len() + gate_up_scales.len() + down_blocks.len() + down_scales.len()) as u64;
        bytes += gate_up_bias.as_ref().map(Vec::len).unwrap_or(0) as u64;
        bytes += down_bias.as_ref().map(Vec::len).unwrap_or(0) as u64;

        let weights = ExpertWeights::Mxfp4 {
            w_gate_up_blocks: self.upload(&format!("expert.{l}.{e}.gate_up_blocks"), &gate_up_blocks),
            w_gate_up_scales: self.upload(&format!("expert.{l}.{e}.gate_up_scales"), &gate_up_scales),
            w_gate_up_bias: gate_up_bias.map(|d| self.upload(&format!("expert.{l}.{e}.gate_up_bias"), &d)),
            w_down_blocks: self.upload(&format!("expert.{l}.{e}.down_blocks"), &down_blocks),
            w_down_scales: self.upload(&format!("expert.{l}.{e}.down_scales"), &down_scales),
            w_down_bias: down_bias.map(|d| self.upload(&format!("expert.{l}.{e}.down_bias"), &d)),
        };
        Ok((weights, bytes))
    }

    async fn fetch_tensor(
        &self,
        l: usize,
        e: usize,
        tensors: &HashMap<String, TensorMeta>,
        suffix: &str,
    ) -> Result<Vec<u8>> {
        let meta = tensors
            .get(suffix)
            .ok_or_else(|| CoreError::MissingWeight(format!("expert ({l}, {e}) missing tensor \"{suffix}\"")))?;
        load_expert_tensor(self.shard_adapter.as_ref(), meta).await
    }

    async fn try_fetch_tensor(
        &self,
        _l: usize,
        _e: usize,
        tensors: &HashMap<String, TensorMeta>,
        suffix: &str,
    ) -> Result<Option<Vec<u8>>> {
        match tensors.get(suffix) {
            Some(meta) => Ok(Some(load_expert_tensor(self.shard_adapter.as_ref(), meta).await?)),
            None => Ok(None),
        }
    }

    fn upload(&self, label: &str, data: &[u8]) -> GpuBuf {
        let size = data.len().max(4) as u64;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: true,
        });
        {
            let mut view = buffer.slice(..).get_mapped_range_mut();
            view[..data.len()].copy_from_slice(data);
        }
        buffer.unmap();
        Arc::new(buffer)
    }

    /// Evict least-recently-used, non-in-use, non-pinned entries until
    /// `bytes_cached + new_bytes <= budget` (spec §4.5 eviction policy).
    async fn make_room_for(&self, new_bytes: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        while state.bytes_cached + new_bytes > self.budget_bytes {
            let victim = state
                .entries
                .iter()
                .filter(|(_, entry)| !entry.in_use && !entry.pinned)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);

            match victim {
                Some(key) => {
                    let entry = state.entries.remove(&key).expect("victim key must exist");
                    state.bytes_cached -= entry.bytes;
                    info!(layer = key.0, expert = key.1, "evicted expert weights");
                }
                None => {
                    return Err(CoreError::ResourceExhausted(format!(
                        "expert cache cannot evict enough to fit {new_bytes} more bytes under a {} byte budget",
                        self.budget_bytes
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn mark_in_use(&self, l: usize, e: usize) {
        if let Some(entry) = self.state.lock().await.entries.get_mut(&(l, e)) {
            entry.in_use = true;
        }
    }

    pub async fn mark_not_in_use(&self, l: usize, e: usize) {
        if let Some(entry) = self.state.lock().await.entries.get_mut(&(l, e)) {
            entry.in_use = false;
        }
    }

    pub async fn pin_shared(&self, l: usize, e: usize) -> Result<()> {
        self.ensure_loaded(l, e).await?;
        if let Some(entry) = self.state.lock().await.entries.get_mut(&(l, e)) {
            entry.pinned = true;
        }
        Ok(())
    }

    /// Advisory prefetch: load experts for the next layer if they are not
    /// already cached, ignoring failures (spec §4.5 `prefetch`).
    pub async fn prefetch(&self, entries: &[(usize, usize)]) {
        for &(l, e) in entries {
            let already = self.state.lock().await.entries.contains_key(&(l, e));
            if !already {
                let _ = self.ensure_loaded(l, e).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // Eviction-policy unit tests live in `moe::router` tests alongside the
    // token-count invariants they share a fixture with, since both need a
    // live wgpu::Device to exercise ExpertCache end-to-end; the pure
    // recency-ordering logic is covered here.

    #[test]
    fn lru_picks_minimum_last_used_among_eligible() {
        let candidates = [((0usize, 1usize), 5u64, false, false), ((0, 2), 2, false, false), ((0, 3), 1, true, false)];
        let victim = candidates
            .iter()
            .filter(|(_, _, in_use, pinned)| !*in_use && !*pinned)
            .min_by_key(|(_, last_used, _, _)| *last_used)
            .map(|(key, _, _, _)| *key);
        assert_eq!(victim, Some((0, 2)));
    }
}
