pub mod config;
pub mod loader;
pub mod manifest;
pub mod shard;
pub mod weights;

pub use config::ModelConfig;
pub use loader::{load_model, ExpertTensorIndex, LoadOptions, LoadProgress, LoadResult};
pub use manifest::{config_from_manifest, parse_manifest, Manifest};
pub use shard::{LocalFileShardAdapter, ShardAdapter};
pub use weights::WeightStore;
