pub mod expert_cache;
pub mod router;

pub use expert_cache::{ExpertCache, ExpertWeights};
pub use router::MoeRouter;
