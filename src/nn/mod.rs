pub mod attention;
pub mod ffn;
pub mod gpu_util;
pub mod layer;
pub mod linear;
pub mod rmsnorm;
pub mod rope;

pub use attention::Attention;
pub use ffn::{Ffn, FfnWeights};
pub use layer::{Layer, LayerFfn, NormKind};
pub use linear::{Linear, LinearWeights};
