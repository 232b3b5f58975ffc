pub mod cache;

pub use cache::{ContiguousKv, KvCache, SlidingWindowKv};
