pub mod buffer_pool;
pub mod device;
pub mod pipeline;
pub mod recorder;

pub use buffer_pool::{BufferDType, BufferPool};
pub use device::{init_gpu, DeviceCaps, GpuContext};
pub use pipeline::PipelineManager;
pub use recorder::CommandRecorder;
