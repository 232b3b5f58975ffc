use thiserror::Error;

/// Error taxonomy for the inference core (spec §7).
///
/// Each variant maps to one of: config error (fatal at load), resource
/// exhausted (retryable once at the pipeline level), dispatch error (fatal —
/// no kernel variant fits), shape error (fatal — indicates a loader bug), or
/// adapter error (propagated from the shard/tokenizer boundary). Numeric
/// warnings are not represented here: they are non-fatal and reported via
/// `tracing::warn!` at the call site instead of aborting a `Result`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Failed to request GPU adapter")]
    NoAdapter,

    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("config error: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("configuration profile parse error: {0}")]
    ProfileParse(#[from] serde_yaml::Error),

    #[error("missing weight tensor: \"{0}\"")]
    MissingWeight(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("buffer mapping failed")]
    BufferMap,

    #[error("model not loaded")]
    NotLoaded,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
