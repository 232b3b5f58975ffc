use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Capability set C probed once at device creation (spec §3 "Device handle").
///
/// Every kernel-variant selection (§4.2) consults this instead of querying
/// the device directly, so the dispatcher stays testable without a live GPU.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    pub has_f16: bool,
    pub has_subgroups: bool,
    pub max_shared_mem_bytes: u32,
    pub max_storage_buffer_bytes: u64,
}

/// Process-wide GPU handle: device, queue, and the probed capability set.
///
/// Created once at startup, destroyed at shutdown (spec §3). Global state is
/// limited to this and the buffer pool (spec §9 "Global state") — a model
/// instance carries its own configuration, caches, and RoPE tables on top.
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub caps: DeviceCaps,
}

/// Initialize the wgpu device and queue, probing capability and requesting
/// the adapter's maximum limits.
pub async fn init_gpu() -> Result<GpuContext> {
    let instance = wgpu::Instance::default();

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            ..Default::default()
        })
        .await
        .map_err(|e| CoreError::Gpu(format!("Failed to get adapter: {e}")))?;

    let adapter_limits = adapter.limits();
    let adapter_features = adapter.features();

    let mut required_limits = wgpu::Limits::default();
    required_limits.max_buffer_size = adapter_limits.max_buffer_size;
    required_limits.max_storage_buffer_binding_size =
        adapter_limits.max_storage_buffer_binding_size;
    required_limits.max_storage_buffers_per_shader_stage =
        adapter_limits.max_storage_buffers_per_shader_stage;
    required_limits.max_compute_workgroup_size_x = adapter_limits.max_compute_workgroup_size_x;
    required_limits.max_compute_workgroup_size_y = adapter_limits.max_compute_workgroup_size_y;
    required_limits.max_compute_workgroup_size_z = adapter_limits.max_compute_workgroup_size_z;
    required_limits.max_compute_invocations_per_workgroup =
        adapter_limits.max_compute_invocations_per_workgroup;
    required_limits.max_compute_workgroup_storage_size =
        adapter_limits.max_compute_workgroup_storage_size;

    let wanted_features = wgpu::Features::SHADER_F16 | wgpu::Features::SUBGROUP;
    let required_features = wanted_features & adapter_features;

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("inference-core"),
            required_features,
            required_limits,
            ..Default::default()
        })
        .await?;

    let caps = DeviceCaps {
        has_f16: device.features().contains(wgpu::Features::SHADER_F16),
        has_subgroups: device.features().contains(wgpu::Features::SUBGROUP),
        max_shared_mem_bytes: adapter_limits.max_compute_workgroup_storage_size,
        max_storage_buffer_bytes: adapter_limits.max_storage_buffer_binding_size as u64,
    };

    debug!(
        has_f16 = caps.has_f16,
        has_subgroups = caps.has_subgroups,
        max_shared_mem_bytes = caps.max_shared_mem_bytes,
        "probed device capability"
    );
    info!("GPU device initialized");

    Ok(GpuContext {
        device: Arc::new(device),
        queue: Arc::new(queue),
        caps,
    })
}
