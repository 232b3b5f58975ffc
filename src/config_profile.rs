use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A declarative kernel-variant pin for one op, optionally scoped to a
/// layer range and/or device family (spec §6 "Configuration profiles
/// (optional YAML)"). Absent profile data means auto-selection applies —
/// this is a pure override layer on top of `gpu::pipeline::select_*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelOverride {
    pub op: String,
    pub variant: String,
    pub layer_range: Option<(usize, usize)>,
    pub device_family: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigProfile {
    #[serde(default)]
    pub overrides: Vec<KernelOverride>,
}

impl ConfigProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// The pinned variant for `op` at `layer`, if any override matches
    /// (layer range and device family are both optional scoping filters).
    pub fn pinned_variant(&self, op: &str, layer: usize, device_family: &str) -> Option<&str> {
        self.overrides
            .iter()
            .find(|o| {
                o.op == op
                    && o.layer_range.map(|(lo, hi)| layer >= lo && layer < hi).unwrap_or(true)
                    && o.device_family.as_deref().map(|f| f == device_family).unwrap_or(true)
            })
            .map(|o| o.variant.as_str())
    }
}

/// Group overrides by op for fast repeated lookups during a forward pass.
pub fn index_by_op(profile: &ConfigProfile) -> HashMap<&str, Vec<&KernelOverride>> {
    let mut map: HashMap<&str, Vec<&KernelOverride>> = HashMap::new();
    for o in &profile.overrides {
        map.entry(o.op.as_str()).or_default().push(o);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> ConfigProfile {
        ConfigProfile {
            overrides: vec![
                KernelOverride {
                    op: "matmul".to_string(),
                    variant: "f32_tiled".to_string(),
                    layer_range: Some((0, 4)),
                    device_family: None,
                },
                KernelOverride {
                    op: "matmul".to_string(),
                    variant: "gemv".to_string(),
                    layer_range: None,
                    device_family: Some("intel".to_string()),
                },
            ],
        }
    }

    #[test]
    fn layer_range_scopes_the_override() {
        let profile = sample_profile();
        assert_eq!(profile.pinned_variant("matmul", 2, "nvidia"), Some("f32_tiled"));
        assert_eq!(profile.pinned_variant("matmul", 5, "intel"), Some("gemv"));
    }

    #[test]
    fn device_family_scopes_the_override() {
        let profile = sample_profile();
        assert_eq!(profile.pinned_variant("matmul", 10, "amd"), None);
    }

    #[test]
    fn absent_override_returns_none() {
        let profile = ConfigProfile::default();
        assert_eq!(profile.pinned_variant("matmul", 0, "nvidia"), None);
    }
}
