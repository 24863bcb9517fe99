use std::collections::BTreeMap;

use kiln_core::LaunchCommand;
use kiln_engine::ResolvedBase;
use serde::{Deserialize, Serialize};

use crate::layer::digest_bytes;

pub const SCHEMA_VERSION: u32 = 1;

/// Directory below the working directory that holds installed dependencies.
pub const DEPS_DIR: &str = ".kiln-deps";

/// Image configuration. Its SHA-256 is the image id.
///
/// Carries no timestamps and no tag, so two builds from identical inputs
/// serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub schema_version: u32,
    pub base: ResolvedBase,
    /// Absolute working directory, e.g. `/app`
    pub workdir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub exposed_port: Option<u16>,
    pub dependencies: DependencyInfo,
    /// Ordered bottom to top
    pub layers: Vec<LayerRecord>,
    pub entrypoint: LaunchCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    /// Absolute image path of the installed dependencies
    pub path: String,
    /// Variable set to `path` at launch
    pub path_env: Option<String>,
    /// Declared package names, in manifest order
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub role: LayerRole,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerRole {
    Manifest,
    Dependencies,
    Application,
}

impl ImageRecord {
    /// Canonical bytes stored in the image store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Image id: `sha256:<hex>` of [`to_bytes`](Self::to_bytes).
    pub fn id(&self) -> Result<String, serde_json::Error> {
        Ok(digest_bytes(&self.to_bytes()?))
    }

    pub fn layer(&self, role: LayerRole) -> Option<&LayerRecord> {
        self.layers.iter().find(|l| l.role == role)
    }
}
