//! TOML configuration for the CLI front-end.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::node::MountSpec;

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct VfsConfig {
    /// Path of the sqlite database file.
    pub database: PathBuf,
    /// Directory receiving mirrored content, one subdirectory per mount.
    pub content_root: PathBuf,
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
}

/// One declared mount.
#[derive(Debug, Clone, Deserialize)]
pub struct MountEntry {
    /// Stable mount identifier; generated when omitted.
    pub id: Option<String>,
    #[serde(flatten)]
    pub spec: MountSpec,
}

/// Loads and parses a configuration file.
pub fn load(path: &Path) -> Result<VfsConfig> {
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|err| Error::ConfigInvalid(err.to_string()))
}

/// Convenience constructor for a local-directory mount spec.
pub fn local_mount_spec(directory: &Path, sync_content: bool) -> MountSpec {
    let mut extra = BTreeMap::new();
    extra.insert("directory".to_owned(), directory.display().to_string());
    MountSpec {
        provider_type: crate::provider::local::PROVIDER_TYPE.to_owned(),
        provider_extra: extra,
        sync_metadata: true,
        sync_content,
        metadata_ttl_sec: 300,
        reconcile_interval_ms: 300_000,
    }
}
