//! Core data model: nodes, node kinds, and mount configuration.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Source reference carried by every mount-root node.
pub const MOUNT_ROOT_REF: &str = "";

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Kind of a persisted [`Node`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Mount,
    Folder,
    File,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Mount => "mount",
            NodeKind::Folder => "folder",
            NodeKind::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<NodeKind> {
        match value {
            "mount" => Some(NodeKind::Mount),
            "folder" => Some(NodeKind::Folder),
            "file" => Some(NodeKind::File),
            _ => None,
        }
    }
}

/// A file, folder, or mount entry persisted in the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub mount_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: NodeKind,
    /// Byte size for files when known; folders and mounts carry `None`.
    pub size: Option<u64>,
    pub mtime_ms: Option<i64>,
    /// Provider-side stable identifier; empty for mount roots.
    pub source_ref: String,
    /// Opaque revision tag; a change signals "content differs".
    pub provider_version: Option<String>,
    /// Soft-delete tombstone.
    pub deleted_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Node {
    /// Whether the node has not been soft-deleted.
    pub fn is_live(&self) -> bool {
        self.deleted_at_ms.is_none()
    }
}

/// Caller-facing mount parameters, before an identifier is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub provider_type: String,
    /// Opaque provider-specific configuration keys.
    #[serde(default)]
    pub provider_extra: BTreeMap<String, String>,
    /// Whether the repository is authoritative for this mount's listings.
    #[serde(default)]
    pub sync_metadata: bool,
    /// Whether file bytes are mirrored to local content storage.
    #[serde(default)]
    pub sync_content: bool,
    #[serde(default = "default_metadata_ttl_sec")]
    pub metadata_ttl_sec: u64,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

impl MountSpec {
    /// Binds the spec to a mount identifier.
    pub fn bind(self, mount_id: String) -> MountConfig {
        MountConfig {
            mount_id,
            provider_type: self.provider_type,
            provider_extra: self.provider_extra,
            sync_metadata: self.sync_metadata,
            sync_content: self.sync_content,
            metadata_ttl_sec: self.metadata_ttl_sec,
            reconcile_interval_ms: self.reconcile_interval_ms,
        }
    }
}

fn default_metadata_ttl_sec() -> u64 {
    300
}

fn default_reconcile_interval_ms() -> u64 {
    300_000
}

/// A mount attachment's full configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MountConfig {
    pub mount_id: String,
    pub provider_type: String,
    pub provider_extra: BTreeMap<String, String>,
    pub sync_metadata: bool,
    pub sync_content: bool,
    pub metadata_ttl_sec: u64,
    pub reconcile_interval_ms: u64,
}
