//! Deterministic node identifier codec.
//!
//! A node id is a pure function of `(mount_id, source_ref)`: SHA-256
//! over a tagged seed, folded into a version-4 UUID, rendered as dashed
//! hex, then wrapped in URL-safe base64. The id is stable across
//! processes and reversible to its UUID form, but not to the inputs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Derives the node identifier for a `(mount_id, source_ref)` pair.
pub fn create_node_id(mount_id: &str, source_ref: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"node:");
    hasher.update(mount_id.as_bytes());
    hasher.update(b":");
    hasher.update(source_ref.as_bytes());
    let digest = hasher.finalize();

    let mut seed = [0u8; 16];
    seed.copy_from_slice(&digest[..16]);
    let uuid = uuid::Builder::from_random_bytes(seed).into_uuid();
    URL_SAFE_NO_PAD.encode(uuid.hyphenated().to_string())
}

/// Derives the parent identifier; `None` for root-level refs.
pub fn create_parent_id(mount_id: &str, parent_source_ref: Option<&str>) -> Option<String> {
    match parent_source_ref {
        None | Some("") => None,
        Some(parent) => Some(create_node_id(mount_id, parent)),
    }
}

/// Recovers the dashed-hex UUID behind a node id, for debugging.
pub fn decode_node_id_to_uuid(node_id: &str) -> Option<String> {
    let raw = URL_SAFE_NO_PAD.decode(node_id).ok()?;
    let text = String::from_utf8(raw).ok()?;
    Uuid::parse_str(&text).ok()?;
    Some(text)
}
