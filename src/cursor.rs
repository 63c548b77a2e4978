//! Opaque pagination cursor codec.
//!
//! A cursor token is URL-safe base64 over a small tagged JSON payload.
//! Local cursors carry the `(name, nodeId)` boundary of a repository
//! page; remote cursors carry a provider continuation token verbatim.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A decoded continuation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Cursor {
    /// Boundary of a local `(name, nodeId)` ordered listing.
    #[serde(rename_all = "camelCase")]
    Local { last_name: String, last_node_id: String },
    /// Verbatim passthrough of a provider continuation token.
    #[serde(rename_all = "camelCase")]
    Remote { provider_cursor: String },
}

impl Cursor {
    /// Encodes the cursor as an opaque URL-safe token.
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).expect("cursor payloads always serialise");
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes a token, failing with [`Error::MalformedCursor`] on any
    /// transport or payload defect.
    pub fn decode(token: &str) -> Result<Cursor> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| Error::MalformedCursor("token is not base64".into()))?;
        let text = String::from_utf8(raw)
            .map_err(|_| Error::MalformedCursor("token payload is not UTF-8".into()))?;
        serde_json::from_str(&text)
            .map_err(|_| Error::MalformedCursor("token payload is not a cursor".into()))
    }

    /// Unwraps a local boundary, rejecting remote-mode tokens.
    pub fn into_local(self) -> Result<(String, String)> {
        match self {
            Cursor::Local { last_name, last_node_id } => Ok((last_name, last_node_id)),
            Cursor::Remote { .. } => {
                Err(Error::MalformedCursor("expected a local-mode cursor".into()))
            }
        }
    }

    /// Unwraps a provider continuation token, rejecting local-mode tokens.
    pub fn into_remote(self) -> Result<String> {
        match self {
            Cursor::Remote { provider_cursor } => Ok(provider_cursor),
            Cursor::Local { .. } => {
                Err(Error::MalformedCursor("expected a remote-mode cursor".into()))
            }
        }
    }
}
