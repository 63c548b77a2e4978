//! HTTP model-repository provider adapter.
//!
//! Lists a model's files through the repository API and fetches
//! whitelisted artefacts with ranged GETs. The model-level revision
//! hash doubles as every file's provider version.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::node::{MountConfig, NodeKind};

use super::{
    paginate_by_offset, sort_listing, split_source_ref, validate_range, ByteStream, Capabilities,
    ListItem, ListPage, ListQuery, ProviderAdapter, ReadRange,
};

pub const PROVIDER_TYPE: &str = "huggingface";

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Tokenizer and configuration files that may always be fetched.
const WHITELISTED_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "vocab.txt",
    "merges.txt",
    "sentencepiece.bpe.model",
];

/// Canonical model artefact; `model.onnx*` also covers data sidecars.
const MODEL_ARTEFACT: &str = "model.onnx";

#[derive(Debug, Clone, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Clone, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Adapter over one model repository behind an HTTP API.
pub struct HuggingFaceProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HuggingFaceProvider {
    /// Builds the adapter from `providerExtra.{model, endpoint?}`.
    pub fn from_mount(mount: &MountConfig) -> Result<Self> {
        let model = mount
            .provider_extra
            .get("model")
            .map(String::as_str)
            .filter(|model| !model.is_empty())
            .ok_or_else(|| {
                Error::ConfigInvalid("huggingface mounts require a non-empty `model`".into())
            })?;
        let endpoint = match mount.provider_extra.get("endpoint") {
            None => DEFAULT_ENDPOINT.to_owned(),
            Some(endpoint) if endpoint.is_empty() => {
                return Err(Error::ConfigInvalid("`endpoint` must be non-empty when given".into()))
            }
            Some(endpoint) => endpoint.trim_end_matches('/').to_owned(),
        };
        Ok(Self { client: reqwest::Client::new(), endpoint, model: model.to_owned() })
    }

    fn listing_url(&self) -> String {
        format!("{}/api/models/{}", self.endpoint, encode_path(&self.model))
    }

    fn resolve_url(&self, source_ref: &str) -> String {
        format!(
            "{}/{}/resolve/main/{}",
            self.endpoint,
            encode_path(&self.model),
            encode_path(source_ref)
        )
    }

    /// Fetches the model listing and expands it into files plus
    /// synthesised folders.
    async fn fetch_listing(&self) -> Result<Vec<ListItem>> {
        let url = self.listing_url();
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::RemoteFetchFailed { status: response.status().as_u16(), url });
        }
        let info: ModelInfo = response.json().await?;
        Ok(items_from_model_info(info))
    }

    /// Determines a file's size via HEAD, falling back to a one-byte
    /// ranged GET and the `Content-Range` total.
    async fn probe_size(&self, source_ref: &str) -> Result<Option<u64>> {
        let url = self.resolve_url(source_ref);
        if let Ok(response) = self.client.head(&url).send().await {
            if response.status().is_success() {
                if let Some(length) = response.content_length().filter(|length| *length > 0) {
                    return Ok(Some(length));
                }
            }
        }
        debug!(source_ref, "HEAD probe inconclusive, using ranged fallback");
        let response = self.client.get(&url).header(RANGE, "bytes=0-0").send().await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::PARTIAL_CONTENT {
            return Ok(None);
        }
        Ok(response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total))
    }
}

#[async_trait]
impl ProviderAdapter for HuggingFaceProvider {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { watch: false, read_stream: true, metadata: true }
    }

    async fn list_children(&self, query: ListQuery) -> Result<ListPage> {
        let all = self.fetch_listing().await?;
        let parent = query.parent_id.unwrap_or_default();
        let mut children = direct_children_of(all, &parent);
        sort_listing(&mut children);
        paginate_by_offset(children, query.limit, query.cursor.as_deref())
    }

    async fn create_read_stream(&self, id: &str, range: ReadRange) -> Result<ByteStream> {
        validate_range(&range)?;
        if !is_whitelisted(id) {
            return Err(Error::WhitelistViolation(id.to_owned()));
        }
        let url = self.resolve_url(id);
        let mut request = self.client.get(&url);
        if let Some(header) = range_header(&range) {
            request = request.header(RANGE, header);
        }
        let response = request.send().await?;
        let status = response.status();
        if !(status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT) {
            return Err(Error::RemoteFetchFailed { status: status.as_u16(), url });
        }
        if response.content_length() == Some(0) {
            return Err(Error::EmptyResponseBody(id.to_owned()));
        }
        Ok(response.bytes_stream().map(|chunk| chunk.map_err(Error::from)).boxed())
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<ListItem>> {
        let all = self.fetch_listing().await?;
        let Some(mut item) = all.into_iter().find(|item| item.source_ref == id) else {
            return Ok(None);
        };
        if item.kind == NodeKind::File && item.size.unwrap_or(0) == 0 {
            item.size = self.probe_size(&item.source_ref).await?;
        }
        Ok(Some(item))
    }
}

fn is_whitelisted(source_ref: &str) -> bool {
    let (_, name) = split_source_ref(source_ref);
    WHITELISTED_FILES.contains(&name) || name.starts_with(MODEL_ARTEFACT)
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn items_from_model_info(info: ModelInfo) -> Vec<ListItem> {
    let mut items = Vec::new();
    let mut folders: BTreeSet<String> = BTreeSet::new();

    for sibling in info.siblings {
        if !is_whitelisted(&sibling.rfilename) {
            continue;
        }
        let (parent, name) = split_source_ref(&sibling.rfilename);
        if let Some(parent) = parent {
            let mut prefix = String::new();
            for segment in parent.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(segment);
                folders.insert(prefix.clone());
            }
        }
        items.push(ListItem {
            parent_source_ref: parent.map(str::to_owned),
            name: name.to_owned(),
            source_ref: sibling.rfilename,
            kind: NodeKind::File,
            size: sibling.size,
            mtime_ms: None,
            provider_version: info.sha.clone(),
            title: None,
        });
    }

    for folder in folders {
        let (parent, name) = split_source_ref(&folder);
        items.push(ListItem {
            parent_source_ref: parent.map(str::to_owned),
            name: name.to_owned(),
            source_ref: folder.clone(),
            kind: NodeKind::Folder,
            size: None,
            mtime_ms: None,
            provider_version: None,
            title: None,
        });
    }

    items
}

fn direct_children_of(all: Vec<ListItem>, parent: &str) -> Vec<ListItem> {
    all.into_iter()
        .filter(|item| match split_source_ref(&item.source_ref).0 {
            None => parent.is_empty(),
            Some(item_parent) => item_parent == parent,
        })
        .collect()
}

fn range_header(range: &ReadRange) -> Option<String> {
    match (range.offset, range.length) {
        (None, None) => None,
        (offset, length) => {
            let start = offset.unwrap_or(0);
            Some(match length {
                Some(length) => format!("bytes={start}-{}", start + length - 1),
                None => format!("bytes={start}-"),
            })
        }
    }
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    // "bytes 0-0/12345"
    value.rsplit_once('/')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(files: &[(&str, Option<u64>)]) -> ModelInfo {
        ModelInfo {
            sha: Some("rev-1".to_owned()),
            siblings: files
                .iter()
                .map(|(name, size)| Sibling { rfilename: (*name).to_owned(), size: *size })
                .collect(),
        }
    }

    #[test]
    fn whitelist_admits_artefacts_and_sidecars() {
        assert!(is_whitelisted("config.json"));
        assert!(is_whitelisted("onnx/model.onnx"));
        assert!(is_whitelisted("onnx/model.onnx.data"));
        assert!(is_whitelisted("onnx/model.onnx_data"));
        assert!(!is_whitelisted("pytorch_model.bin"));
        assert!(!is_whitelisted("README.md"));
    }

    #[test]
    fn listing_synthesises_folders_from_prefixes() {
        let items = items_from_model_info(info(&[
            ("config.json", Some(100)),
            ("onnx/model.onnx", Some(5_000)),
            ("onnx/model.onnx.data", None),
        ]));

        let folders: Vec<&str> = items
            .iter()
            .filter(|item| item.kind == NodeKind::Folder)
            .map(|item| item.source_ref.as_str())
            .collect();
        assert_eq!(folders, ["onnx"]);

        let root_children = direct_children_of(items.clone(), "");
        let root_refs: Vec<&str> =
            root_children.iter().map(|item| item.source_ref.as_str()).collect();
        assert_eq!(root_refs, ["config.json", "onnx"]);

        let nested = direct_children_of(items, "onnx");
        assert_eq!(nested.len(), 2);
        assert!(nested.iter().all(|item| item.kind == NodeKind::File));
    }

    #[test]
    fn non_whitelisted_siblings_never_surface() {
        let items = items_from_model_info(info(&[
            ("pytorch_model.bin", Some(1)),
            ("assets/banner.png", Some(2)),
        ]));
        assert!(items.is_empty());
    }

    #[test]
    fn files_carry_the_model_revision() {
        let items = items_from_model_info(info(&[("config.json", Some(10))]));
        assert_eq!(items[0].provider_version.as_deref(), Some("rev-1"));
    }

    #[test]
    fn range_headers_follow_the_wire_contract() {
        assert_eq!(range_header(&ReadRange::default()), None);
        assert_eq!(
            range_header(&ReadRange { offset: Some(7), length: None }).as_deref(),
            Some("bytes=7-")
        );
        assert_eq!(
            range_header(&ReadRange { offset: Some(7), length: Some(3) }).as_deref(),
            Some("bytes=7-9")
        );
        assert_eq!(
            range_header(&ReadRange { offset: None, length: Some(4) }).as_deref(),
            Some("bytes=0-3")
        );
    }

    #[test]
    fn content_range_totals_parse() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12_345));
        assert_eq!(parse_content_range_total("bytes */17"), Some(17));
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn model_segments_are_url_encoded() {
        assert_eq!(encode_path("org/some model"), "org/some%20model");
        assert_eq!(encode_path("plain"), "plain");
    }
}
