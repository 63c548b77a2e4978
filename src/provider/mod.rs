//! Provider adapter contract and factory registry.
//!
//! Adapters identify items by provider-side `sourceRef` strings and
//! never see node ids. Optional operations (byte streams, metadata
//! probes, watches) are advertised through [`Capabilities`].

pub mod hugging_face;
pub mod local;
pub mod walker;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::{Error, Result};
use crate::node::{MountConfig, NodeKind};

/// Chunked byte stream produced by [`ProviderAdapter::create_read_stream`].
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Callback receiving provider watch events.
pub type WatchSink = Box<dyn Fn(WatchEvent) + Send + Sync>;

/// Optional operations an adapter supports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub watch: bool,
    pub read_stream: bool,
    pub metadata: bool,
}

/// One listed entry, identified by its provider-side ref.
#[derive(Debug, Clone, PartialEq)]
pub struct ListItem {
    pub source_ref: String,
    pub parent_source_ref: Option<String>,
    pub name: String,
    pub kind: NodeKind,
    pub size: Option<u64>,
    pub mtime_ms: Option<i64>,
    pub provider_version: Option<String>,
    pub title: Option<String>,
}

/// Arguments to [`ProviderAdapter::list_children`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Parent ref; `None` lists the provider root.
    pub parent_id: Option<String>,
    pub limit: usize,
    /// Provider continuation token from a previous page.
    pub cursor: Option<String>,
}

/// One page of listed children.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage {
    pub items: Vec<ListItem>,
    pub next_cursor: Option<String>,
}

/// Byte range for ranged reads; half-open `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadRange {
    pub offset: Option<u64>,
    pub length: Option<u64>,
}

/// Kind of change reported by a provider watch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Add,
    UpdateMetadata,
    UpdateContent,
    Delete,
}

/// A change reported by a provider watch.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub source_ref: String,
    pub parent_source_ref: Option<String>,
}

/// Handle keeping a provider watch alive; closing stops delivery.
pub struct WatchHandle {
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(closer: impl FnOnce() + Send + 'static) -> Self {
        Self { closer: Some(Box::new(closer)) }
    }

    /// Stops the watch and releases underlying resources.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A content source attached behind a mount.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Lists direct children of `parent_id` (the provider root when
    /// `None`), paged by the provider's own cursor scheme.
    async fn list_children(&self, query: ListQuery) -> Result<ListPage>;

    /// Opens a chunked byte stream over one file, honouring `range`.
    async fn create_read_stream(&self, _id: &str, _range: ReadRange) -> Result<ByteStream> {
        Err(Error::Unsupported("create_read_stream"))
    }

    /// Stats a single item; `Ok(None)` when the provider no longer has it.
    async fn get_metadata(&self, _id: &str) -> Result<Option<ListItem>> {
        Err(Error::Unsupported("get_metadata"))
    }

    /// Starts delivering change events into `sink`.
    fn watch(&self, _sink: WatchSink) -> Result<WatchHandle> {
        Err(Error::Unsupported("watch"))
    }
}

/// Constructor for adapters of one provider type.
pub type AdapterFactory =
    Arc<dyn Fn(&MountConfig) -> Result<Arc<dyn ProviderAdapter>> + Send + Sync>;

/// Factory table mapping provider types to adapter constructors.
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, AdapterFactory>>,
}

impl ProviderRegistry {
    /// An empty registry, for callers supplying their own providers.
    pub fn new() -> Self {
        Self { factories: RwLock::new(HashMap::new()) }
    }

    /// A registry pre-populated with the built-in `local` and
    /// `huggingface` factories.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(local::PROVIDER_TYPE, Arc::new(local_factory));
        registry.register(hugging_face::PROVIDER_TYPE, Arc::new(hugging_face_factory));
        registry
    }

    pub fn register(&self, provider_type: impl Into<String>, factory: AdapterFactory) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider_type.into(), factory);
    }

    /// Builds an adapter for the mount's provider type.
    pub fn get(&self, mount: &MountConfig) -> Result<Arc<dyn ProviderAdapter>> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        let factory = factories
            .get(&mount.provider_type)
            .ok_or_else(|| Error::UnknownProviderType(mount.provider_type.clone()))?;
        factory(mount)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn local_factory(mount: &MountConfig) -> Result<Arc<dyn ProviderAdapter>> {
    Ok(Arc::new(local::LocalProvider::from_mount(mount)?))
}

fn hugging_face_factory(mount: &MountConfig) -> Result<Arc<dyn ProviderAdapter>> {
    Ok(Arc::new(hugging_face::HuggingFaceProvider::from_mount(mount)?))
}

/// Splits a ref into `(parent, name)` at the last separator.
pub fn split_source_ref(source_ref: &str) -> (Option<&str>, &str) {
    match source_ref.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, source_ref),
    }
}

/// Orders a listing files-first, then by name.
pub fn sort_listing(items: &mut [ListItem]) {
    fn rank(item: &ListItem) -> u8 {
        match item.kind {
            NodeKind::File => 0,
            _ => 1,
        }
    }
    items.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name)));
}

/// Pages a fully materialised listing with a decimal offset cursor.
pub fn paginate_by_offset(
    items: Vec<ListItem>,
    limit: usize,
    cursor: Option<&str>,
) -> Result<ListPage> {
    let offset: usize = match cursor {
        None => 0,
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::MalformedCursor(format!("`{raw}` is not a listing offset")))?,
    };
    let limit = limit.max(1);
    let total = items.len();
    let start = offset.min(total);
    let end = start.saturating_add(limit).min(total);
    let next_cursor = (end < total).then(|| end.to_string());
    Ok(ListPage { items: items.into_iter().skip(start).take(end - start).collect(), next_cursor })
}

/// Rejects byte ranges with a zero-length window.
pub fn validate_range(range: &ReadRange) -> Result<()> {
    if range.length == Some(0) {
        return Err(Error::InvalidRange { offset: range.offset.unwrap_or(0), length: 0 });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, kind: NodeKind) -> ListItem {
        ListItem {
            source_ref: name.to_owned(),
            parent_source_ref: None,
            name: name.to_owned(),
            kind,
            size: None,
            mtime_ms: None,
            provider_version: None,
            title: None,
        }
    }

    #[test]
    fn listings_sort_files_before_folders() {
        let mut items = vec![
            item("zoo", NodeKind::File),
            item("alpha", NodeKind::Folder),
            item("beta", NodeKind::File),
        ];
        sort_listing(&mut items);
        let names: Vec<&str> = items.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, ["beta", "zoo", "alpha"]);
    }

    #[test]
    fn offset_pagination_walks_the_listing() {
        let items = vec![
            item("a", NodeKind::File),
            item("b", NodeKind::File),
            item("c", NodeKind::File),
        ];
        let first = paginate_by_offset(items.clone(), 2, None).unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("2"));

        let second = paginate_by_offset(items, 2, first.next_cursor.as_deref()).unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_cursor.is_none());
    }

    #[test]
    fn offset_pagination_rejects_non_numeric_cursors() {
        let outcome = paginate_by_offset(Vec::new(), 5, Some("three"));
        assert!(matches!(outcome, Err(Error::MalformedCursor(_))));
    }

    #[test]
    fn source_ref_split_finds_the_last_separator() {
        assert_eq!(split_source_ref("a/b/c.txt"), (Some("a/b"), "c.txt"));
        assert_eq!(split_source_ref("top.txt"), (None, "top.txt"));
    }

    #[test]
    fn zero_length_ranges_are_invalid() {
        let outcome = validate_range(&ReadRange { offset: Some(4), length: Some(0) });
        assert!(matches!(outcome, Err(Error::InvalidRange { offset: 4, length: 0 })));
        assert!(validate_range(&ReadRange::default()).is_ok());
    }

    #[test]
    fn unknown_provider_type_is_rejected() {
        let registry = ProviderRegistry::with_builtins();
        let mount = crate::node::MountSpec {
            provider_type: "carrier-pigeon".to_owned(),
            provider_extra: Default::default(),
            sync_metadata: false,
            sync_content: false,
            metadata_ttl_sec: 60,
            reconcile_interval_ms: 1_000,
        }
        .bind("m1".to_owned());
        assert!(matches!(registry.get(&mount), Err(Error::UnknownProviderType(_))));
    }
}
