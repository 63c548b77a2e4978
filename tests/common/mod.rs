#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use tempfile::TempDir;

use polymount::error::{Error, Result};
use polymount::node::{MountSpec, NodeKind};
use polymount::provider::{
    paginate_by_offset, sort_listing, split_source_ref, ByteStream, Capabilities, ListItem,
    ListPage, ListQuery, ProviderAdapter, ProviderRegistry, ReadRange, WatchHandle, WatchSink,
};
use polymount::repo::Repository;
use polymount::service::VfsService;

/// Repository, registry, and service over a scratch directory.
pub struct Fixture {
    pub tempdir: TempDir,
    pub repo: Arc<Repository>,
    pub registry: Arc<ProviderRegistry>,
    pub service: VfsService,
}

impl Fixture {
    pub fn new() -> Self {
        let tempdir = TempDir::new().expect("create temp dir");
        let repo = Arc::new(Repository::open_in_memory().expect("open repository"));
        let registry = Arc::new(ProviderRegistry::with_builtins());
        let service = VfsService::new(repo.clone(), registry.clone());
        Self { tempdir, repo, registry, service }
    }

    pub fn source_dir(&self) -> PathBuf {
        let dir = self.tempdir.path().join("source");
        std::fs::create_dir_all(&dir).expect("create source dir");
        dir
    }

    pub fn content_root(&self) -> PathBuf {
        self.tempdir.path().join("content")
    }

    pub fn write_source(&self, rel: &str, data: &[u8]) {
        let path = self.source_dir().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create fixture dirs");
        }
        std::fs::write(path, data).expect("write fixture file");
    }

    /// Mount spec over this fixture's source directory.
    pub fn local_spec(&self) -> MountSpec {
        polymount::config::local_mount_spec(&self.source_dir(), false)
    }

    /// Makes a shared scripted adapter reachable through the registry
    /// under the `scripted` provider type.
    pub fn register_scripted(&self, provider: &Arc<ScriptedProvider>) {
        let shared = provider.clone();
        self.registry.register(
            "scripted",
            Arc::new(move |_mount: &polymount::node::MountConfig| {
                let adapter: Arc<dyn ProviderAdapter> = shared.clone();
                Ok(adapter)
            }),
        );
    }
}

pub fn scripted_spec(sync_metadata: bool, sync_content: bool, metadata_ttl_sec: u64) -> MountSpec {
    MountSpec {
        provider_type: "scripted".to_owned(),
        provider_extra: Default::default(),
        sync_metadata,
        sync_content,
        metadata_ttl_sec,
        reconcile_interval_ms: 60_000,
    }
}

pub fn list_item(
    source_ref: &str,
    kind: NodeKind,
    size: Option<u64>,
    version: Option<&str>,
) -> ListItem {
    let (parent, name) = split_source_ref(source_ref);
    ListItem {
        source_ref: source_ref.to_owned(),
        parent_source_ref: parent.map(str::to_owned),
        name: name.to_owned(),
        kind,
        size,
        mtime_ms: None,
        provider_version: version.map(str::to_owned),
        title: None,
    }
}

/// In-memory adapter with scriptable listings, contents, metadata
/// overrides, and a capturable watch sink.
pub struct ScriptedProvider {
    items: Mutex<Vec<ListItem>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    metadata: Mutex<HashMap<String, ListItem>>,
    pub list_calls: AtomicUsize,
    pub read_calls: Mutex<Vec<(String, Option<u64>)>>,
    watch_capable: bool,
    sink: Arc<Mutex<Option<WatchSink>>>,
}

impl ScriptedProvider {
    pub fn new(watch_capable: bool) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            contents: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            list_calls: AtomicUsize::new(0),
            read_calls: Mutex::new(Vec::new()),
            watch_capable,
            sink: Arc::new(Mutex::new(None)),
        })
    }

    /// Adds a file to the listing with the given advertised size.
    pub fn put_file(
        &self,
        source_ref: &str,
        content: &[u8],
        listed_size: Option<u64>,
        version: Option<&str>,
    ) {
        let item = list_item(source_ref, NodeKind::File, listed_size, version);
        let mut items = self.items.lock().unwrap();
        items.retain(|existing| existing.source_ref != source_ref);
        items.push(item);
        self.contents.lock().unwrap().insert(source_ref.to_owned(), content.to_vec());
    }

    pub fn put_folder(&self, source_ref: &str) {
        let item = list_item(source_ref, NodeKind::Folder, None, None);
        self.items.lock().unwrap().push(item);
    }

    /// Overrides what `get_metadata` reports for one ref.
    pub fn put_metadata(&self, source_ref: &str, size: Option<u64>, version: Option<&str>) {
        self.metadata
            .lock()
            .unwrap()
            .insert(source_ref.to_owned(), list_item(source_ref, NodeKind::File, size, version));
    }

    pub fn set_content(&self, source_ref: &str, content: &[u8]) {
        self.contents.lock().unwrap().insert(source_ref.to_owned(), content.to_vec());
    }

    pub fn remove(&self, source_ref: &str) {
        self.items.lock().unwrap().retain(|item| item.source_ref != source_ref);
        self.contents.lock().unwrap().remove(source_ref);
        self.metadata.lock().unwrap().remove(source_ref);
    }

    /// Delivers a watch event through the captured sink.
    pub fn fire(&self, event: polymount::provider::WatchEvent) {
        let sink = self.sink.lock().unwrap();
        let sink = sink.as_ref().expect("watch not started");
        sink(event);
    }

    pub fn read_calls(&self) -> Vec<(String, Option<u64>)> {
        self.read_calls.lock().unwrap().clone()
    }

    pub fn clear_read_calls(&self) {
        self.read_calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn provider_type(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { watch: self.watch_capable, read_stream: true, metadata: true }
    }

    async fn list_children(&self, query: ListQuery) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let parent = query.parent_id.unwrap_or_default();
        let all = self.items.lock().unwrap().clone();
        let mut children: Vec<ListItem> = all
            .into_iter()
            .filter(|item| match split_source_ref(&item.source_ref).0 {
                None => parent.is_empty(),
                Some(item_parent) => item_parent == parent,
            })
            .collect();
        sort_listing(&mut children);
        paginate_by_offset(children, query.limit, query.cursor.as_deref())
    }

    async fn create_read_stream(&self, id: &str, range: ReadRange) -> Result<ByteStream> {
        self.read_calls.lock().unwrap().push((id.to_owned(), range.offset));
        let data = self
            .contents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::EmptyResponseBody(id.to_owned()))?;
        let start = range.offset.unwrap_or(0) as usize;
        let mut slice = data.get(start..).unwrap_or_default().to_vec();
        if let Some(length) = range.length {
            slice.truncate(length as usize);
        }
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from(slice))];
        Ok(stream::iter(chunks).boxed())
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<ListItem>> {
        if let Some(item) = self.metadata.lock().unwrap().get(id) {
            return Ok(Some(item.clone()));
        }
        let items = self.items.lock().unwrap();
        Ok(items.iter().find(|item| item.source_ref == id).cloned())
    }

    fn watch(&self, sink: WatchSink) -> Result<WatchHandle> {
        *self.sink.lock().unwrap() = Some(sink);
        let slot = Arc::clone(&self.sink);
        Ok(WatchHandle::new(move || {
            slot.lock().unwrap().take();
        }))
    }
}
