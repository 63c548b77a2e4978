//! Filesystem-backed provider adapter.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use futures::StreamExt;
use notify::{RecursiveMode, Watcher};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::error::{Error, Result};
use crate::node::{MountConfig, NodeKind};

use super::{
    paginate_by_offset, sort_listing, split_source_ref, validate_range, ByteStream, Capabilities,
    ListItem, ListPage, ListQuery, ProviderAdapter, ReadRange, WatchEvent, WatchEventKind,
    WatchHandle, WatchSink,
};

pub const PROVIDER_TYPE: &str = "local";

/// Adapter over one directory tree on the host filesystem.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Builds the adapter from `providerExtra.directory`.
    pub fn from_mount(mount: &MountConfig) -> Result<Self> {
        let directory = mount
            .provider_extra
            .get("directory")
            .map(String::as_str)
            .filter(|dir| !dir.is_empty())
            .ok_or_else(|| {
                Error::ConfigInvalid("local mounts require a non-empty `directory`".into())
            })?;
        Ok(Self::new(PathBuf::from(directory)))
    }

    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolves a ref against the mount root, rejecting anything that
    /// would land outside it.
    fn resolve_ref(&self, source_ref: &str) -> Result<PathBuf> {
        let rel = Path::new(source_ref);
        if rel.is_absolute() {
            return Err(Error::PathEscape(source_ref.to_owned()));
        }
        let mut resolved = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(Error::PathEscape(source_ref.to_owned())),
            }
        }
        Ok(resolved)
    }

    fn join_ref(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_owned()
        } else {
            format!("{parent}/{name}")
        }
    }
}

#[async_trait]
impl ProviderAdapter for LocalProvider {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { watch: true, read_stream: true, metadata: true }
    }

    async fn list_children(&self, query: ListQuery) -> Result<ListPage> {
        let parent_ref = query.parent_id.unwrap_or_default();
        let dir = self.resolve_ref(&parent_ref)?;

        let mut entries = fs::read_dir(&dir).await?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                // Non-UTF-8 names cannot become source refs.
                Err(_) => continue,
            };
            let meta = entry.metadata().await?;
            let kind = if meta.is_dir() {
                NodeKind::Folder
            } else if meta.is_file() {
                NodeKind::File
            } else {
                continue;
            };
            items.push(ListItem {
                source_ref: Self::join_ref(&parent_ref, &name),
                parent_source_ref: (!parent_ref.is_empty()).then(|| parent_ref.clone()),
                name,
                kind,
                size: meta.is_file().then(|| meta.len()),
                mtime_ms: mtime_ms(&meta),
                provider_version: None,
                title: None,
            });
        }
        sort_listing(&mut items);
        paginate_by_offset(items, query.limit, query.cursor.as_deref())
    }

    async fn create_read_stream(&self, id: &str, range: ReadRange) -> Result<ByteStream> {
        validate_range(&range)?;
        let path = self.resolve_ref(id)?;
        let mut file = fs::File::open(&path).await?;
        if let Some(offset) = range.offset {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        let stream: ByteStream = match range.length {
            Some(length) => ReaderStream::new(file.take(length))
                .map(|chunk| chunk.map_err(Error::from))
                .boxed(),
            None => ReaderStream::new(file).map(|chunk| chunk.map_err(Error::from)).boxed(),
        };
        Ok(stream)
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<ListItem>> {
        let path = self.resolve_ref(id)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let kind = if meta.is_dir() {
            NodeKind::Folder
        } else if meta.is_file() {
            NodeKind::File
        } else {
            return Ok(None);
        };
        let (parent, name) = split_source_ref(id);
        Ok(Some(ListItem {
            source_ref: id.to_owned(),
            parent_source_ref: parent.map(str::to_owned),
            name: name.to_owned(),
            kind,
            size: meta.is_file().then(|| meta.len()),
            mtime_ms: mtime_ms(&meta),
            provider_version: None,
            title: None,
        }))
    }

    fn watch(&self, sink: WatchSink) -> Result<WatchHandle> {
        let root = self.root.clone();
        let mut watcher =
            notify::recommended_watcher(move |outcome: notify::Result<notify::Event>| {
                let event = match outcome {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "filesystem watch backend error");
                        return;
                    }
                };
                for change in map_notify_event(&root, &event) {
                    sink(change);
                }
            })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        Ok(WatchHandle::new(move || drop(watcher)))
    }
}

fn mtime_ms(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as i64)
}

fn source_ref_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_owned()),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

fn map_notify_event(root: &Path, event: &notify::Event) -> Vec<WatchEvent> {
    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind;

    let mut mapped = Vec::new();
    let mut push = |kind: WatchEventKind, path: &Path| {
        if let Some(source_ref) = source_ref_for(root, path) {
            let parent_source_ref = split_source_ref(&source_ref).0.map(str::to_owned);
            mapped.push(WatchEvent { kind, source_ref, parent_source_ref });
        }
    };
    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                push(WatchEventKind::Add, path);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                push(WatchEventKind::Delete, path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                push(WatchEventKind::Delete, from);
                push(WatchEventKind::Add, to);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                push(WatchEventKind::Delete, path);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            for path in &event.paths {
                push(WatchEventKind::Add, path);
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            for path in &event.paths {
                push(WatchEventKind::UpdateMetadata, path);
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                push(WatchEventKind::UpdateContent, path);
            }
        }
        _ => {}
    }
    mapped
}
