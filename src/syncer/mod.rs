//! Metadata reconciliation and content synchronisation for one mount.
//!
//! A syncer owns a mount's slice of the content directory
//! (`<content_root_parent>/<mount_id>/...`). Concurrent syncers on the
//! same mount are unsupported.

pub mod scheduler;

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::node::{now_ms, MountConfig, Node, NodeKind, MOUNT_ROOT_REF};
use crate::node_id::{create_node_id, create_parent_id};
use crate::provider::walker::{walk_provider, WalkOptions};
use crate::provider::{
    split_source_ref, ListItem, ProviderAdapter, ReadRange, WatchEvent, WatchEventKind,
    WatchHandle,
};
use crate::repo::Repository;

const SYNC_PAGE_LIMIT: usize = 256;

/// Current phase of a [`Syncer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Metadata,
    Content,
}

/// Progress and status notifications published by a [`Syncer`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Status {
        is_syncing: bool,
        phase: SyncPhase,
    },
    MetadataProgress {
        total: usize,
        processed: usize,
        added: usize,
        updated: usize,
        deleted: usize,
    },
    DownloadProgress {
        source_ref: String,
        total_size: Option<u64>,
        downloaded_bytes: u64,
        download_path: PathBuf,
    },
}

type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Identifier returned by [`Syncer::subscribe`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct WatchState {
    handle: WatchHandle,
    task: JoinHandle<()>,
}

/// Reconciles one mount's metadata and content with its provider.
pub struct Syncer {
    mount: MountConfig,
    adapter: Arc<dyn ProviderAdapter>,
    repo: Arc<Repository>,
    content_dir: PathBuf,
    listeners: Mutex<Vec<(SubscriptionId, EventListener)>>,
    next_subscription: AtomicU64,
    watch: Mutex<Option<WatchState>>,
}

impl Syncer {
    pub fn new(
        mount: MountConfig,
        adapter: Arc<dyn ProviderAdapter>,
        repo: Arc<Repository>,
        content_root_parent: impl AsRef<Path>,
    ) -> Self {
        let content_dir = content_root_parent.as_ref().join(&mount.mount_id);
        Self {
            mount,
            adapter,
            repo,
            content_dir,
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            watch: Mutex::new(None),
        }
    }

    pub fn mount(&self) -> &MountConfig {
        &self.mount
    }

    /// Registers an event listener; broadcasts are synchronous, so
    /// listeners must not block.
    pub fn subscribe(&self, listener: impl Fn(&SyncEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners_slot().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners_slot().retain(|(subscription, _)| *subscription != id);
    }

    fn listeners_slot(&self) -> MutexGuard<'_, Vec<(SubscriptionId, EventListener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watch_slot(&self) -> MutexGuard<'_, Option<WatchState>> {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SyncEvent) {
        let listeners: Vec<EventListener> =
            self.listeners_slot().iter().map(|(_, listener)| Arc::clone(listener)).collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(mount_id = %self.mount.mount_id, "sync event listener panicked");
            }
        }
    }

    /// Reconciles the whole mount: walks the provider, applies
    /// add/update/delete against the repository, then mirrors content
    /// when the mount asks for it.
    pub async fn full_sync(&self) -> Result<()> {
        self.emit(SyncEvent::Status { is_syncing: true, phase: SyncPhase::Metadata });
        let outcome = self.run_full_sync().await;
        self.emit(SyncEvent::Status { is_syncing: false, phase: SyncPhase::Idle });
        outcome
    }

    async fn run_full_sync(&self) -> Result<()> {
        let caps = self.adapter.capabilities();
        let items = walk_provider(
            self.adapter.as_ref(),
            None,
            &WalkOptions { page_limit: SYNC_PAGE_LIMIT, enrich_metadata: caps.metadata },
        )
        .await?;

        let existing = self.repo.list_nodes_by_mount_id(&self.mount.mount_id, true)?;
        let by_ref: HashMap<&str, &Node> =
            existing.iter().map(|node| (node.source_ref.as_str(), node)).collect();

        let now = now_ms();
        let root_id = create_node_id(&self.mount.mount_id, MOUNT_ROOT_REF);
        let mut upserts = Vec::with_capacity(items.len());
        let mut restart: HashSet<String> = HashSet::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let (mut added, mut updated) = (0usize, 0usize);

        for item in &items {
            seen.insert(item.source_ref.as_str());
            let mut next = self.node_from_item(item, &root_id, now);
            match by_ref.get(item.source_ref.as_str()) {
                None => added += 1,
                Some(prev) => {
                    next.created_at_ms = prev.created_at_ms;
                    let version_changed = prev.provider_version != next.provider_version;
                    let changed = prev.size != next.size
                        || prev.mtime_ms != next.mtime_ms
                        || version_changed
                        || prev.deleted_at_ms.is_some();
                    if changed {
                        updated += 1;
                    }
                    if version_changed {
                        restart.insert(item.source_ref.clone());
                    }
                }
            }
            upserts.push(next);
        }
        self.repo.upsert_nodes(&upserts)?;

        let mut tombstones = Vec::new();
        for node in &existing {
            if node.kind == NodeKind::Mount
                || node.deleted_at_ms.is_some()
                || seen.contains(node.source_ref.as_str())
            {
                continue;
            }
            let mut dead = node.clone();
            dead.deleted_at_ms = Some(now);
            dead.updated_at_ms = now;
            tombstones.push(dead);
        }
        let deleted = tombstones.len();
        self.repo.upsert_nodes(&tombstones)?;

        self.emit(SyncEvent::MetadataProgress {
            total: items.len(),
            processed: items.len(),
            added,
            updated,
            deleted,
        });
        info!(mount_id = %self.mount.mount_id, added, updated, deleted, "metadata reconcile finished");

        if self.mount.sync_content && caps.read_stream {
            self.emit(SyncEvent::Status { is_syncing: true, phase: SyncPhase::Content });
            for item in items.iter().filter(|item| item.kind == NodeKind::File) {
                self.sync_file(item, restart.contains(&item.source_ref)).await?;
            }
        }
        Ok(())
    }

    /// Mirrors one file into the content directory, resuming a partial
    /// download when one is present.
    async fn sync_file(&self, item: &ListItem, restart: bool) -> Result<()> {
        let final_path = self.content_path(&item.source_ref)?;
        let part_path = part_path_for(&final_path);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut start_offset = 0u64;
        if restart {
            remove_if_present(&part_path).await?;
            remove_if_present(&final_path).await?;
        } else {
            if let Some(meta) = metadata_if_present(&final_path).await? {
                match item.size {
                    Some(size) if size == meta.len() => {
                        self.emit(SyncEvent::DownloadProgress {
                            source_ref: item.source_ref.clone(),
                            total_size: item.size,
                            downloaded_bytes: meta.len(),
                            download_path: final_path.clone(),
                        });
                        return Ok(());
                    }
                    Some(_) => fs::remove_file(&final_path).await?,
                    None => {}
                }
            }
            if let Some(meta) = metadata_if_present(&part_path).await? {
                start_offset = meta.len();
                if let Some(size) = item.size {
                    if start_offset > size {
                        remove_if_present(&part_path).await?;
                        start_offset = 0;
                    }
                }
            }
        }
        self.download_with_resume(item, &final_path, &part_path, start_offset).await
    }

    /// Downloads once, and on a failed resume retries a single time
    /// from offset zero before surfacing the error.
    async fn download_with_resume(
        &self,
        item: &ListItem,
        final_path: &Path,
        part_path: &Path,
        start_offset: u64,
    ) -> Result<()> {
        match self.download_once(item, final_path, part_path, start_offset).await {
            Ok(()) => Ok(()),
            Err(err) if start_offset > 0 => {
                warn!(
                    source_ref = %item.source_ref,
                    error = %err,
                    "resume failed, restarting download from scratch"
                );
                remove_if_present(part_path).await?;
                self.download_once(item, final_path, part_path, 0).await
            }
            Err(err) => Err(err),
        }
    }

    async fn download_once(
        &self,
        item: &ListItem,
        final_path: &Path,
        part_path: &Path,
        start_offset: u64,
    ) -> Result<()> {
        let mut stream = self
            .adapter
            .create_read_stream(
                &item.source_ref,
                ReadRange { offset: (start_offset > 0).then_some(start_offset), length: None },
            )
            .await?;

        let mut out = if start_offset > 0 {
            OpenOptions::new().append(true).open(part_path).await?
        } else {
            OpenOptions::new().write(true).create(true).truncate(true).open(part_path).await?
        };

        let mut loaded = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            loaded += chunk.len() as u64;
            self.emit(SyncEvent::DownloadProgress {
                source_ref: item.source_ref.clone(),
                total_size: item.size,
                downloaded_bytes: start_offset + loaded,
                download_path: part_path.to_path_buf(),
            });
        }
        out.flush().await?;
        drop(out);

        if let Some(size) = item.size {
            if start_offset + loaded < size {
                return Err(Error::IncompleteDownload {
                    source_ref: item.source_ref.clone(),
                    received: start_offset + loaded,
                    expected: size,
                });
            }
        }
        fs::rename(part_path, final_path).await?;
        debug!(source_ref = %item.source_ref, bytes = start_offset + loaded, "download finished");
        Ok(())
    }

    /// Starts mirroring provider watch events; a no-op when the
    /// provider cannot watch or a watch is already running.
    ///
    /// Events are handled strictly in delivery order by one task.
    pub fn start_watching(self: Arc<Self>) -> Result<()> {
        if !self.adapter.capabilities().watch {
            return Ok(());
        }
        let mut slot = self.watch_slot();
        if slot.is_some() {
            return Ok(());
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<WatchEvent>();
        let handle = self.adapter.watch(Box::new(move |event| {
            let _ = sender.send(event);
        }))?;

        let syncer = Arc::clone(&self);
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(err) = syncer.handle_watch_event(event).await {
                    warn!(
                        mount_id = %syncer.mount.mount_id,
                        error = %err,
                        "watch event handling failed"
                    );
                }
            }
        });
        *slot = Some(WatchState { handle, task });
        Ok(())
    }

    /// Stops the provider watch and drains every event delivered so
    /// far before returning.
    pub async fn stop_watching(&self) {
        let state = self.watch_slot().take();
        if let Some(WatchState { handle, task }) = state {
            // Closing drops the sink; the queue task exits once the
            // already-delivered events are processed.
            handle.close();
            if task.await.is_err() {
                warn!(mount_id = %self.mount.mount_id, "watch queue task panicked");
            }
        }
    }

    async fn handle_watch_event(&self, event: WatchEvent) -> Result<()> {
        debug!(mount_id = %self.mount.mount_id, ?event, "watch event");
        match event.kind {
            WatchEventKind::Delete => self.apply_watch_delete(&event.source_ref),
            WatchEventKind::Add | WatchEventKind::UpdateMetadata | WatchEventKind::UpdateContent => {
                self.apply_watch_upsert(&event).await
            }
        }
    }

    fn apply_watch_delete(&self, source_ref: &str) -> Result<()> {
        let Some(prior) = self.repo.get_node_by_source_ref(&self.mount.mount_id, source_ref)?
        else {
            return Ok(());
        };
        if !prior.is_live() {
            return Ok(());
        }
        let now = now_ms();
        let mut dead = prior;
        dead.deleted_at_ms = Some(now);
        dead.updated_at_ms = now;
        self.repo.upsert_nodes(std::slice::from_ref(&dead))?;
        self.emit(SyncEvent::MetadataProgress {
            total: 1,
            processed: 1,
            added: 0,
            updated: 0,
            deleted: 1,
        });
        Ok(())
    }

    async fn apply_watch_upsert(&self, event: &WatchEvent) -> Result<()> {
        let caps = self.adapter.capabilities();
        if !caps.metadata {
            return Ok(());
        }
        let Some(mut item) = self.adapter.get_metadata(&event.source_ref).await? else {
            // The provider no longer has it; the event raced a removal.
            return self.apply_watch_delete(&event.source_ref);
        };
        if item.parent_source_ref.is_none() {
            item.parent_source_ref = event
                .parent_source_ref
                .clone()
                .or_else(|| split_source_ref(&event.source_ref).0.map(str::to_owned));
        }

        let prior = self.repo.get_node_by_source_ref(&self.mount.mount_id, &event.source_ref)?;
        let now = now_ms();
        let root_id = create_node_id(&self.mount.mount_id, MOUNT_ROOT_REF);
        let mut next = self.node_from_item(&item, &root_id, now);

        let is_new = prior.as_ref().map_or(true, |prev| prev.deleted_at_ms.is_some());
        let version_changed =
            prior.as_ref().is_some_and(|prev| prev.provider_version != next.provider_version);
        let attrs_changed = version_changed
            || prior
                .as_ref()
                .is_some_and(|prev| prev.size != next.size || prev.mtime_ms != next.mtime_ms);
        if let Some(prev) = &prior {
            next.created_at_ms = prev.created_at_ms;
        }
        self.repo.upsert_nodes(std::slice::from_ref(&next))?;
        self.emit(SyncEvent::MetadataProgress {
            total: 1,
            processed: 1,
            added: usize::from(is_new),
            updated: usize::from(!is_new),
            deleted: 0,
        });

        if self.mount.sync_content && caps.read_stream && item.kind == NodeKind::File {
            let final_missing =
                metadata_if_present(&self.content_path(&item.source_ref)?).await?.is_none();
            let should_sync = event.kind == WatchEventKind::UpdateContent
                || is_new
                || attrs_changed
                || final_missing;
            if should_sync {
                self.sync_file(&item, version_changed).await?;
            }
        }
        Ok(())
    }

    fn node_from_item(&self, item: &ListItem, root_id: &str, now: i64) -> Node {
        Node {
            node_id: create_node_id(&self.mount.mount_id, &item.source_ref),
            mount_id: self.mount.mount_id.clone(),
            parent_id: Some(
                create_parent_id(&self.mount.mount_id, item.parent_source_ref.as_deref())
                    .unwrap_or_else(|| root_id.to_owned()),
            ),
            name: item.name.clone(),
            kind: item.kind,
            size: (item.kind == NodeKind::File).then_some(item.size).flatten(),
            mtime_ms: item.mtime_ms,
            source_ref: item.source_ref.clone(),
            provider_version: item.provider_version.clone(),
            deleted_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Maps a ref onto the mount's content directory, rejecting refs
    /// that would land outside it.
    fn content_path(&self, source_ref: &str) -> Result<PathBuf> {
        let mut path = self.content_dir.clone();
        for segment in source_ref.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Error::PathEscape(source_ref.to_owned()));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

fn part_path_for(final_path: &Path) -> PathBuf {
    let mut os = final_path.to_path_buf().into_os_string();
    os.push(".part");
    PathBuf::from(os)
}

async fn metadata_if_present(path: &Path) -> Result<Option<std::fs::Metadata>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
