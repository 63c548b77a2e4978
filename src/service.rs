//! Mount lifecycle and paged namespace traversal.
//!
//! The service answers listings from the repository wherever it is
//! authoritative; remote-authoritative mounts go through a TTL page
//! cache in front of the provider adapter.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::node::{now_ms, MountConfig, MountSpec, Node, NodeKind, MOUNT_ROOT_REF};
use crate::node_id::create_node_id;
use crate::provider::{ByteStream, ListItem, ListQuery, ProviderAdapter, ProviderRegistry};
use crate::repo::{LocalPageQuery, PageCacheEntry, Repository};

/// Where a [`WalkPage`] was answered from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WalkSource {
    Local,
    Remote,
}

/// One page of children plus its continuation token.
#[derive(Debug, Clone)]
pub struct WalkPage {
    pub items: Vec<Node>,
    pub next_cursor: Option<String>,
    pub source: WalkSource,
}

/// Arguments to [`VfsService::walk_children`].
#[derive(Debug, Clone, Default)]
pub struct WalkQuery {
    /// `None` walks the root level of mount nodes.
    pub parent_node_id: Option<String>,
    pub limit: usize,
    pub cursor: Option<String>,
}

/// A mounted provider attachment.
#[derive(Debug, Clone)]
pub struct Mount {
    pub config: MountConfig,
    pub root: Node,
}

/// Process-embedded VFS front-end.
pub struct VfsService {
    repo: Arc<Repository>,
    registry: Arc<ProviderRegistry>,
    adapters: moka::sync::Cache<String, Arc<dyn ProviderAdapter>>,
}

impl VfsService {
    pub fn new(repo: Arc<Repository>, registry: Arc<ProviderRegistry>) -> Self {
        Self { repo, registry, adapters: moka::sync::Cache::new(64) }
    }

    /// Attaches a provider under a freshly generated mount id.
    pub fn mount(&self, spec: MountSpec) -> Result<Mount> {
        self.mount_internal(Uuid::new_v4().to_string(), spec)
    }

    /// Attaches a provider under a caller-supplied mount id.
    ///
    /// The mount-root node and the extension row become visible in one
    /// transaction; re-mounting an existing id refreshes its config.
    pub fn mount_internal(&self, mount_id: String, spec: MountSpec) -> Result<Mount> {
        let config = spec.bind(mount_id);
        // Constructing the adapter validates provider type and extra keys.
        self.registry.get(&config)?;

        let now = now_ms();
        let root = Node {
            node_id: create_node_id(&config.mount_id, MOUNT_ROOT_REF),
            mount_id: config.mount_id.clone(),
            parent_id: None,
            name: config.mount_id.clone(),
            kind: NodeKind::Mount,
            size: None,
            mtime_ms: None,
            source_ref: MOUNT_ROOT_REF.to_owned(),
            provider_version: None,
            deleted_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.repo.insert_mount(&root, &config)?;
        info!(mount_id = %config.mount_id, provider = %config.provider_type, "mounted");
        Ok(Mount { config, root })
    }

    /// Detaches a mount: tombstones its nodes, drops its page cache,
    /// and removes the extension row.
    pub fn unmount(&self, mount_id: &str) -> Result<()> {
        let now = now_ms();
        let mut tombstones = self.repo.list_nodes_by_mount_id(mount_id, false)?;
        for node in tombstones.iter_mut() {
            node.deleted_at_ms = Some(now);
            node.updated_at_ms = now;
        }
        self.repo.upsert_nodes(&tombstones)?;
        self.repo.delete_page_cache_by_mount_id(mount_id)?;
        self.repo.delete_mount(mount_id)?;
        self.adapters.invalidate(mount_id);
        info!(mount_id, "unmounted");
        Ok(())
    }

    /// Pages through the children of `parent_node_id`, or through the
    /// root level of mount nodes when it is `None`.
    pub async fn walk_children(&self, query: WalkQuery) -> Result<WalkPage> {
        let limit = query.limit.max(1);
        match &query.parent_node_id {
            None => self.local_page(None, None, limit, query.cursor),
            Some(parent_node_id) => self.walk_children_of(parent_node_id, limit, query.cursor).await,
        }
    }

    /// Non-root restriction of [`Self::walk_children`].
    pub async fn list_children(
        &self,
        parent_node_id: &str,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<WalkPage> {
        self.walk_children_of(parent_node_id, limit.max(1), cursor).await
    }

    /// Byte access goes through provider adapters or the syncer's
    /// mirrored content; the service never streams.
    pub fn create_read_stream(&self) -> Result<ByteStream> {
        Err(Error::Unsupported("VfsService::create_read_stream"))
    }

    /// Invalidates the mount's cached remote pages so the next walk
    /// refetches, and opportunistically compacts expired rows.
    pub fn trigger_reconcile(&self, mount_id: &str) -> Result<()> {
        self.repo.delete_page_cache_by_mount_id(mount_id)?;
        let purged = self.repo.purge_expired_page_cache(now_ms())?;
        debug!(mount_id, purged, "page cache invalidated");
        Ok(())
    }

    async fn walk_children_of(
        &self,
        parent_node_id: &str,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<WalkPage> {
        let parent = self
            .repo
            .get_node_by_id(parent_node_id)?
            .filter(Node::is_live)
            .ok_or_else(|| Error::ParentNotFound(parent_node_id.to_owned()))?;
        // The extension row is authoritative; the adapter cache is not
        // consulted for configuration.
        let mount = self
            .repo
            .get_mount_by_mount_id(&parent.mount_id)?
            .ok_or_else(|| Error::MountConfigNotFound(parent.mount_id.clone()))?;

        if mount.sync_metadata {
            return self.local_page(
                Some(parent.mount_id.clone()),
                Some(parent.node_id.clone()),
                limit,
                cursor,
            );
        }
        self.remote_page(&mount, &parent, limit, cursor).await
    }

    fn local_page(
        &self,
        mount_id: Option<String>,
        parent_id: Option<String>,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<WalkPage> {
        let after = match cursor {
            Some(token) => Some(Cursor::decode(&token)?.into_local()?),
            None => None,
        };
        let page = self
            .repo
            .list_children_page_local(&LocalPageQuery { mount_id, parent_id, limit, after })?;
        let next_cursor = page
            .next
            .map(|(last_name, last_node_id)| Cursor::Local { last_name, last_node_id }.encode());
        Ok(WalkPage { items: page.items, next_cursor, source: WalkSource::Local })
    }

    async fn remote_page(
        &self,
        mount: &MountConfig,
        parent: &Node,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<WalkPage> {
        let provider_cursor = match cursor {
            Some(token) => Some(Cursor::decode(&token)?.into_remote()?),
            None => None,
        };
        let now = now_ms();
        let cache_key = format!(
            "{}::{}::{}::{}",
            mount.mount_id,
            parent.node_id,
            provider_cursor.as_deref().unwrap_or(""),
            limit
        );

        if let Some(entry) = self.repo.get_page_cache_if_fresh(&cache_key, now)? {
            let items: Vec<Node> = serde_json::from_str(&entry.items_json)?;
            let next_cursor =
                entry.next_cursor.map(|provider_cursor| Cursor::Remote { provider_cursor }.encode());
            return Ok(WalkPage { items, next_cursor, source: WalkSource::Remote });
        }

        let adapter = self.adapter_for(mount)?;
        let page = adapter
            .list_children(ListQuery {
                parent_id: (parent.kind != NodeKind::Mount).then(|| parent.source_ref.clone()),
                limit,
                cursor: provider_cursor,
            })
            .await?;

        let items: Vec<Node> = page
            .items
            .iter()
            .map(|item| node_from_remote_item(&mount.mount_id, &parent.node_id, item, now))
            .collect();
        self.repo.upsert_nodes(&items)?;
        self.repo.upsert_page_cache(&PageCacheEntry {
            cache_key,
            items_json: serde_json::to_string(&items)?,
            next_cursor: page.next_cursor.clone(),
            expires_at_ms: now + mount.metadata_ttl_sec as i64 * 1_000,
        })?;

        let next_cursor =
            page.next_cursor.map(|provider_cursor| Cursor::Remote { provider_cursor }.encode());
        Ok(WalkPage { items, next_cursor, source: WalkSource::Remote })
    }

    fn adapter_for(&self, mount: &MountConfig) -> Result<Arc<dyn ProviderAdapter>> {
        if let Some(adapter) = self.adapters.get(&mount.mount_id) {
            return Ok(adapter);
        }
        let adapter = self.registry.get(mount)?;
        self.adapters.insert(mount.mount_id.clone(), adapter.clone());
        Ok(adapter)
    }
}

fn node_from_remote_item(mount_id: &str, parent_node_id: &str, item: &ListItem, now: i64) -> Node {
    Node {
        node_id: create_node_id(mount_id, &item.source_ref),
        mount_id: mount_id.to_owned(),
        parent_id: Some(parent_node_id.to_owned()),
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
