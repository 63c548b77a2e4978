//! Persistent store of nodes, mount extensions, and the remote page cache.
//!
//! Backed by an embedded sqlite database. Writes are transactional;
//! node-change listeners fire synchronously after commit on the
//! writer's thread and must not block.

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::error::Result;
use crate::node::{MountConfig, Node, NodeKind};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vfs_nodes (
    nodeId TEXT PRIMARY KEY,
    mountId TEXT NOT NULL,
    parentId TEXT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    size INTEGER,
    mtimeMs INTEGER,
    sourceRef TEXT NOT NULL,
    providerVersion TEXT,
    deletedAtMs INTEGER,
    createdAtMs INTEGER NOT NULL,
    updatedAtMs INTEGER NOT NULL,
    UNIQUE (mountId, sourceRef)
);
CREATE INDEX IF NOT EXISTS idx_vfs_nodes_paging
    ON vfs_nodes (mountId, parentId, name, nodeId);
CREATE TABLE IF NOT EXISTS vfs_node_mount_ext (
    nodeId TEXT PRIMARY KEY,
    mountId TEXT NOT NULL UNIQUE,
    providerType TEXT NOT NULL,
    providerExtra TEXT NOT NULL,
    syncMetadata INTEGER NOT NULL,
    syncContent INTEGER NOT NULL,
    metadataTtlSec INTEGER NOT NULL,
    reconcileIntervalMs INTEGER NOT NULL,
    createdAtMs INTEGER NOT NULL,
    updatedAtMs INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS vfs_page_cache (
    cacheKey TEXT PRIMARY KEY,
    itemsJson TEXT NOT NULL,
    nextCursor TEXT,
    expiresAtMs INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vfs_page_cache_expiry
    ON vfs_page_cache (expiresAtMs);
";

const UPSERT_NODE: &str = "
INSERT INTO vfs_nodes (
    nodeId, mountId, parentId, name, kind, size, mtimeMs,
    sourceRef, providerVersion, deletedAtMs, createdAtMs, updatedAtMs
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(nodeId) DO UPDATE SET
    mountId = excluded.mountId,
    parentId = excluded.parentId,
    name = excluded.name,
    kind = excluded.kind,
    size = excluded.size,
    mtimeMs = excluded.mtimeMs,
    sourceRef = excluded.sourceRef,
    providerVersion = excluded.providerVersion,
    deletedAtMs = excluded.deletedAtMs,
    updatedAtMs = excluded.updatedAtMs
";

const NODE_COLUMNS: &str = "nodeId, mountId, parentId, name, kind, size, mtimeMs, \
                            sourceRef, providerVersion, deletedAtMs, createdAtMs, updatedAtMs";

/// A committed node mutation delivered to change listeners.
#[derive(Debug, Clone)]
pub struct NodeChange {
    pub prev: Option<Node>,
    pub next: Node,
}

type ChangeListener = Arc<dyn Fn(&[NodeChange]) + Send + Sync>;

/// Identifier returned by [`Repository::subscribe_node_changes`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Query for a local, `(name, nodeId)`-ordered children page.
#[derive(Debug, Clone, Default)]
pub struct LocalPageQuery {
    pub mount_id: Option<String>,
    pub parent_id: Option<String>,
    pub limit: usize,
    /// Exclusive `(name, nodeId)` boundary to continue after.
    pub after: Option<(String, String)>,
}

/// Page of nodes returned by [`Repository::list_children_page_local`].
#[derive(Debug, Clone)]
pub struct LocalPage {
    pub items: Vec<Node>,
    /// Boundary of this page, present when at least one more live row exists.
    pub next: Option<(String, String)>,
}

/// Cached remote listing page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCacheEntry {
    pub cache_key: String,
    pub items_json: String,
    pub next_cursor: Option<String>,
    pub expires_at_ms: i64,
}

/// Embedded store of nodes, mount-extension rows, and the page cache.
pub struct Repository {
    conn: Mutex<Connection>,
    listeners: Mutex<Vec<(ListenerId, ChangeListener)>>,
    next_listener_id: AtomicU64,
}

impl Repository {
    /// Opens (and idempotently migrates) a database file.
    pub fn open(path: &Path) -> Result<Repository> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Repository> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Repository> {
        conn.execute_batch(SCHEMA)?;
        Ok(Repository {
            conn: Mutex::new(conn),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transactionally inserts or updates the given rows and notifies
    /// change listeners after commit.
    ///
    /// The update arm never touches `createdAtMs`: re-upserting a row
    /// preserves its original creation stamp.
    pub fn upsert_nodes(&self, rows: &[Node]) -> Result<Vec<NodeChange>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut changes = Vec::with_capacity(rows.len());
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            for row in rows {
                let prev = query_node(
                    &tx,
                    &format!("SELECT {NODE_COLUMNS} FROM vfs_nodes WHERE nodeId = ?1"),
                    params![row.node_id],
                )?;
                tx.execute(
                    UPSERT_NODE,
                    params![
                        row.node_id,
                        row.mount_id,
                        row.parent_id,
                        row.name,
                        row.kind.as_str(),
                        row.size.map(|size| size as i64),
                        row.mtime_ms,
                        row.source_ref,
                        row.provider_version,
                        row.deleted_at_ms,
                        row.created_at_ms,
                        row.updated_at_ms,
                    ],
                )?;
                let mut next = row.clone();
                if let Some(prev) = &prev {
                    next.created_at_ms = prev.created_at_ms;
                }
                changes.push(NodeChange { prev, next });
            }
            tx.commit()?;
        }
        self.notify(&changes);
        Ok(changes)
    }

    pub fn get_node_by_id(&self, node_id: &str) -> Result<Option<Node>> {
        query_node(
            &self.conn(),
            &format!("SELECT {NODE_COLUMNS} FROM vfs_nodes WHERE nodeId = ?1"),
            params![node_id],
        )
    }

    pub fn get_node_by_source_ref(&self, mount_id: &str, source_ref: &str) -> Result<Option<Node>> {
        query_node(
            &self.conn(),
            &format!("SELECT {NODE_COLUMNS} FROM vfs_nodes WHERE mountId = ?1 AND sourceRef = ?2"),
            params![mount_id, source_ref],
        )
    }

    /// All rows of a mount, tombstones included when asked for.
    pub fn list_nodes_by_mount_id(&self, mount_id: &str, include_deleted: bool) -> Result<Vec<Node>> {
        let conn = self.conn();
        let sql = if include_deleted {
            format!("SELECT {NODE_COLUMNS} FROM vfs_nodes WHERE mountId = ?1")
        } else {
            format!("SELECT {NODE_COLUMNS} FROM vfs_nodes WHERE mountId = ?1 AND deletedAtMs IS NULL")
        };
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![mount_id])?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            nodes.push(node_from_row(row)?);
        }
        Ok(nodes)
    }

    /// One page of live children in strict `(name, nodeId)` order.
    ///
    /// Fetches `limit + 1` rows; the lookahead row only signals that a
    /// further page exists.
    pub fn list_children_page_local(&self, query: &LocalPageQuery) -> Result<LocalPage> {
        let limit = query.limit.max(1);
        let mut sql =
            format!("SELECT {NODE_COLUMNS} FROM vfs_nodes WHERE deletedAtMs IS NULL");
        let mut values: Vec<Value> = Vec::new();

        match &query.parent_id {
            Some(parent_id) => {
                sql.push_str(&format!(" AND parentId = ?{}", values.len() + 1));
                values.push(Value::Text(parent_id.clone()));
            }
            None => sql.push_str(" AND parentId IS NULL"),
        }
        if let Some(mount_id) = &query.mount_id {
            sql.push_str(&format!(" AND mountId = ?{}", values.len() + 1));
            values.push(Value::Text(mount_id.clone()));
        }
        if let Some((name, node_id)) = &query.after {
            let base = values.len();
            sql.push_str(&format!(
                " AND (name > ?{} OR (name = ?{} AND nodeId > ?{}))",
                base + 1,
                base + 2,
                base + 3
            ));
            values.push(Value::Text(name.clone()));
            values.push(Value::Text(name.clone()));
            values.push(Value::Text(node_id.clone()));
        }
        sql.push_str(&format!(" ORDER BY name ASC, nodeId ASC LIMIT ?{}", values.len() + 1));
        values.push(Value::Integer((limit + 1) as i64));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(node_from_row(row)?);
        }
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next = has_more
            .then(|| items.last().map(|node| (node.name.clone(), node.node_id.clone())))
            .flatten();
        Ok(LocalPage { items, next })
    }

    /// Creates the mount-root node and the mount-extension row in one
    /// visible transaction.
    pub fn insert_mount(&self, root: &Node, config: &MountConfig) -> Result<()> {
        let extra_json = serde_json::to_string(&config.provider_extra)?;
        let change = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let prev = query_node(
                &tx,
                &format!("SELECT {NODE_COLUMNS} FROM vfs_nodes WHERE nodeId = ?1"),
                params![root.node_id],
            )?;
            tx.execute(
                UPSERT_NODE,
                params![
                    root.node_id,
                    root.mount_id,
                    root.parent_id,
                    root.name,
                    root.kind.as_str(),
                    root.size.map(|size| size as i64),
                    root.mtime_ms,
                    root.source_ref,
                    root.provider_version,
                    root.deleted_at_ms,
                    root.created_at_ms,
                    root.updated_at_ms,
                ],
            )?;
            tx.execute(
                "INSERT INTO vfs_node_mount_ext (
                     nodeId, mountId, providerType, providerExtra, syncMetadata,
                     syncContent, metadataTtlSec, reconcileIntervalMs, createdAtMs, updatedAtMs
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(nodeId) DO UPDATE SET
                     providerType = excluded.providerType,
                     providerExtra = excluded.providerExtra,
                     syncMetadata = excluded.syncMetadata,
                     syncContent = excluded.syncContent,
                     metadataTtlSec = excluded.metadataTtlSec,
                     reconcileIntervalMs = excluded.reconcileIntervalMs,
                     updatedAtMs = excluded.updatedAtMs",
                params![
                    root.node_id,
                    config.mount_id,
                    config.provider_type,
                    extra_json,
                    config.sync_metadata,
                    config.sync_content,
                    config.metadata_ttl_sec as i64,
                    config.reconcile_interval_ms as i64,
                    root.created_at_ms,
                    root.updated_at_ms,
                ],
            )?;
            tx.commit()?;
            let mut next = root.clone();
            if let Some(prev) = &prev {
                next.created_at_ms = prev.created_at_ms;
            }
            NodeChange { prev, next }
        };
        self.notify(std::slice::from_ref(&change));
        Ok(())
    }

    pub fn get_mount_by_mount_id(&self, mount_id: &str) -> Result<Option<MountConfig>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT mountId, providerType, providerExtra, syncMetadata, syncContent,
                        metadataTtlSec, reconcileIntervalMs
                 FROM vfs_node_mount_ext WHERE mountId = ?1",
                params![mount_id],
                mount_config_from_row,
            )
            .optional()?;
        row.map(finish_mount_config).transpose()
    }

    pub fn list_mounts(&self) -> Result<Vec<MountConfig>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT mountId, providerType, providerExtra, syncMetadata, syncContent,
                    metadataTtlSec, reconcileIntervalMs
             FROM vfs_node_mount_ext ORDER BY mountId",
        )?;
        let raw = stmt
            .query_map(params![], mount_config_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(finish_mount_config).collect()
    }

    pub fn delete_mount(&self, mount_id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM vfs_node_mount_ext WHERE mountId = ?1", params![mount_id])?;
        Ok(())
    }

    pub fn upsert_page_cache(&self, entry: &PageCacheEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO vfs_page_cache (cacheKey, itemsJson, nextCursor, expiresAtMs)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cacheKey) DO UPDATE SET
                 itemsJson = excluded.itemsJson,
                 nextCursor = excluded.nextCursor,
                 expiresAtMs = excluded.expiresAtMs",
            params![entry.cache_key, entry.items_json, entry.next_cursor, entry.expires_at_ms],
        )?;
        Ok(())
    }

    /// Returns the cached page only while strictly fresh
    /// (`expiresAtMs > now_ms`).
    pub fn get_page_cache_if_fresh(
        &self,
        cache_key: &str,
        now_ms: i64,
    ) -> Result<Option<PageCacheEntry>> {
        let entry = self
            .conn()
            .query_row(
                "SELECT cacheKey, itemsJson, nextCursor, expiresAtMs
                 FROM vfs_page_cache WHERE cacheKey = ?1 AND expiresAtMs > ?2",
                params![cache_key, now_ms],
                |row| {
                    Ok(PageCacheEntry {
                        cache_key: row.get(0)?,
                        items_json: row.get(1)?,
                        next_cursor: row.get(2)?,
                        expires_at_ms: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn delete_page_cache_by_mount_id(&self, mount_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM vfs_page_cache WHERE cacheKey LIKE ?1",
            params![format!("{mount_id}::%")],
        )?;
        Ok(())
    }

    /// Drops rows whose TTL has elapsed; returns how many went away.
    pub fn purge_expired_page_cache(&self, now_ms: i64) -> Result<usize> {
        let purged = self
            .conn()
            .execute("DELETE FROM vfs_page_cache WHERE expiresAtMs <= ?1", params![now_ms])?;
        Ok(purged)
    }

    /// Registers a listener for committed node changes.
    pub fn subscribe_node_changes(
        &self,
        listener: impl Fn(&[NodeChange]) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe_node_changes(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn notify(&self, changes: &[NodeChange]) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(changes);
            }));
            if outcome.is_err() {
                warn!("node change listener panicked");
            }
        }
    }
}

fn query_node(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Node>> {
    Ok(conn.query_row(sql, params, node_from_row).optional()?)
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let kind: String = row.get(4)?;
    let kind = NodeKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown node kind `{kind}`").into(),
        )
    })?;
    let size: Option<i64> = row.get(5)?;
    Ok(Node {
        node_id: row.get(0)?,
        mount_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        kind,
        size: size.map(|size| size as u64),
        mtime_ms: row.get(6)?,
        source_ref: row.get(7)?,
        provider_version: row.get(8)?,
        deleted_at_ms: row.get(9)?,
        created_at_ms: row.get(10)?,
        updated_at_ms: row.get(11)?,
    })
}

/// Intermediate row shape; `providerExtra` still JSON-encoded.
struct RawMountRow {
    mount_id: String,
    provider_type: String,
    provider_extra: String,
    sync_metadata: bool,
    sync_content: bool,
    metadata_ttl_sec: i64,
    reconcile_interval_ms: i64,
}

fn mount_config_from_row(row: &Row<'_>) -> rusqlite::Result<RawMountRow> {
    Ok(RawMountRow {
        mount_id: row.get(0)?,
        provider_type: row.get(1)?,
        provider_extra: row.get(2)?,
        sync_metadata: row.get(3)?,
        sync_content: row.get(4)?,
        metadata_ttl_sec: row.get(5)?,
        reconcile_interval_ms: row.get(6)?,
    })
}

fn finish_mount_config(raw: RawMountRow) -> Result<MountConfig> {
    Ok(MountConfig {
        provider_extra: serde_json::from_str(&raw.provider_extra)?,
        mount_id: raw.mount_id,
        provider_type: raw.provider_type,
        sync_metadata: raw.sync_metadata,
        sync_content: raw.sync_content,
        metadata_ttl_sec: raw.metadata_ttl_sec as u64,
        reconcile_interval_ms: raw.reconcile_interval_ms as u64,
    })
}
