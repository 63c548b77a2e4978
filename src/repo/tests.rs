#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{LocalPageQuery, PageCacheEntry, Repository};
use crate::node::{MountConfig, Node, NodeKind};
use crate::node_id::create_node_id;

fn repo() -> Repository {
    Repository::open_in_memory().unwrap()
}

fn file_node(mount_id: &str, parent_id: Option<&str>, name: &str, source_ref: &str) -> Node {
    Node {
        node_id: create_node_id(mount_id, source_ref),
        mount_id: mount_id.to_owned(),
        parent_id: parent_id.map(str::to_owned),
        name: name.to_owned(),
        kind: NodeKind::File,
        size: Some(16),
        mtime_ms: Some(1_000),
        source_ref: source_ref.to_owned(),
        provider_version: None,
        deleted_at_ms: None,
        created_at_ms: 100,
        updated_at_ms: 100,
    }
}

#[test]
fn upsert_then_get_round_trips() {
    let repo = repo();
    let node = file_node("m1", None, "a.txt", "a.txt");
    repo.upsert_nodes(std::slice::from_ref(&node)).unwrap();

    let fetched = repo.get_node_by_id(&node.node_id).unwrap().unwrap();
    assert_eq!(fetched, node);

    let by_ref = repo.get_node_by_source_ref("m1", "a.txt").unwrap().unwrap();
    assert_eq!(by_ref, node);
}

#[test]
fn upsert_is_idempotent_and_preserves_created_at() {
    let repo = repo();
    let node = file_node("m1", None, "a.txt", "a.txt");
    repo.upsert_nodes(std::slice::from_ref(&node)).unwrap();

    let mut again = node.clone();
    again.created_at_ms = 999;
    again.updated_at_ms = 200;
    again.size = Some(32);
    let changes = repo.upsert_nodes(std::slice::from_ref(&again)).unwrap();

    let fetched = repo.get_node_by_id(&node.node_id).unwrap().unwrap();
    assert_eq!(fetched.created_at_ms, 100);
    assert_eq!(fetched.updated_at_ms, 200);
    assert_eq!(fetched.size, Some(32));
    assert_eq!(changes[0].prev.as_ref().unwrap().size, Some(16));
    assert_eq!(changes[0].next.created_at_ms, 100);
}

#[test]
fn paging_follows_name_then_node_id_order() {
    let repo = repo();
    let parent = "parent";
    let names = ["delta", "alpha", "charlie", "bravo"];
    let nodes: Vec<Node> = names
        .iter()
        .map(|name| file_node("m1", Some(parent), name, &format!("dir/{name}")))
        .collect();
    repo.upsert_nodes(&nodes).unwrap();

    let first = repo
        .list_children_page_local(&LocalPageQuery {
            parent_id: Some(parent.to_owned()),
            limit: 3,
            ..Default::default()
        })
        .unwrap();
    let first_names: Vec<&str> = first.items.iter().map(|node| node.name.as_str()).collect();
    assert_eq!(first_names, ["alpha", "bravo", "charlie"]);
    let boundary = first.next.clone().unwrap();
    assert_eq!(boundary.0, "charlie");

    let second = repo
        .list_children_page_local(&LocalPageQuery {
            parent_id: Some(parent.to_owned()),
            limit: 3,
            after: Some(boundary),
            ..Default::default()
        })
        .unwrap();
    let second_names: Vec<&str> = second.items.iter().map(|node| node.name.as_str()).collect();
    assert_eq!(second_names, ["delta"]);
    assert!(second.next.is_none());
}

#[test]
fn cursor_at_last_row_yields_an_empty_page() {
    let repo = repo();
    let node = file_node("m1", Some("parent"), "only", "dir/only");
    repo.upsert_nodes(std::slice::from_ref(&node)).unwrap();

    let page = repo
        .list_children_page_local(&LocalPageQuery {
            parent_id: Some("parent".to_owned()),
            limit: 5,
            after: Some(("only".to_owned(), node.node_id.clone())),
            ..Default::default()
        })
        .unwrap();
    assert!(page.items.is_empty());
    assert!(page.next.is_none());
}

#[test]
fn next_boundary_requires_a_live_row_beyond_the_page() {
    let repo = repo();
    let nodes = [
        file_node("m1", Some("parent"), "a", "dir/a"),
        file_node("m1", Some("parent"), "b", "dir/b"),
    ];
    repo.upsert_nodes(&nodes).unwrap();

    let exact = repo
        .list_children_page_local(&LocalPageQuery {
            parent_id: Some("parent".to_owned()),
            limit: 2,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(exact.items.len(), 2);
    assert!(exact.next.is_none());
}

#[test]
fn soft_deleted_rows_are_filtered_from_pages() {
    let repo = repo();
    let mut dead = file_node("m1", Some("parent"), "dead", "dir/dead");
    dead.deleted_at_ms = Some(500);
    let live = file_node("m1", Some("parent"), "live", "dir/live");
    repo.upsert_nodes(&[dead, live]).unwrap();

    let page = repo
        .list_children_page_local(&LocalPageQuery {
            parent_id: Some("parent".to_owned()),
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].name, "live");
}

#[test]
fn mount_ext_round_trips() {
    let repo = repo();
    let mut extra = BTreeMap::new();
    extra.insert("directory".to_owned(), "/srv/data".to_owned());
    let config = MountConfig {
        mount_id: "m1".to_owned(),
        provider_type: "local".to_owned(),
        provider_extra: extra,
        sync_metadata: true,
        sync_content: false,
        metadata_ttl_sec: 60,
        reconcile_interval_ms: 1_000,
    };
    let mut root = file_node("m1", None, "m1", "");
    root.kind = NodeKind::Mount;
    root.size = None;

    repo.insert_mount(&root, &config).unwrap();

    let fetched = repo.get_mount_by_mount_id("m1").unwrap().unwrap();
    assert_eq!(fetched, config);
    assert_eq!(repo.list_mounts().unwrap(), vec![config]);

    repo.delete_mount("m1").unwrap();
    assert!(repo.get_mount_by_mount_id("m1").unwrap().is_none());
    // The root node outlives the extension row.
    assert!(repo.get_node_by_id(&root.node_id).unwrap().is_some());
}

#[test]
fn page_cache_freshness_is_strict() {
    let repo = repo();
    let entry = PageCacheEntry {
        cache_key: "m1::root::::10".to_owned(),
        items_json: "[]".to_owned(),
        next_cursor: Some("3".to_owned()),
        expires_at_ms: 1_000,
    };
    repo.upsert_page_cache(&entry).unwrap();

    assert_eq!(repo.get_page_cache_if_fresh(&entry.cache_key, 999).unwrap(), Some(entry.clone()));
    assert_eq!(repo.get_page_cache_if_fresh(&entry.cache_key, 1_000).unwrap(), None);
}

#[test]
fn page_cache_rows_are_scoped_by_mount_prefix() {
    let repo = repo();
    for (key, expiry) in [("m1::a::::5", 10_000), ("m1::b::::5", 1), ("m2::a::::5", 10_000)] {
        repo.upsert_page_cache(&PageCacheEntry {
            cache_key: key.to_owned(),
            items_json: "[]".to_owned(),
            next_cursor: None,
            expires_at_ms: expiry,
        })
        .unwrap();
    }

    assert_eq!(repo.purge_expired_page_cache(500).unwrap(), 1);
    repo.delete_page_cache_by_mount_id("m1").unwrap();
    assert!(repo.get_page_cache_if_fresh("m1::a::::5", 0).unwrap().is_none());
    assert!(repo.get_page_cache_if_fresh("m2::a::::5", 0).unwrap().is_some());
}

#[test]
fn listeners_observe_committed_changes() {
    let repo = repo();
    let seen: Arc<Mutex<Vec<(Option<u64>, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let id = repo.subscribe_node_changes(move |changes| {
        let mut seen = sink.lock().unwrap();
        for change in changes {
            seen.push((
                change.prev.as_ref().and_then(|node| node.size),
                change.next.size.unwrap_or(0),
            ));
        }
    });

    let mut node = file_node("m1", None, "a.txt", "a.txt");
    repo.upsert_nodes(std::slice::from_ref(&node)).unwrap();
    node.size = Some(64);
    repo.upsert_nodes(std::slice::from_ref(&node)).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(None, 16), (Some(16), 64)]);

    repo.unsubscribe_node_changes(id);
    repo.upsert_nodes(std::slice::from_ref(&node)).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn panicking_listener_does_not_silence_the_rest() {
    let repo = repo();
    repo.subscribe_node_changes(|_| panic!("listener bug"));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    repo.subscribe_node_changes(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let node = file_node("m1", None, "a.txt", "a.txt");
    repo.upsert_nodes(std::slice::from_ref(&node)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
