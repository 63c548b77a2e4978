//! Polymount - a virtual filesystem service that unifies heterogeneous
//! content sources behind a single pageable, cacheable namespace.
//!
//! Each source is attached as a mount; its entries are persisted as
//! nodes in an embedded database and optionally mirrored to local
//! content storage by the [`syncer::Syncer`].

pub mod config;
pub mod cursor;
pub mod error;
pub mod node;
pub mod node_id;
pub mod provider;
pub mod repo;
pub mod service;
pub mod syncer;

pub use error::{Error, Result};
pub use node::{MountConfig, MountSpec, Node, NodeKind};
pub use repo::Repository;
pub use service::VfsService;
