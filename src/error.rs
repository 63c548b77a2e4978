//! Crate-wide error taxonomy.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the service, provider, and syncer boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed mount configuration, such as a missing or empty
    /// required `providerExtra` key.
    #[error("invalid mount configuration: {0}")]
    ConfigInvalid(String),

    /// No factory is registered for the requested provider type.
    #[error("unknown provider type `{0}`")]
    UnknownProviderType(String),

    /// The requested parent node does not exist or is soft-deleted.
    #[error("parent node `{0}` not found")]
    ParentNotFound(String),

    /// A node exists but its mount has no extension row.
    #[error("mount configuration not found for mount `{0}`")]
    MountConfigNotFound(String),

    /// A pagination token failed to decode or carried the wrong mode.
    #[error("malformed cursor: {0}")]
    MalformedCursor(String),

    /// A source ref resolved to a path outside the mount root.
    #[error("source ref `{0}` escapes the mount root")]
    PathEscape(String),

    /// A read range with a zero-byte length.
    #[error("invalid read range: offset {offset}, length {length}")]
    InvalidRange { offset: u64, length: u64 },

    /// A remote source ref outside the permitted file whitelist.
    #[error("source ref `{0}` is not whitelisted")]
    WhitelistViolation(String),

    /// A remote endpoint answered with a non-success status.
    #[error("remote fetch failed with status {status} for {url}")]
    RemoteFetchFailed { status: u16, url: String },

    /// A remote endpoint answered success but delivered no body.
    #[error("remote returned an empty body for `{0}`")]
    EmptyResponseBody(String),

    /// A download stream ended before the advertised size was reached.
    #[error("download of `{source_ref}` ended at {received} of {expected} bytes")]
    IncompleteDownload {
        source_ref: String,
        received: u64,
        expected: u64,
    },

    /// The operation is not implemented by this component or provider.
    #[error("`{0}` is not supported here")]
    Unsupported(&'static str),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialisation: {0}")]
    Json(#[from] serde_json::Error),

    #[error("watch backend: {0}")]
    Watch(#[from] notify::Error),
}
