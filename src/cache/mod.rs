// src/cache/mod.rs

//! Persistent cache store
//!
//! Namespaced key/value storage on SQLite. Each entry holds either an
//! opaque byte blob (image data) or a JSON document (section lists,
//! reviews, app snapshots, image metadata), plus an optional freshness
//! sidecar (ETag, max-age, recorded image size).
//!
//! A miss is `Ok(None)`. Writes are committed before the call returns.
//! The store never expires anything on its own; callers judge staleness
//! from the freshness descriptor. Concurrent writers to the same key race
//! and the last write wins.

pub mod coalesce;
pub mod schema;

use crate::error::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub use coalesce::RequestCoalescer;

/// Well-known cache namespaces
pub mod namespace {
    /// Section index and per-section app name lists
    pub const SECTIONS: &str = "sections";
    /// Cached review pages, keyed by app name
    pub const REVIEWS: &str = "reviews";
    /// Raw image bytes, keyed by URI
    pub const IMAGES: &str = "images";
    /// Image metadata documents, keyed by URI
    pub const IMAGE_METADATA: &str = "image-metadata";
    /// App snapshots, keyed by app name
    pub const APPS: &str = "apps";
    /// Names of the installed apps under [`INSTALLED_KEY`]
    pub const INSTALLED: &str = "installed";

    /// Key of the section index inside [`SECTIONS`]
    pub const SECTION_INDEX_KEY: &str = "_index";
    /// Key of the installed list inside [`INSTALLED`]
    pub const INSTALLED_KEY: &str = "_index";
}

/// Stored value of a cache entry
#[derive(Debug, Clone, PartialEq)]
pub enum CachePayload {
    /// Opaque bytes
    Blob(Vec<u8>),
    /// Structured document
    Document(serde_json::Value),
}

impl CachePayload {
    fn kind(&self) -> &'static str {
        match self {
            CachePayload::Blob(_) => "blob",
            CachePayload::Document(_) => "json",
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            CachePayload::Blob(data) => Ok(data.clone()),
            CachePayload::Document(value) => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Borrow the bytes of a blob payload
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            CachePayload::Blob(data) => Some(data),
            CachePayload::Document(_) => None,
        }
    }

    /// Borrow the document of a JSON payload
    pub fn as_document(&self) -> Option<&serde_json::Value> {
        match self {
            CachePayload::Document(value) => Some(value),
            CachePayload::Blob(_) => None,
        }
    }
}

/// Freshness sidecar of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Freshness {
    /// Entity tag of the remote resource
    pub etag: Option<String>,
    /// Seconds the resource may be reused without revalidation
    pub max_age: Option<u64>,
    /// Recorded width (images only)
    pub width: Option<u32>,
    /// Recorded height (images only)
    pub height: Option<u32>,
}

impl Freshness {
    fn is_empty(&self) -> bool {
        self.etag.is_none()
            && self.max_age.is_none()
            && self.width.is_none()
            && self.height.is_none()
    }
}

/// A cache hit
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: CachePayload,
    /// Present only when requested and recorded
    pub freshness: Option<Freshness>,
    /// When the entry was last written
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry is still within its max-age at `now`
    ///
    /// Entries without freshness information are never considered fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.freshness.as_ref().and_then(|f| f.max_age) {
            Some(max_age) => i64::try_from(max_age)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .and_then(|age| self.stored_at.checked_add_signed(age))
                .is_none_or(|expiry| expiry > now),
            None => false,
        }
    }
}

/// SQLite-backed cache shared by every operation of the model
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Open (or create) the cache database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        schema::migrate(&conn)?;

        debug!("Opened cache at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a cache that lives only as long as this store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Look up an entry
    ///
    /// With `want_freshness`, the freshness sidecar is returned when one
    /// was recorded, whatever the payload kind.
    pub fn lookup(
        &self,
        namespace: &str,
        key: &str,
        want_freshness: bool,
    ) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT kind, payload, etag, max_age, width, height, stored_at
                 FROM cache_entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        let Some((kind, bytes, etag, max_age, width, height, stored_at)) = row else {
            return Ok(None);
        };

        let payload = match kind.as_str() {
            "json" => CachePayload::Document(serde_json::from_slice(&bytes)?),
            _ => CachePayload::Blob(bytes),
        };

        let freshness = Freshness {
            etag,
            max_age: max_age.and_then(|v| u64::try_from(v).ok()),
            width: width.and_then(|v| u32::try_from(v).ok()),
            height: height.and_then(|v| u32::try_from(v).ok()),
        };
        let freshness = (want_freshness && !freshness.is_empty()).then_some(freshness);

        Ok(Some(CacheEntry {
            payload,
            freshness,
            stored_at: DateTime::from_timestamp(stored_at, 0).unwrap_or_default(),
        }))
    }

    /// Insert or replace an entry
    pub fn insert(
        &self,
        namespace: &str,
        key: &str,
        payload: &CachePayload,
        freshness: Option<&Freshness>,
    ) -> Result<()> {
        let bytes = payload.to_bytes()?;
        let freshness = freshness.cloned().unwrap_or_default();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cache_entries
                (namespace, key, kind, payload, etag, max_age, width, height, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(namespace, key) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                etag = excluded.etag,
                max_age = excluded.max_age,
                width = excluded.width,
                height = excluded.height,
                stored_at = excluded.stored_at",
            params![
                namespace,
                key,
                payload.kind(),
                bytes,
                freshness.etag,
                freshness.max_age.map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
                freshness.width.map(i64::from),
                freshness.height.map(i64::from),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Remove an entry; removing a missing key is not an error
    pub fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(())
    }

    /// List the keys stored in a namespace
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM cache_entries WHERE namespace = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map([namespace], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Look up a JSON document and deserialize it
    pub fn lookup_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>> {
        match self.lookup(namespace, key, false)? {
            Some(entry) => Ok(Some(decode_document(entry.payload)?)),
            None => Ok(None),
        }
    }

    /// Serialize a value and store it as a JSON document
    pub fn insert_json<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        freshness: Option<&Freshness>,
    ) -> Result<()> {
        let document = serde_json::to_value(value)?;
        self.insert(namespace, key, &CachePayload::Document(document), freshness)
    }

    /// Asynchronous [`lookup`](Self::lookup), run off the scheduling thread
    pub async fn lookup_async(
        &self,
        namespace: &str,
        key: &str,
        want_freshness: bool,
    ) -> Result<Option<CacheEntry>> {
        let store = self.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.lookup(&namespace, &key, want_freshness))
            .await
            .map_err(join_error)?
    }

    /// Asynchronous [`insert`](Self::insert); durable when the future resolves
    pub async fn insert_async(
        &self,
        namespace: &str,
        key: &str,
        payload: CachePayload,
        freshness: Option<Freshness>,
    ) -> Result<()> {
        let store = self.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            store.insert(&namespace, &key, &payload, freshness.as_ref())
        })
        .await
        .map_err(join_error)?
    }

    /// Asynchronous [`lookup_json`](Self::lookup_json)
    pub async fn lookup_json_async<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>> {
        match self.lookup_async(namespace, key, false).await? {
            Some(entry) => Ok(Some(decode_document(entry.payload)?)),
            None => Ok(None),
        }
    }

    /// Asynchronous [`insert_json`](Self::insert_json)
    pub async fn insert_json_async<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        freshness: Option<Freshness>,
    ) -> Result<()> {
        let document = serde_json::to_value(value)?;
        self.insert_async(namespace, key, CachePayload::Document(document), freshness)
            .await
    }
}

fn decode_document<T: DeserializeOwned>(payload: CachePayload) -> Result<T> {
    match payload {
        CachePayload::Document(value) => Ok(serde_json::from_value(value)?),
        CachePayload::Blob(bytes) => Ok(serde_json::from_slice(&bytes)?),
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(format!("cache task failed: {e}")))
}
