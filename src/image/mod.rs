// src/image/mod.rs

//! Remote image pipeline
//!
//! Fetches an image by URI, decodes it, scales it to fit a bounding box
//! and writes the bytes and a metadata record back to the cache:
//!
//! - `("images", uri)` holds the raw bytes, with the freshness sidecar
//! - `("image-metadata", uri)` holds `{uri, width, height, etag?, max-age?}`
//!   where width and height are the original, unscaled dimensions
//!
//! Concurrent fetches of one URI with the same conditional ETag share a
//! single download and a single cache write. A cancelled or failed fetch writes nothing.

use crate::cache::{CachePayload, CacheStore, Freshness, RequestCoalescer, namespace};
use crate::cancel::{cancellable, check};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use reqwest::StatusCode;
use reqwest::header::{CACHE_CONTROL, ETAG, HeaderName, IF_NONE_MATCH};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A decoded, possibly scaled, image
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    /// Width before scaling
    pub original_width: u32,
    /// Height before scaling
    pub original_height: u32,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Result of a network fetch
#[derive(Debug, Clone)]
pub enum FetchedImage {
    /// New content was downloaded and decoded
    Fresh(Arc<DecodedImage>),
    /// The server confirmed the cached copy is current; nothing was decoded
    NotModified,
}

/// Cached metadata of a fetched image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageMetadata {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
    /// When the record was written; filled in from the cache entry
    #[serde(skip)]
    pub stored_at: Option<DateTime<Utc>>,
}

impl ImageMetadata {
    /// True while the server-granted max-age has not elapsed
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let (Some(stored_at), Some(max_age)) = (self.stored_at, self.max_age) else {
            return false;
        };
        i64::try_from(max_age)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|age| stored_at.checked_add_signed(age))
            .is_some_and(|expires| now < expires)
    }
}

/// Outcome of one download shared between coalesced callers
#[derive(Debug, Clone)]
enum Download {
    NotModified,
    Fetched {
        bytes: Arc<[u8]>,
        decoded: Arc<DecodedImage>,
        bounds: (u32, u32),
    },
}

/// Fetches, scales and caches remote images
pub struct ImagePipeline {
    client: reqwest::Client,
    cache: CacheStore,
    inflight: RequestCoalescer<Download>,
}

impl ImagePipeline {
    pub fn new(client: reqwest::Client, cache: CacheStore) -> Self {
        Self {
            client,
            cache,
            inflight: RequestCoalescer::new(),
        }
    }

    /// Create a pipeline with an HTTP client built from configuration
    pub fn from_config(config: &StoreConfig, cache: CacheStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::new(client, cache))
    }

    /// Number of fetches that shared another caller's download
    pub fn coalesced_count(&self) -> u64 {
        self.inflight.coalesced_count()
    }

    /// Fetch `uri` and scale it to fit `bound_width` x `bound_height`
    ///
    /// A zero bound disables scaling. When `etag` is given and the URI is
    /// already cached, the request is conditional and a 304 answer yields
    /// [`FetchedImage::NotModified`].
    pub async fn fetch(
        &self,
        uri: &str,
        etag: Option<&str>,
        bound_width: u32,
        bound_height: u32,
        cancel: &CancellationToken,
    ) -> Result<FetchedImage> {
        check(cancel)?;
        let conditional = match etag {
            Some(etag) => self
                .cache
                .lookup_async(namespace::IMAGES, uri, false)
                .await?
                .map(|_| etag.to_string()),
            None => None,
        };

        // Conditional and unconditional requests never share a download
        let key = format!("{uri}\0{}", conditional.as_deref().unwrap_or_default());
        let bounds = (bound_width, bound_height);
        let download = self
            .inflight
            .coalesce(&key, cancel, || self.download(uri, conditional, bounds, cancel))
            .await?;

        match download {
            Download::NotModified => Ok(FetchedImage::NotModified),
            Download::Fetched {
                decoded,
                bounds: fetched_bounds,
                ..
            } if fetched_bounds == bounds => Ok(FetchedImage::Fresh(decoded)),
            Download::Fetched { bytes, .. } => {
                check(cancel)?;
                let decoded = decode_blocking(bytes, bound_width, bound_height).await?;
                check(cancel)?;
                Ok(FetchedImage::Fresh(decoded))
            }
        }
    }

    /// Decode the cached bytes of `uri` without touching the network
    pub async fn lookup_cached_only(
        &self,
        uri: &str,
        bound_width: u32,
        bound_height: u32,
    ) -> Result<Option<Arc<DecodedImage>>> {
        let Some(entry) = self.cache.lookup_async(namespace::IMAGES, uri, false).await? else {
            return Ok(None);
        };
        let bytes: Arc<[u8]> = match entry.payload {
            CachePayload::Blob(bytes) => bytes.into(),
            CachePayload::Document(_) => {
                return Err(Error::Decode(format!("cached image {uri} is not a blob")));
            }
        };
        decode_blocking(bytes, bound_width, bound_height).await.map(Some)
    }

    /// Metadata recorded by the last successful fetch of `uri`
    pub fn cached_metadata(&self, uri: &str) -> Result<Option<ImageMetadata>> {
        let Some(entry) = self.cache.lookup(namespace::IMAGE_METADATA, uri, false)? else {
            return Ok(None);
        };
        let stored_at = entry.stored_at;
        let Some(document) = entry.payload.as_document() else {
            return Err(Error::protocol(format!("image metadata for {uri} is not a document")));
        };
        let mut metadata: ImageMetadata = serde_json::from_value(document.clone())?;
        metadata.stored_at = Some(stored_at);
        Ok(Some(metadata))
    }

    async fn download(
        &self,
        uri: &str,
        etag: Option<String>,
        bounds: (u32, u32),
        cancel: &CancellationToken,
    ) -> Result<Download> {
        let mut request = self.client.get(uri);
        if let Some(etag) = &etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }

        let mut response = cancellable(cancel, async {
            request
                .send()
                .await
                .map_err(|e| Error::transport(format!("Failed to fetch {uri}: {e}")))
        })
        .await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!("{} not modified", uri);
            return Ok(Download::NotModified);
        }
        if !status.is_success() {
            return Err(Error::transport(format!("Failed to fetch {uri}: HTTP {status}")));
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let max_age = header(CACHE_CONTROL).as_deref().and_then(parse_max_age);

        // Read until end of stream; the length is not known up front
        let mut body = Vec::new();
        while let Some(chunk) = cancellable(cancel, async {
            response
                .chunk()
                .await
                .map_err(|e| Error::transport(format!("Failed to read {uri}: {e}")))
        })
        .await?
        {
            body.extend_from_slice(&chunk);
        }
        debug!("Fetched {} ({} bytes)", uri, body.len());

        let bytes: Arc<[u8]> = body.into();
        let decoded = decode_blocking(Arc::clone(&bytes), bounds.0, bounds.1).await?;

        check(cancel)?;
        let metadata = ImageMetadata {
            uri: uri.to_string(),
            width: decoded.original_width,
            height: decoded.original_height,
            etag: etag.clone(),
            max_age,
            stored_at: None,
        };
        let freshness = Freshness {
            etag,
            max_age,
            width: Some(decoded.original_width),
            height: Some(decoded.original_height),
        };
        self.cache
            .insert_json_async(namespace::IMAGE_METADATA, uri, &metadata, None)
            .await?;
        self.cache
            .insert_async(
                namespace::IMAGES,
                uri,
                CachePayload::Blob(bytes.to_vec()),
                Some(freshness),
            )
            .await?;

        Ok(Download::Fetched {
            bytes,
            decoded,
            bounds,
        })
    }
}

/// Size of `width` x `height` scaled to fit inside the bounding box,
/// preserving the aspect ratio
///
/// The constraining side is picked by comparing `width * bound_height`
/// with `height * bound_width`. Zero inputs leave the size unchanged.
pub fn fit_within(width: u32, height: u32, bound_width: u32, bound_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || bound_width == 0 || bound_height == 0 {
        return (width, height);
    }
    let (w, h) = (u64::from(width), u64::from(height));
    let (bw, bh) = (u64::from(bound_width), u64::from(bound_height));

    if w * bh > h * bw {
        let scaled = (h * bw / w).max(1);
        (bound_width, u32::try_from(scaled).unwrap_or(u32::MAX))
    } else {
        let scaled = (w * bh / h).max(1);
        (u32::try_from(scaled).unwrap_or(u32::MAX), bound_height)
    }
}

/// Extract `max-age` seconds from a Cache-Control header value
pub fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().trim_matches('"').parse().ok()
        } else {
            None
        }
    })
}

/// Decode `bytes`, scaling to fit the bounds when both are non-zero
///
/// The original size is read from the image header before the pixel data
/// is decoded, so the target size is known up front.
pub fn decode_scaled(bytes: &[u8], bound_width: u32, bound_height: u32) -> Result<DecodedImage> {
    let decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| Error::Decode(e.to_string()))?
        .into_decoder()
        .map_err(|e| Error::Decode(e.to_string()))?;

    let (original_width, original_height) = decoder.dimensions();
    let image = DynamicImage::from_decoder(decoder).map_err(|e| Error::Decode(e.to_string()))?;

    let (width, height) = fit_within(original_width, original_height, bound_width, bound_height);
    let image = if (width, height) == (original_width, original_height) {
        image
    } else {
        image.resize_exact(width, height, FilterType::Triangle)
    };

    Ok(DecodedImage {
        image,
        original_width,
        original_height,
    })
}

async fn decode_blocking(
    bytes: Arc<[u8]>,
    bound_width: u32,
    bound_height: u32,
) -> Result<Arc<DecodedImage>> {
    tokio::task::spawn_blocking(move || decode_scaled(&bytes, bound_width, bound_height))
        .await
        .map_err(|e| Error::Decode(format!("decode task failed: {e}")))?
        .map(Arc::new)
}
