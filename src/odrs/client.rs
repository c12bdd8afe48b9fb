// src/odrs/client.rs

//! ODRS HTTP client
//!
//! Endpoints, relative to `{server}/1.0/reviews/api`:
//! - `GET /ratings` returns `{app_id: {"star1": n, ..., "star5": n}}` for all apps
//! - `POST /fetch` returns an array of reviews for one app

use super::{RatingHistogram, ReviewBatch, ReviewPage, ReviewSource};
use crate::cancel::cancellable;
use crate::config::{DEFAULT_ODRS_SERVER, StoreConfig};
use crate::entities::Review;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const API_PATH: &str = "1.0/reviews/api";

/// Per-app entry of the ratings download
#[derive(Debug, Default, Deserialize)]
struct RatingsEntry {
    #[serde(default)]
    star1: i64,
    #[serde(default)]
    star2: i64,
    #[serde(default)]
    star3: i64,
    #[serde(default)]
    star4: i64,
    #[serde(default)]
    star5: i64,
}

impl From<RatingsEntry> for RatingHistogram {
    fn from(entry: RatingsEntry) -> Self {
        RatingHistogram([entry.star1, entry.star2, entry.star3, entry.star4, entry.star5])
    }
}

/// A review as sent by the service
#[derive(Debug, Default, Deserialize)]
struct WireReview {
    #[serde(default)]
    review_id: i64,
    #[serde(default)]
    user_display: Option<String>,
    #[serde(default)]
    date_created: Option<f64>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    rating: i64,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    vote_id: Option<i64>,
    #[serde(default)]
    user_skey: Option<String>,
}

impl From<WireReview> for Review {
    fn from(wire: WireReview) -> Self {
        Review {
            author: wire.user_display.unwrap_or_default(),
            date_created: wire
                .date_created
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
            description: wire.description,
            id: wire.review_id,
            rating: wire.rating,
            summary: wire.summary,
            voted: wire.vote_id.is_some(),
        }
    }
}

/// Client for an ODRS server
pub struct OdrsClient {
    client: reqwest::Client,
    server_uri: String,
    user_hash: String,
    locale: String,
    ratings: RwLock<HashMap<String, RatingHistogram>>,
}

impl OdrsClient {
    /// Create a client for the default server
    pub fn new() -> Result<Self> {
        Self::with_options(DEFAULT_ODRS_SERVER, Duration::from_secs(30), None)
    }

    /// Create a client from store configuration
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::with_options(
            &config.odrs_server_uri,
            config.http_timeout(),
            Some(&config.user_agent),
        )
    }

    /// Create with custom options
    pub fn with_options(
        server_uri: &str,
        timeout: Duration,
        user_agent: Option<&str>,
    ) -> Result<Self> {
        url::Url::parse(server_uri)
            .map_err(|e| Error::Config(format!("invalid review server URI {server_uri}: {e}")))?;

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(agent) = user_agent {
            builder = builder.user_agent(agent);
        }
        let client = builder
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            server_uri: server_uri.trim_end_matches('/').to_string(),
            user_hash: default_user_hash(),
            locale: default_locale(),
            ratings: RwLock::new(HashMap::new()),
        })
    }

    /// Override the anonymous reviewer identity
    pub fn with_user_hash(mut self, user_hash: impl Into<String>) -> Self {
        self.user_hash = user_hash.into();
        self
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    pub fn user_hash(&self) -> &str {
        &self.user_hash
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}/{}", self.server_uri, API_PATH, name)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(format!("Failed to fetch {what}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport(format!("Failed to fetch {what}: HTTP {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::protocol(format!("Invalid {what} response: {e}")))
    }
}

#[async_trait]
impl ReviewSource for OdrsClient {
    fn rating_histogram(&self, appstream_id: &str) -> Option<RatingHistogram> {
        self.ratings.read().get(appstream_id).copied()
    }

    async fn update_ratings(&self, cancel: &CancellationToken) -> Result<()> {
        let request = self.client.get(self.endpoint("ratings"));
        let body = cancellable(cancel, self.send(request, "ratings")).await?;
        let entries: HashMap<String, RatingsEntry> = serde_json::from_value(body)
            .map_err(|e| Error::protocol(format!("Invalid ratings response: {e}")))?;

        let ratings: HashMap<String, RatingHistogram> = entries
            .into_iter()
            .map(|(id, entry)| (id, entry.into()))
            .collect();
        info!("Loaded ratings for {} apps", ratings.len());
        *self.ratings.write() = ratings;
        Ok(())
    }

    async fn fetch_reviews(
        &self,
        appstream_id: &str,
        page: &ReviewPage,
        cancel: &CancellationToken,
    ) -> Result<ReviewBatch> {
        let mut body = json!({
            "app_id": appstream_id,
            "user_hash": self.user_hash,
            "locale": self.locale,
            "distro": "Ubuntu",
            "version": "unknown",
            "limit": page.limit,
        });
        if let Some(start) = page.start {
            body["start"] = json!(start);
        }
        if let Some(end) = page.end {
            body["end"] = json!(end);
        }

        debug!("Fetching reviews for {}", appstream_id);
        let request = self.client.post(self.endpoint("fetch")).json(&body);
        let value = cancellable(cancel, self.send(request, "reviews")).await?;
        parse_review_batch(value)
    }

    fn name(&self) -> &str {
        "odrs"
    }
}

/// Turn a fetch response into reviews plus the session key
fn parse_review_batch(value: Value) -> Result<ReviewBatch> {
    if let Some(msg) = value.get("msg").and_then(Value::as_str) {
        return Err(Error::protocol(format!("review service refused request: {msg}")));
    }
    let wire: Vec<WireReview> = serde_json::from_value(value)
        .map_err(|e| Error::protocol(format!("Invalid reviews response: {e}")))?;

    let session_key = wire.iter().find_map(|r| r.user_skey.clone());
    Ok(ReviewBatch {
        reviews: wire.into_iter().map(Review::from).collect(),
        session_key,
    })
}

/// Stable anonymous identity derived from the machine id and user name
fn default_user_hash() -> String {
    let machine_id = std::fs::read_to_string("/etc/machine-id").unwrap_or_default();
    let user = std::env::var("USER").unwrap_or_default();
    let digest = Sha256::digest(format!("snap-store[{}:{}]", machine_id.trim(), user));
    // The service expects a 40 character hash
    hex::encode(digest)[..40].to_string()
}

fn default_locale() -> String {
    std::env::var("LANG")
        .ok()
        .and_then(|lang| lang.split('.').next().map(str::to_string))
        .filter(|lang| !lang.is_empty())
        .unwrap_or_else(|| "C".to_string())
}
