// src/odrs/mod.rs

//! Review source: the Open Desktop Ratings Service
//!
//! Ratings are a bulk download held in memory by the source, so the
//! histogram lookup is synchronous; reviews are fetched per app and page.

mod client;

pub use client::OdrsClient;

use crate::entities::{Review, STAR_BUCKETS};
use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Star counts for one app, index 0 is one star
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RatingHistogram(pub [i64; STAR_BUCKETS]);

impl RatingHistogram {
    pub fn counts(&self) -> [i64; STAR_BUCKETS] {
        self.0
    }

    pub fn total(&self) -> i64 {
        self.0.iter().sum()
    }
}

/// Paging parameters for a review fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewPage {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: u32,
}

impl ReviewPage {
    /// The first page of at most `limit` reviews
    pub fn first(limit: u32) -> Self {
        Self {
            start: None,
            end: None,
            limit,
        }
    }
}

/// Reviews returned by one fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewBatch {
    pub reviews: Vec<Review>,
    /// Key the caller must present when voting on these reviews
    pub session_key: Option<String>,
}

/// Operations the model needs from the review service
#[async_trait]
pub trait ReviewSource: Send + Sync {
    /// Histogram from the last ratings download; `None` if unknown
    fn rating_histogram(&self, appstream_id: &str) -> Option<RatingHistogram>;

    /// Download the ratings of every app
    async fn update_ratings(&self, cancel: &CancellationToken) -> Result<()>;

    /// Fetch one page of reviews for an app
    async fn fetch_reviews(
        &self,
        appstream_id: &str,
        page: &ReviewPage,
        cancel: &CancellationToken,
    ) -> Result<ReviewBatch>;

    /// Human-readable name for logging
    fn name(&self) -> &str;
}
