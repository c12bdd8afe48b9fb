// src/entities/app.rs

//! Application entity
//!
//! Identity is the snap name (case-sensitive). Fields are updated in place
//! on the shared instance so every holder sees the new values without a
//! re-lookup; each write is a short critical section, so concurrent
//! updates from different operations resolve last-write-wins per field.

use crate::entities::Review;
use crate::progress::Progress;
use crate::snapd::{SnapMedia, SnapSummary};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of star buckets (1 to 5 stars)
pub const STAR_BUCKETS: usize = 5;

/// Shared handle to the canonical instance of an app
pub type SharedApp = Arc<RwLock<App>>;

/// A channel an app can be installed from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Channel {
    /// Full channel name, e.g. `latest/stable`
    pub name: String,
    pub version: Option<String>,
    pub revision: Option<String>,
    pub confinement: Option<String>,
    pub size: Option<i64>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Channel {
    /// Sort key: track name, then risk from most to least stable
    fn order_key(&self) -> (&str, u8) {
        let (track, risk) = self.name.split_once('/').unwrap_or(("latest", self.name.as_str()));
        let rank = match risk.split('/').next().unwrap_or(risk) {
            "stable" => 0,
            "candidate" => 1,
            "beta" => 2,
            "edge" => 3,
            _ => 4,
        };
        (track, rank)
    }
}

/// A remote image reference
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl From<&SnapMedia> for Media {
    fn from(media: &SnapMedia) -> Self {
        Self {
            url: media.url.clone(),
            width: media.width,
            height: media.height,
        }
    }
}

/// Application known to the store
#[derive(Debug, Clone, Default)]
pub struct App {
    pub name: String,
    pub appstream_id: Option<String>,
    pub title: String,
    pub summary: String,
    pub description: String,
    pub license: Option<String>,
    pub publisher: Option<String>,
    pub publisher_validated: bool,
    pub contact: Option<String>,
    pub version: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub installed: bool,
    pub installed_size: i64,
    pub channels: Vec<Channel>,
    pub icon: Option<Media>,
    pub banner: Option<Media>,
    pub screenshots: Vec<Media>,
    pub reviews: Vec<Review>,
    review_counts: [i64; STAR_BUCKETS],
    progress: Option<Arc<Progress>>,
}

impl App {
    /// Create an app with only its name set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Wrap into a shared handle
    pub fn into_shared(self) -> SharedApp {
        Arc::new(RwLock::new(self))
    }

    /// Star bucket counts, index 0 is one star
    pub fn review_counts(&self) -> [i64; STAR_BUCKETS] {
        self.review_counts
    }

    /// Replace all five star buckets; negative counts are clamped to zero
    pub fn set_review_counts(&mut self, counts: [i64; STAR_BUCKETS]) {
        self.review_counts = counts.map(|c| c.max(0));
    }

    /// Total number of ratings, always the sum of the star buckets
    pub fn review_count(&self) -> i64 {
        self.review_counts.iter().sum()
    }

    /// Mean star rating in `1.0..=5.0`, `None` when there are no ratings
    pub fn review_average(&self) -> Option<f64> {
        let count = self.review_count();
        if count == 0 {
            return None;
        }
        let weighted: i64 = self
            .review_counts
            .iter()
            .enumerate()
            .map(|(i, c)| (i as i64 + 1) * c)
            .sum();
        Some(weighted as f64 / count as f64)
    }

    /// Progress of the in-flight operation, if any
    pub fn progress(&self) -> Option<Arc<Progress>> {
        self.progress.clone()
    }

    /// True while an install/remove is running for this app
    pub fn is_busy(&self) -> bool {
        self.progress.is_some()
    }

    pub(crate) fn attach_progress(&mut self, progress: Arc<Progress>) {
        self.progress = Some(progress);
    }

    pub(crate) fn clear_progress(&mut self) {
        self.progress = None;
    }

    /// Merge a live result from the package daemon
    ///
    /// Fields the result does not carry keep their previous value, except
    /// media and channels which are replaced wholesale.
    pub fn update_from_snap(&mut self, snap: &SnapSummary) {
        if let Some(id) = snap.common_ids.first() {
            self.appstream_id = Some(id.clone());
        }
        if let Some(title) = snap.title.as_deref().filter(|t| !t.is_empty()) {
            self.title = title.to_string();
        } else if self.title.is_empty() {
            self.title = snap.name.clone();
        }
        if let Some(summary) = &snap.summary {
            self.summary = summary.clone();
        }
        if let Some(description) = &snap.description {
            self.description = description.clone();
        }
        if snap.license.is_some() {
            self.license = snap.license.clone();
        }
        if let Some(publisher) = &snap.publisher {
            self.publisher = Some(publisher.display_name().to_string());
            self.publisher_validated = publisher.is_validated();
        }
        if snap.contact.is_some() {
            self.contact = snap.contact.clone();
        }
        if snap.version.is_some() {
            self.version = snap.version.clone();
        }
        if let Some(size) = snap.installed_size {
            self.installed_size = size;
        }
        if let Some(updated) = snap.updated() {
            self.updated = Some(updated);
        }

        let mut channels: Vec<Channel> = snap
            .channels
            .iter()
            .map(|(name, info)| Channel {
                name: name.clone(),
                version: info.version.clone(),
                revision: info.revision.clone(),
                confinement: info.confinement.clone(),
                size: info.size,
                released_at: info.released_at,
            })
            .collect();
        channels.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        self.channels = channels;

        let icon = snap
            .media_of_kind("icon")
            .next()
            .map(Media::from)
            .or_else(|| {
                snap.icon.as_ref().filter(|u| !u.is_empty()).map(|url| Media {
                    url: url.clone(),
                    ..Default::default()
                })
            });
        self.icon = icon;
        self.banner = snap.media_of_kind("banner").next().map(Media::from);
        self.screenshots = snap.media_of_kind("screenshot").map(Media::from).collect();
    }

    /// Serializable snapshot of the persisted fields
    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            appstream_id: self.appstream_id.clone(),
            title: self.title.clone(),
            summary: self.summary.clone(),
            description: self.description.clone(),
            license: self.license.clone(),
            publisher: self.publisher.clone(),
            publisher_validated: self.publisher_validated,
            contact: self.contact.clone(),
            version: self.version.clone(),
            updated: self.updated,
            installed_size: self.installed_size,
            channels: self.channels.clone(),
            icon: self.icon.clone(),
            banner: self.banner.clone(),
            screenshots: self.screenshots.clone(),
        }
    }

    /// Restore persisted fields from a snapshot
    ///
    /// Installed state, reviews, ratings and progress are not part of the
    /// snapshot and are left alone.
    pub fn apply_snapshot(&mut self, snapshot: &AppSnapshot) {
        self.appstream_id = snapshot.appstream_id.clone();
        self.title = snapshot.title.clone();
        self.summary = snapshot.summary.clone();
        self.description = snapshot.description.clone();
        self.license = snapshot.license.clone();
        self.publisher = snapshot.publisher.clone();
        self.publisher_validated = snapshot.publisher_validated;
        self.contact = snapshot.contact.clone();
        self.version = snapshot.version.clone();
        self.updated = snapshot.updated;
        self.installed_size = snapshot.installed_size;
        self.channels = snapshot.channels.clone();
        self.icon = snapshot.icon.clone();
        self.banner = snapshot.banner.clone();
        self.screenshots = snapshot.screenshots.clone();
    }
}

/// Persisted form of an app, stored under `("apps", name)`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppSnapshot {
    pub appstream_id: Option<String>,
    pub title: String,
    pub summary: String,
    pub description: String,
    pub license: Option<String>,
    pub publisher: Option<String>,
    pub publisher_validated: bool,
    pub contact: Option<String>,
    pub version: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub installed_size: i64,
    pub channels: Vec<Channel>,
    pub icon: Option<Media>,
    pub banner: Option<Media>,
    pub screenshots: Vec<Media>,
}
