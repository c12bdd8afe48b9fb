// src/snapd/mod.rs

//! Package source: the local snap daemon
//!
//! The model talks to the daemon only through [`PackageSource`], so tests
//! can substitute an in-process fake. [`SnapdClient`] is the real
//! implementation over the daemon's Unix socket.

mod client;

pub use client::SnapdClient;

use crate::error::Result;
use crate::progress::Progress;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// How a search query is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    /// Free-text search over names, titles and descriptions
    Text,
    /// Exact snap name
    Name,
}

/// Operations the model needs from the package daemon
///
/// Every call receives the cancellation token of the logical operation it
/// belongs to and returns `Error::Cancelled` once that token fires.
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Names of the store sections, in presentation order
    async fn list_sections(&self, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// Snaps in a section
    async fn find_section(
        &self,
        section: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapSummary>>;

    /// Search the store
    async fn find(
        &self,
        query: &str,
        mode: FindMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapSummary>>;

    /// Snaps installed on this system
    async fn list_installed(&self, cancel: &CancellationToken) -> Result<Vec<SnapSummary>>;

    /// Install a snap, reporting progress as the daemon works
    async fn install(
        &self,
        name: &str,
        channel: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Remove a snap, reporting progress as the daemon works
    async fn remove(
        &self,
        name: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Human-readable name for logging
    fn name(&self) -> &str;
}

/// A snap as described by the daemon
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SnapSummary {
    pub name: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    /// Legacy icon URL, superseded by an `icon` media entry
    pub icon: Option<String>,
    pub media: Vec<SnapMedia>,
    pub channels: BTreeMap<String, SnapChannel>,
    pub installed_size: Option<i64>,
    pub download_size: Option<i64>,
    pub version: Option<String>,
    pub revision: Option<String>,
    pub publisher: Option<SnapPublisher>,
    pub license: Option<String>,
    pub contact: Option<String>,
    pub common_ids: Vec<String>,
    /// Channel the installed snap tracks
    pub tracking_channel: Option<String>,
    pub install_date: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

impl SnapSummary {
    /// An otherwise empty summary for `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Media entries of one kind (`icon`, `banner`, `screenshot`), in order
    pub fn media_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a SnapMedia> + 'a {
        self.media.iter().filter(move |m| m.kind == kind)
    }

    /// Best known update time: release of the tracked channel, then of
    /// `latest/stable`, then the local install date
    pub fn updated(&self) -> Option<DateTime<Utc>> {
        let released = |name: &str| self.channels.get(name).and_then(|c| c.released_at);
        self.tracking_channel
            .as_deref()
            .and_then(released)
            .or_else(|| released("latest/stable"))
            .or(self.install_date)
    }
}

/// Image attached to a snap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapMedia {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl SnapMedia {
    pub fn new(kind: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            url: url.into(),
            width: None,
            height: None,
        }
    }
}

/// A channel entry in a find result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SnapChannel {
    pub revision: Option<String>,
    pub version: Option<String>,
    pub channel: Option<String>,
    pub confinement: Option<String>,
    pub size: Option<i64>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Publisher account of a snap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SnapPublisher {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub validation: Option<String>,
}

impl SnapPublisher {
    /// Display name, falling back to the account name
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.username)
    }

    /// True for publishers the store has verified
    pub fn is_validated(&self) -> bool {
        matches!(self.validation.as_deref(), Some("verified") | Some("starred"))
    }
}
