// src/lib.rs

//! Snap Store model
//!
//! Model and cache synchronization layer for a snap store front-end. It
//! reconciles the local snap daemon, the Open Desktop Ratings Service and
//! a persistent on-disk cache into one observable view of apps,
//! categories, installed snaps and images.
//!
//! # Architecture
//!
//! - Cache-first: every list is painted from SQLite before any network I/O
//! - Shared entities: one `App` instance per snap name, updated in place
//! - Cooperative cancellation: one token per logical operation, threaded
//!   through every nested request; cancellation is an outcome, not an error
//! - Narrow adapters: the daemon and the review service sit behind traits

pub mod cache;
pub mod cancel;
pub mod config;
pub mod entities;
mod error;
pub mod image;
pub mod model;
pub mod odrs;
pub mod progress;
pub mod registry;
pub mod snapd;

pub use crate::cache::{CacheEntry, CachePayload, CacheStore, Freshness};
pub use crate::cancel::Outcome;
pub use crate::config::StoreConfig;
pub use crate::entities::{App, AppSnapshot, Category, Channel, Media, Review, SharedApp};
pub use crate::error::{Error, Result};
pub use crate::image::{DecodedImage, FetchedImage, ImageMetadata, ImagePipeline, fit_within};
pub use crate::model::{ModelEvent, Operation, RefreshReport, StoreModel};
pub use crate::odrs::{OdrsClient, RatingHistogram, ReviewBatch, ReviewPage, ReviewSource};
pub use crate::progress::{Progress, ProgressSnapshot};
pub use crate::registry::EntityRegistry;
pub use crate::snapd::{FindMode, PackageSource, SnapSummary, SnapdClient};
pub use tokio_util::sync::CancellationToken;
