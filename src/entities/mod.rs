// src/entities/mod.rs

//! In-memory entities of the store: apps, categories and reviews
//!
//! Apps are shared mutable objects: the registry owns one instance per
//! name and everything else (categories, the installed list, callers)
//! holds a clone of the same `Arc`. Categories and reviews are plain data.

mod app;
mod category;
mod review;

pub use app::{App, AppSnapshot, Channel, Media, SharedApp, STAR_BUCKETS};
pub use category::{Category, section_summary, section_title};
pub use review::{Review, ReviewDocument};
