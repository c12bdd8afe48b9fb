// src/registry.rs

//! Entity registry
//!
//! Canonicalizes apps by name: for the lifetime of the registry (or until
//! an explicit [`EntityRegistry::prune`]) every name maps to one shared
//! instance. Each lookup also reapplies cache-derived state (star counts
//! and cached reviews) so repeated lookups see cache updates made by other
//! operations without a remote fetch.

use crate::cache::{CacheStore, namespace};
use crate::entities::{App, AppSnapshot, Review, ReviewDocument, SharedApp};
use crate::odrs::ReviewSource;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identity map of apps
pub struct EntityRegistry {
    apps: RwLock<HashMap<String, SharedApp>>,
    cache: CacheStore,
    reviews: Arc<dyn ReviewSource>,
}

impl EntityRegistry {
    pub fn new(cache: CacheStore, reviews: Arc<dyn ReviewSource>) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            cache,
            reviews,
        }
    }

    /// Return the canonical instance for `name`, creating it if needed
    ///
    /// A new instance is seeded from its cached snapshot. Cache read
    /// failures are logged and leave the affected fields at their defaults.
    pub fn get_or_create(&self, name: &str) -> SharedApp {
        let snapshot = if self.get(name).is_none() {
            log_miss(name, "app", self.cache.lookup_json(namespace::APPS, name))
        } else {
            None
        };
        let reviews = log_miss(name, "reviews", self.cache.lookup_json(namespace::REVIEWS, name));
        self.install(name, snapshot, reviews)
    }

    /// [`get_or_create`](Self::get_or_create) with the cache reads run off
    /// the scheduling thread
    pub async fn get_or_create_async(&self, name: &str) -> SharedApp {
        let snapshot = if self.get(name).is_none() {
            let lookup = self.cache.lookup_json_async(namespace::APPS, name).await;
            log_miss(name, "app", lookup)
        } else {
            None
        };
        let lookup = self.cache.lookup_json_async(namespace::REVIEWS, name).await;
        let reviews = log_miss(name, "reviews", lookup);
        self.install(name, snapshot, reviews)
    }

    /// Look up an app without creating it
    pub fn get(&self, name: &str) -> Option<SharedApp> {
        self.apps.read().get(name).cloned()
    }

    /// All registered apps, in no particular order
    pub fn apps(&self) -> Vec<SharedApp> {
        self.apps.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.apps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.read().is_empty()
    }

    /// Recompute the star buckets of every registered app from the review
    /// source; returns the number of apps updated
    pub fn apply_ratings(&self) -> usize {
        let apps = self.apps();
        for app in &apps {
            self.apply_histogram(app);
        }
        debug!("Applied ratings to {} apps", apps.len());
        apps.len()
    }

    /// Release apps that nothing outside the registry references
    ///
    /// Returns the number of apps released. A later lookup of a released
    /// name creates a fresh instance from the cache.
    pub fn prune(&self) -> usize {
        let mut apps = self.apps.write();
        let before = apps.len();
        apps.retain(|_, app| Arc::strong_count(app) > 1);
        let released = before - apps.len();
        if released > 0 {
            debug!("Pruned {} unreferenced apps", released);
        }
        released
    }

    /// Insert or fetch the instance, then apply the cache-derived state
    ///
    /// The snapshot only seeds an instance created here; another task may
    /// have registered the name while the cache was being read.
    fn install(
        &self,
        name: &str,
        snapshot: Option<AppSnapshot>,
        reviews: Option<Vec<ReviewDocument>>,
    ) -> SharedApp {
        let (app, created) = {
            let mut apps = self.apps.write();
            match apps.get(name) {
                Some(app) => (Arc::clone(app), false),
                None => {
                    let app = App::new(name).into_shared();
                    apps.insert(name.to_string(), Arc::clone(&app));
                    (app, true)
                }
            }
        };

        if created {
            if let Some(snapshot) = &snapshot {
                app.write().apply_snapshot(snapshot);
            }
        }
        self.apply_histogram(&app);
        if let Some(docs) = reviews {
            app.write().reviews = docs.into_iter().map(Review::from).collect();
        }
        app
    }

    /// Set the star buckets of `app` from the review source's histogram
    pub fn apply_histogram(&self, app: &SharedApp) {
        let appstream_id = app.read().appstream_id.clone();
        let counts = appstream_id
            .and_then(|id| self.reviews.rating_histogram(&id))
            .map(|histogram| histogram.counts())
            .unwrap_or_default();
        app.write().set_review_counts(counts);
    }
}

/// A cache read whose failure only costs the cached fields
fn log_miss<T>(name: &str, what: &str, lookup: crate::error::Result<Option<T>>) -> Option<T> {
    lookup.unwrap_or_else(|e| {
        warn!("Failed to load cached {} for {}: {}", what, name, e);
        None
    })
}
