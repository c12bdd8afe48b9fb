// src/model/mod.rs

//! Store model: reconciles the package daemon, the review service and the
//! persistent cache into one observable view
//!
//! Reads are served from the cache first ([`StoreModel::load_from_cache`])
//! and then refreshed from the live sources. Live results are merged into
//! the shared app instances held by the [`EntityRegistry`] and written back
//! to the cache. Every asynchronous operation takes the caller's
//! cancellation token, passes it to each nested request and returns
//! [`Outcome::Cancelled`] instead of an error once it fires. The token is
//! last checked before live results are swapped in: an operation cancelled
//! earlier leaves memory and cache untouched, and one that got past that
//! point finishes its cache writes and completes.
//!
//! Install and remove follow
//! `Idle -> InProgress -> Succeeded | Failed | Cancelled`: a [`Progress`] is
//! attached to the app for exactly as long as the operation runs and is
//! cleared before the result is reported.

mod events;

pub use events::{ModelEvent, Operation};

use crate::cache::{CacheStore, namespace};
use crate::cancel::{Outcome, check, settle};
use crate::config::StoreConfig;
use crate::entities::{Category, ReviewDocument, SharedApp};
use crate::error::{Error, Result};
use crate::image::{DecodedImage, FetchedImage, ImageMetadata, ImagePipeline};
use crate::odrs::{OdrsClient, ReviewPage, ReviewSource};
use crate::progress::Progress;
use crate::registry::EntityRegistry;
use crate::snapd::{FindMode, PackageSource, SnapSummary, SnapdClient};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 64;

/// Summary of a category refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Sections listed by the daemon
    pub sections: Vec<String>,
    /// Sections whose fetch failed; they keep their previous contents
    pub failed: Vec<String>,
}

/// The store model
pub struct StoreModel {
    cache: CacheStore,
    registry: EntityRegistry,
    packages: Arc<dyn PackageSource>,
    reviews: Arc<dyn ReviewSource>,
    images: ImagePipeline,
    categories: RwLock<Vec<Arc<Category>>>,
    installed: RwLock<Vec<SharedApp>>,
    events: broadcast::Sender<ModelEvent>,
    review_page_limit: u32,
}

impl StoreModel {
    /// Assemble a model from its collaborators
    pub fn new(
        cache: CacheStore,
        packages: Arc<dyn PackageSource>,
        reviews: Arc<dyn ReviewSource>,
        images: ImagePipeline,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: EntityRegistry::new(cache.clone(), Arc::clone(&reviews)),
            cache,
            packages,
            reviews,
            images,
            categories: RwLock::new(Vec::new()),
            installed: RwLock::new(Vec::new()),
            events,
            review_page_limit: 40,
        }
    }

    /// Build a model with the real daemon and review service clients
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let cache = CacheStore::open(&config.cache_path)?;
        let packages = Arc::new(SnapdClient::from_config(config));
        let reviews = Arc::new(OdrsClient::from_config(config)?);
        let images = ImagePipeline::from_config(config, cache.clone())?;

        info!(
            "Store model using snapd at {} and reviews from {}",
            config.snapd_socket_path.display(),
            config.odrs_server_uri
        );
        Ok(Self::new(cache, packages, reviews, images)
            .with_review_page_limit(config.review_page_limit))
    }

    /// Set the number of reviews requested by [`update_reviews`](Self::update_reviews)
    pub fn with_review_page_limit(mut self, limit: u32) -> Self {
        self.review_page_limit = limit;
        self
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Canonical app for `name`
    pub fn app(&self, name: &str) -> SharedApp {
        self.registry.get_or_create(name)
    }

    /// Current categories, in presentation order
    pub fn categories(&self) -> Vec<Arc<Category>> {
        self.categories.read().clone()
    }

    pub fn category(&self, name: &str) -> Option<Arc<Category>> {
        self.categories.read().iter().find(|c| c.name() == name).cloned()
    }

    /// Current installed apps
    pub fn installed(&self) -> Vec<SharedApp> {
        self.installed.read().clone()
    }

    /// Populate categories and the installed list from the cache
    ///
    /// No network access. Sections without a cached name list come up
    /// empty.
    pub fn load_from_cache(&self) -> Result<()> {
        let index: Vec<String> = self
            .cache
            .lookup_json(namespace::SECTIONS, namespace::SECTION_INDEX_KEY)?
            .unwrap_or_default();

        let mut categories = Vec::with_capacity(index.len());
        for section in &index {
            let names: Vec<String> = self
                .cache
                .lookup_json(namespace::SECTIONS, section)?
                .unwrap_or_default();
            let category = Category::new(section.as_str());
            category.set_apps(names.iter().map(|name| self.registry.get_or_create(name)).collect());
            categories.push(Arc::new(category));
        }

        let installed_names: Vec<String> = self
            .cache
            .lookup_json(namespace::INSTALLED, namespace::INSTALLED_KEY)?
            .unwrap_or_default();
        let installed: Vec<SharedApp> = installed_names
            .iter()
            .map(|name| self.registry.get_or_create(name))
            .collect();
        for app in &installed {
            app.write().installed = true;
        }

        debug!(
            "Loaded {} categories and {} installed apps from cache",
            categories.len(),
            installed.len()
        );
        *self.categories.write() = categories;
        self.emit(ModelEvent::CategoriesChanged);
        *self.installed.write() = installed;
        self.emit(ModelEvent::InstalledChanged);
        Ok(())
    }

    /// Refresh every category from the daemon
    ///
    /// Sections are fetched concurrently. A failed section keeps its
    /// previous contents and is reported through
    /// [`ModelEvent::SectionRefreshFailed`]; a failure to list the sections
    /// fails the whole refresh.
    pub async fn refresh_categories(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Outcome<RefreshReport>> {
        let result = self.refresh_categories_inner(cancel).await;
        settle(cancel, result)
    }

    async fn refresh_categories_inner(&self, cancel: &CancellationToken) -> Result<RefreshReport> {
        let sections = self.packages.list_sections(cancel).await?;
        info!("Refreshing {} sections", sections.len());

        let fetches = sections.iter().map(|section| async move {
            (section, self.packages.find_section(section, cancel).await)
        });
        let results = futures::future::join_all(fetches).await;
        check(cancel)?;

        let mut merged = Vec::with_capacity(results.len());
        for (section, result) in results {
            let result = match result {
                Ok(snaps) => Ok(self.merge_snaps(&snaps).await),
                Err(e) => Err(e),
            };
            merged.push((section, result));
        }

        let previous = self.categories();
        let mut categories = Vec::with_capacity(merged.len());
        let mut refreshed = Vec::new();
        let mut report = RefreshReport {
            sections: sections.clone(),
            failed: Vec::new(),
        };

        for (section, result) in merged {
            let existing = previous.iter().find(|c| c.name() == section.as_str()).cloned();
            let category = existing.unwrap_or_else(|| Arc::new(Category::new(section.as_str())));
            match result {
                Ok(apps) => {
                    category.set_apps(apps.clone());
                    refreshed.push((section, apps));
                    categories.push(category);
                }
                Err(e) => {
                    warn!("Failed to refresh section {}: {}", section, e);
                    self.emit(ModelEvent::SectionRefreshFailed {
                        section: section.clone(),
                        message: e.to_string(),
                    });
                    report.failed.push(section.clone());
                    categories.push(category);
                }
            }
        }

        *self.categories.write() = categories;
        for (section, _) in &refreshed {
            self.emit(ModelEvent::CategoryChanged {
                name: section.to_string(),
            });
        }
        self.emit(ModelEvent::CategoriesChanged);

        for (section, apps) in &refreshed {
            self.save_apps(apps).await;
            self.store_json(namespace::SECTIONS, section, &app_names(apps)).await;
        }
        self.store_json(namespace::SECTIONS, namespace::SECTION_INDEX_KEY, &sections)
            .await;

        Ok(report)
    }

    /// Refresh the installed list from the daemon
    pub async fn refresh_installed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Vec<SharedApp>>> {
        let result = self.refresh_installed_inner(cancel).await;
        settle(cancel, result)
    }

    async fn refresh_installed_inner(&self, cancel: &CancellationToken) -> Result<Vec<SharedApp>> {
        let snaps = self.packages.list_installed(cancel).await?;
        check(cancel)?;

        let apps = self.merge_snaps(&snaps).await;
        for app in &apps {
            app.write().installed = true;
        }
        for app in self.installed() {
            if !apps.iter().any(|a| Arc::ptr_eq(a, &app)) {
                app.write().installed = false;
            }
        }

        *self.installed.write() = apps.clone();
        self.emit(ModelEvent::InstalledChanged);
        info!("{} snaps installed", apps.len());

        self.save_apps(&apps).await;
        self.store_json(namespace::INSTALLED, namespace::INSTALLED_KEY, &app_names(&apps))
            .await;
        Ok(apps)
    }

    /// Search the store; results are merged and cached but not kept as a
    /// category
    pub async fn search(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Vec<SharedApp>>> {
        let result = async {
            let snaps = self.packages.find(query, FindMode::Text, cancel).await?;
            check(cancel)?;
            let apps = self.merge_snaps(&snaps).await;
            self.save_apps(&apps).await;
            debug!("Search for {:?} matched {} snaps", query, apps.len());
            Ok::<_, Error>(apps)
        }
        .await;
        settle(cancel, result)
    }

    /// Re-query one app by exact name
    ///
    /// Anything other than exactly one match is a protocol error.
    pub async fn refresh(
        &self,
        app: &SharedApp,
        cancel: &CancellationToken,
    ) -> Result<Outcome<()>> {
        let name = app.read().name.clone();
        let result = async {
            let snaps = self.packages.find(&name, FindMode::Name, cancel).await?;
            check(cancel)?;
            let [snap] = snaps.as_slice() else {
                return Err(Error::protocol(format!(
                    "refresh of {name} expected exactly one match, got {}",
                    snaps.len()
                )));
            };
            app.write().update_from_snap(snap);
            self.registry.apply_histogram(app);
            self.save_apps(std::slice::from_ref(app)).await;
            Ok(())
        }
        .await;
        settle(cancel, result)
    }

    /// Install `app` from `channel` (the default channel when `None`)
    pub async fn install(
        &self,
        app: &SharedApp,
        channel: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Outcome<()>> {
        let (name, progress) = self.begin_operation(app)?;
        info!("Installing {}", name);
        let result = self.packages.install(&name, channel, &progress, cancel).await;
        let outcome = self.finish_operation(app, &name, Operation::Install, cancel, result);

        if matches!(outcome, Ok(Outcome::Completed(()))) {
            app.write().installed = true;
            {
                let mut installed = self.installed.write();
                if !installed.iter().any(|a| Arc::ptr_eq(a, app)) {
                    installed.push(Arc::clone(app));
                }
            }
            self.emit(ModelEvent::InstalledChanged);
            self.persist_installed(app).await;
        }
        outcome
    }

    /// Remove `app` from the system
    pub async fn remove(&self, app: &SharedApp, cancel: &CancellationToken) -> Result<Outcome<()>> {
        let (name, progress) = self.begin_operation(app)?;
        info!("Removing {}", name);
        let result = self.packages.remove(&name, &progress, cancel).await;
        let outcome = self.finish_operation(app, &name, Operation::Remove, cancel, result);

        if matches!(outcome, Ok(Outcome::Completed(()))) {
            app.write().installed = false;
            self.installed.write().retain(|a| !Arc::ptr_eq(a, app));
            self.emit(ModelEvent::InstalledChanged);
            self.persist_installed(app).await;
        }
        outcome
    }

    /// Download ratings for all apps and update every registered app
    ///
    /// Returns the number of apps updated.
    pub async fn update_ratings(&self, cancel: &CancellationToken) -> Result<Outcome<usize>> {
        let result = async {
            self.reviews.update_ratings(cancel).await?;
            check(cancel)?;
            Ok::<_, Error>(self.registry.apply_ratings())
        }
        .await;
        settle(cancel, result)
    }

    /// Fetch the first page of reviews for `app`
    ///
    /// The reviews are stored on the app and cached. Returns the session
    /// key the caller needs for voting; it is not kept here.
    pub async fn update_reviews(
        &self,
        app: &SharedApp,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Option<String>>> {
        let (name, appstream_id) = {
            let app = app.read();
            (app.name.clone(), app.appstream_id.clone())
        };
        let Some(appstream_id) = appstream_id else {
            debug!("{} has no appstream id, skipping reviews", name);
            return Ok(Outcome::Completed(None));
        };

        let result = async {
            let page = ReviewPage::first(self.review_page_limit);
            let batch = self.reviews.fetch_reviews(&appstream_id, &page, cancel).await?;
            check(cancel)?;

            let documents: Vec<ReviewDocument> =
                batch.reviews.iter().map(ReviewDocument::from).collect();
            app.write().reviews = batch.reviews;
            self.store_json(namespace::REVIEWS, &name, &documents).await;
            Ok::<_, Error>(batch.session_key)
        }
        .await;
        settle(cancel, result)
    }

    /// Cached metadata (ETag, original size) of an image
    pub fn cached_image_metadata(&self, uri: &str) -> Result<Option<ImageMetadata>> {
        self.images.cached_metadata(uri)
    }

    /// Fetch an image through the pipeline
    pub async fn get_image(
        &self,
        uri: &str,
        etag: Option<&str>,
        width: u32,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<Outcome<FetchedImage>> {
        let result = self.images.fetch(uri, etag, width, height, cancel).await;
        settle(cancel, result)
    }

    /// Decode an image from the cache only
    pub async fn get_cached_image(
        &self,
        uri: &str,
        width: u32,
        height: u32,
    ) -> Result<Option<Arc<DecodedImage>>> {
        self.images.lookup_cached_only(uri, width, height).await
    }

    /// Merge live results into the registry, preserving their order
    async fn merge_snaps(&self, snaps: &[SnapSummary]) -> Vec<SharedApp> {
        let mut apps = Vec::with_capacity(snaps.len());
        for snap in snaps {
            let app = self.registry.get_or_create_async(&snap.name).await;
            app.write().update_from_snap(snap);
            self.registry.apply_histogram(&app);
            apps.push(app);
        }
        apps
    }

    /// Attach a fresh progress, refusing if an operation is already running
    fn begin_operation(&self, app: &SharedApp) -> Result<(String, Arc<Progress>)> {
        let mut guard = app.write();
        if guard.is_busy() {
            return Err(Error::AlreadyInProgress(guard.name.clone()));
        }
        let progress = Arc::new(Progress::new());
        guard.attach_progress(Arc::clone(&progress));
        Ok((guard.name.clone(), progress))
    }

    /// Clear the progress, then classify the result
    fn finish_operation(
        &self,
        app: &SharedApp,
        name: &str,
        operation: Operation,
        cancel: &CancellationToken,
        result: Result<()>,
    ) -> Result<Outcome<()>> {
        app.write().clear_progress();
        let outcome = settle(cancel, result);
        match &outcome {
            Ok(Outcome::Completed(())) => info!("{} of {} finished", operation, name),
            Ok(Outcome::Cancelled) => debug!("{} of {} cancelled", operation, name),
            Err(e) => {
                warn!("{} of {} failed: {}", operation, name, e);
                self.emit(ModelEvent::OperationFailed {
                    app: name.to_string(),
                    operation,
                    message: e.to_string(),
                });
            }
        }
        outcome
    }

    /// Write the app snapshot and installed index after an operation;
    /// failures are logged
    async fn persist_installed(&self, app: &SharedApp) {
        let (name, snapshot) = {
            let app = app.read();
            (app.name.clone(), app.snapshot())
        };
        let names = app_names(&self.installed());
        let writes = async {
            self.cache
                .insert_json_async(namespace::APPS, &name, &snapshot, None)
                .await?;
            self.cache
                .insert_json_async(namespace::INSTALLED, namespace::INSTALLED_KEY, &names, None)
                .await
        };
        if let Err(e) = writes.await {
            warn!("Failed to cache installed state of {}: {}", name, e);
        }
    }

    /// Save app snapshots under `("apps", name)`
    async fn save_apps(&self, apps: &[SharedApp]) {
        for app in apps {
            let (name, snapshot) = {
                let app = app.read();
                (app.name.clone(), app.snapshot())
            };
            self.store_json(namespace::APPS, &name, &snapshot).await;
        }
    }

    /// Best-effort cache write; failures are logged
    ///
    /// Callers check their token before committing results, never here, so
    /// a committed result is written in full.
    async fn store_json<T: Serialize + ?Sized>(&self, ns: &str, key: &str, value: &T) {
        if let Err(e) = self.cache.insert_json_async(ns, key, value, None).await {
            warn!("Failed to cache {}/{}: {}", ns, key, e);
        }
    }

    fn emit(&self, event: ModelEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn app_names(apps: &[SharedApp]) -> Vec<String> {
    apps.iter().map(|app| app.read().name.clone()).collect()
}
