// src/entities/category.rs

//! Store categories (snap sections)

use crate::entities::SharedApp;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Human title for a section name; unknown sections use their name
pub fn section_title(name: &str) -> &str {
    match name {
        "development" => "Development",
        "games" => "Games",
        "social" => "Social",
        "productivity" => "Productivity",
        "utilities" => "Utilities",
        "photo-and-video" => "Photo and Video",
        "server-and-cloud" => "Server and Cloud",
        "security" => "Security",
        "featured" => "Editors picks",
        "devices-and-iot" => "Devices and IoT",
        "music-and-audio" => "Music and Audio",
        "entertainment" => "Entertainment",
        "art-and-design" => "Art and Design",
        "finance" => "Finance",
        "news-and-weather" => "News and Weather",
        "science" => "Science",
        "health-and-fitness" => "Health and Fitness",
        "education" => "Education",
        "books-and-reference" => "Books and Reference",
        "personalisation" => "Personalisation",
        other => other,
    }
}

/// Optional blurb shown under a section title
pub fn section_summary(name: &str) -> Option<&'static str> {
    match name {
        "featured" => Some(
            "Here are this months hand-picked applications from our content team, \
             we hope you like them!",
        ),
        _ => None,
    }
}

/// A named group of apps, in presentation order
///
/// The app list holds references into the registry and is replaced as a
/// whole; an app appears at most once per category.
#[derive(Debug)]
pub struct Category {
    name: String,
    title: String,
    summary: Option<String>,
    apps: RwLock<Vec<SharedApp>>,
}

impl Category {
    /// Create an empty category, with title and summary from the section table
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            title: section_title(&name).to_string(),
            summary: section_summary(&name).map(str::to_string),
            name,
            apps: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Current app list
    pub fn apps(&self) -> Vec<SharedApp> {
        self.apps.read().clone()
    }

    /// Names of the apps, in order
    pub fn app_names(&self) -> Vec<String> {
        self.apps.read().iter().map(|app| app.read().name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.apps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.read().is_empty()
    }

    /// Replace the app list; later duplicates of a name are dropped
    pub fn set_apps(&self, apps: Vec<SharedApp>) {
        let mut seen = HashSet::new();
        let apps: Vec<SharedApp> = apps
            .into_iter()
            .filter(|app| seen.insert(app.read().name.clone()))
            .collect();
        *self.apps.write() = apps;
    }
}
