// src/model/events.rs

//! Change notifications published by the model

use serde::Serialize;
use std::fmt;

/// Long-running operation on a single app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Install,
    Remove,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Install => write!(f, "install"),
            Operation::Remove => write!(f, "remove"),
        }
    }
}

/// Event sent to subscribers after a change is complete
///
/// List events fire only once the new list has been swapped in. Nothing is
/// sent for a cancelled operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    /// The category list was replaced
    CategoriesChanged,
    /// The app list of one category was replaced
    CategoryChanged { name: String },
    /// The installed list was replaced
    InstalledChanged,
    /// One section could not be refreshed; the others were
    SectionRefreshFailed { section: String, message: String },
    /// An install or remove failed
    OperationFailed {
        app: String,
        operation: Operation,
        message: String,
    },
}
