// src/progress.rs

//! Transient progress for in-flight install/remove operations
//!
//! A `Progress` is created when an operation starts, attached to the app
//! it concerns, updated by the package source while the daemon works, and
//! detached when the operation ends. It is never persisted.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

/// Done/total/label state of a long-running operation
///
/// Updates come from the task driving the daemon change while observers
/// read it through the app, so every field is individually thread-safe.
#[derive(Debug, Default)]
pub struct Progress {
    done: AtomicI64,
    total: AtomicI64,
    label: RwLock<String>,
}

/// Point-in-time copy of a [`Progress`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub done: i64,
    pub total: i64,
    pub label: String,
}

impl Progress {
    /// Create an empty progress (0 of 0, empty label)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the amount of work done
    pub fn set_done(&self, done: i64) {
        self.done.store(done, Ordering::Relaxed);
    }

    /// Set the total amount of work
    pub fn set_total(&self, total: i64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Set the current status label
    pub fn set_label(&self, label: &str) {
        let mut current = self.label.write();
        if current.as_str() != label {
            *current = label.to_string();
        }
    }

    /// Update all three fields at once
    pub fn update(&self, done: i64, total: i64, label: &str) {
        self.set_total(total);
        self.set_done(done);
        self.set_label(label);
    }

    pub fn done(&self) -> i64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> String {
        self.label.read().clone()
    }

    /// Completed fraction in `0.0..=1.0`, or `None` while the total is unknown
    pub fn fraction(&self) -> Option<f64> {
        let total = self.total();
        if total <= 0 {
            return None;
        }
        Some((self.done() as f64 / total as f64).clamp(0.0, 1.0))
    }

    /// Copy the current state
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            done: self.done(),
            total: self.total(),
            label: self.label(),
        }
    }
}
