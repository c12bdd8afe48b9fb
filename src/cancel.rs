// src/cancel.rs

//! Cooperative cancellation helpers
//!
//! One `CancellationToken` is threaded through every nested request that
//! belongs to a logical operation. Awaiting through [`cancellable`] turns a
//! fired token into `Error::Cancelled` at the next suspension point, and
//! [`settle`] folds that back into a neutral [`Outcome::Cancelled`] so that
//! cancellation never reaches callers as a failure.

use crate::error::{Error, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Terminal result of an operation that can be cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation ran to completion
    Completed(T),
    /// The operation was cancelled by its caller
    Cancelled,
}

impl<T> Outcome<T> {
    /// True if the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// The completed value, if any
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }
}

/// Await `fut`, returning `Error::Cancelled` as soon as `cancel` fires
///
/// The token is polled first so an already-cancelled operation never
/// issues the request at all.
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Fail fast with `Error::Cancelled` if the token has already fired
pub fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Convert a finished result into an [`Outcome`]
///
/// Cancellation pre-empts any other error from the same call: once the
/// token has fired, a failure is reported as `Cancelled`.
pub fn settle<T>(cancel: &CancellationToken, result: Result<T>) -> Result<Outcome<T>> {
    match result {
        Ok(value) => Ok(Outcome::Completed(value)),
        Err(Error::Cancelled) => Ok(Outcome::Cancelled),
        Err(_) if cancel.is_cancelled() => Ok(Outcome::Cancelled),
        Err(e) => Err(e),
    }
}
