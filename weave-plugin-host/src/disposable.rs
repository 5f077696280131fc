//! Disposable handles for plugin subscriptions
//!
//! Everything a plugin registers (commands, event handlers, ...) hands back
//! a [`Disposable`]. The plugin pushes it onto its context's
//! [`DisposableStore`], which the registry drains in reverse order on
//! deactivation.

use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to dispose {label}: {message}")]
pub struct DisposeError {
    pub label: String,
    pub message: String,
}

type DisposeFn = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// A cleanup action that runs at most once
pub struct Disposable {
    label: String,
    action: Mutex<Option<DisposeFn>>,
}

impl Disposable {
    pub fn new<F>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// A disposable with nothing to clean up
    pub fn noop(label: impl Into<String>) -> Self {
        Self::new(label, || Ok(()))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the action; later calls do nothing
    pub fn dispose(&self) -> Result<(), DisposeError> {
        let action = self.action.lock().unwrap_or_else(|e| e.into_inner()).take();
        match action {
            Some(action) => action().map_err(|message| DisposeError {
                label: self.label.clone(),
                message,
            }),
            None => Ok(()),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.action.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("label", &self.label)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Ordered collection of disposables owned by one plugin activation
#[derive(Clone, Default)]
pub struct DisposableStore {
    items: Arc<Mutex<Vec<Disposable>>>,
}

impl DisposableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, disposable: Disposable) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).push(disposable);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose everything, last registered first
    ///
    /// A failing disposable does not stop the rest; all failures are
    /// returned.
    pub fn dispose_all(&self) -> Vec<DisposeError> {
        let items = std::mem::take(&mut *self.items.lock().unwrap_or_else(|e| e.into_inner()));
        items
            .iter()
            .rev()
            .filter_map(|item| item.dispose().err())
            .collect()
    }
}

impl fmt::Debug for DisposableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposableStore")
            .field("count", &self.len())
            .finish()
    }
}
