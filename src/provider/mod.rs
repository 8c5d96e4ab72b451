//! Revision sources consumed by the layout engine.
//!
//! The engine only needs parents and metadata for a revision id; any DVCS
//! (or an in-memory fixture) can back it. Caching is layered explicitly with
//! [`CachingProvider`].

pub mod cache;
pub mod memory;

pub use cache::*;
pub use memory::*;

use crate::models::{Revision, RevisionId};
use std::rc::Rc;
use thiserror::Error;

/// Errors a provider can report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Unknown revision: {0}")]
    UnknownRevision(RevisionId),

    #[error("Provider unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Capability not supported: {capability}")]
    Unsupported { capability: &'static str },

    #[error("Git error: {message}")]
    Git { message: String },
}

impl ProviderError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ProviderError::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn git(error: impl std::fmt::Display) -> Self {
        ProviderError::Git {
            message: error.to_string(),
        }
    }

    /// Transient failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable { .. })
    }
}

/// Abstract source of revisions.
#[cfg_attr(test, mockall::automock)]
pub trait RevisionProvider {
    /// Ordered parent ids, first parent first.
    fn parents(&self, id: &RevisionId) -> Result<Vec<RevisionId>, ProviderError>;

    fn metadata(&self, id: &RevisionId) -> Result<Revision, ProviderError>;

    /// Suggested heads as `(id, label)`, mainline first.
    fn heads(&self) -> Result<Vec<(RevisionId, String)>, ProviderError> {
        Ok(Vec::new())
    }

    fn supports_changed_paths(&self) -> bool {
        false
    }

    /// Paths changed by `id` relative to its first parent.
    fn changed_paths(&self, _id: &RevisionId) -> Result<Vec<String>, ProviderError> {
        Err(ProviderError::Unsupported {
            capability: "changed_paths",
        })
    }
}

impl<P: RevisionProvider + ?Sized> RevisionProvider for &P {
    fn parents(&self, id: &RevisionId) -> Result<Vec<RevisionId>, ProviderError> {
        (**self).parents(id)
    }

    fn metadata(&self, id: &RevisionId) -> Result<Revision, ProviderError> {
        (**self).metadata(id)
    }

    fn heads(&self) -> Result<Vec<(RevisionId, String)>, ProviderError> {
        (**self).heads()
    }

    fn supports_changed_paths(&self) -> bool {
        (**self).supports_changed_paths()
    }

    fn changed_paths(&self, id: &RevisionId) -> Result<Vec<String>, ProviderError> {
        (**self).changed_paths(id)
    }
}

impl<P: RevisionProvider + ?Sized> RevisionProvider for Box<P> {
    fn parents(&self, id: &RevisionId) -> Result<Vec<RevisionId>, ProviderError> {
        (**self).parents(id)
    }

    fn metadata(&self, id: &RevisionId) -> Result<Revision, ProviderError> {
        (**self).metadata(id)
    }

    fn heads(&self) -> Result<Vec<(RevisionId, String)>, ProviderError> {
        (**self).heads()
    }

    fn supports_changed_paths(&self) -> bool {
        (**self).supports_changed_paths()
    }

    fn changed_paths(&self, id: &RevisionId) -> Result<Vec<String>, ProviderError> {
        (**self).changed_paths(id)
    }
}

impl<P: RevisionProvider + ?Sized> RevisionProvider for Rc<P> {
    fn parents(&self, id: &RevisionId) -> Result<Vec<RevisionId>, ProviderError> {
        (**self).parents(id)
    }

    fn metadata(&self, id: &RevisionId) -> Result<Revision, ProviderError> {
        (**self).metadata(id)
    }

    fn heads(&self) -> Result<Vec<(RevisionId, String)>, ProviderError> {
        (**self).heads()
    }

    fn supports_changed_paths(&self) -> bool {
        (**self).supports_changed_paths()
    }

    fn changed_paths(&self, id: &RevisionId) -> Result<Vec<String>, ProviderError> {
        (**self).changed_paths(id)
    }
}
