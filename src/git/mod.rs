//! Git-backed revision source and working-tree queries.

pub mod repository;
pub mod status;

pub use repository::GitRepository;
pub use status::{is_ignored, is_versioned, StatusOutcome, ERROR_EXIT_CODE};
