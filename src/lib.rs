//! # revgraph
//!
//! Revision-graph layout engine for DVCS log viewers.
//!
//! Given a DAG of revisions and a set of branch tips, the engine orders the
//! revisions, groups them into branch lines, assigns every visible revision a
//! row and a column, and routes the edges between rows. Lines can be
//! collapsed and expanded, and filters hide revisions without moving the
//! columns of what stays visible.
//!
//! ## Architecture
//!
//! - [`models`] - Revision ids, revisions and branch tips
//! - [`provider`] - The `RevisionProvider` seam with in-memory and caching sources
//! - [`git`] - A `git2`-backed provider plus working-tree status queries
//! - [`graph`] - Ordering, branch lines, visibility, columns and frame compilation
//! - [`state`] - The generation-tagged controller, configuration and persistence
//!
//! ## Example
//!
//! ```rust,no_run
//! use revgraph::git::GitRepository;
//! use revgraph::state::{EngineConfig, StateController};
//!
//! # fn main() -> anyhow::Result<()> {
//! let repo = GitRepository::discover(".")?;
//! let tips = repo.branch_tips()?;
//!
//! let mut controller = StateController::new(repo, (), EngineConfig::default());
//! controller.on_tips_changed(tips);
//! controller.pump_until_idle();
//!
//! if let Some(frame) = controller.frame() {
//!     println!("{} rows in {} columns", frame.rows.len(), frame.width);
//! }
//! # Ok(())
//! # }
//! ```

pub mod git;
pub mod graph;
pub mod models;
pub mod provider;
pub mod state;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
