//! The layout pipeline: ancestry walk, branch lines, filter visibility,
//! column assignment and frame compilation.

pub mod builder;
pub mod columns;
pub mod filter;
pub mod layout;
pub mod lines;

pub use builder::{
    BuildJob, BuildStatus, GraphBuilder, GraphMap, GraphRow, LineOrigin, LoadError, ParentLink,
    DEFAULT_WORK_UNIT,
};
pub use columns::{ColumnAllocator, ColumnPlan, Crossing, Occupancy, DEFAULT_SEARCH_HORIZON};
pub use filter::{AncestryMode, Filter, FilterMatches, PathMatchJob, SearchPattern, Visibility};
pub use layout::{Edge, EdgeKind, LayoutCompiler, LayoutFrame, LayoutRow, Twisty};
pub use lines::{BranchLine, BranchLineTable, LineEnd, LineId, LineKey, RowVisibility};
