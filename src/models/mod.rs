pub mod revision;
pub mod tips;

pub use revision::*;
pub use tips::*;
