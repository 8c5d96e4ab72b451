pub mod config;
pub mod controller;
pub mod error_handling;
pub mod persist;

pub use config::*;
pub use controller::*;
pub use error_handling::*;
pub use persist::*;
