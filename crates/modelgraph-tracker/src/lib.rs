pub mod registry;
pub mod tracker;

pub use registry::*;
pub use tracker::*;
