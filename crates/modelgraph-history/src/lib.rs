pub mod change_log;
pub mod checkpoint;
pub mod diff;
pub mod engine;
pub mod retention;

pub use change_log::*;
pub use checkpoint::*;
pub use diff::*;
pub use engine::*;
pub use retention::*;
