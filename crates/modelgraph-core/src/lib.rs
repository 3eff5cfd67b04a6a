pub mod config_manager;
pub mod error;
pub mod events;
pub mod host;
pub mod memory;
pub mod types;

pub use config_manager::*;
pub use error::*;
pub use events::*;
pub use host::*;
pub use types::*;
