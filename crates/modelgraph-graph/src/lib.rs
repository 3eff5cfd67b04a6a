pub mod inference;
pub mod node;
pub mod ontology;
pub mod relationship;
pub mod sync;

pub use inference::*;
pub use node::*;
pub use ontology::*;
pub use relationship::*;
pub use sync::*;
