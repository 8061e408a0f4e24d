pub mod captured;
pub mod registry;
pub mod vocabulary;

pub use captured::*;
pub use registry::*;
pub use vocabulary::{DEFAULT_EVENT_TYPES, KNOWN_EVENT_TYPES, resolve_enabled};
