//! Configuration
//!
//! Static settings loaded from a JSON file, overridable from the command line.

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
