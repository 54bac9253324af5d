#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Versioned, partitioned state stores for stateful streaming operators.
//!
//! Each stateful operator partition persists its state through a
//! [StateStore], a transaction bound to a single version. Stores are created
//! by a [StateStoreProvider], which owns the durable state of one
//! [StoreIdentity] across all versions. Providers are cached and maintained
//! by a [StateStoreRegistry], which checks with a [StateStoreCoordinator]
//! that this process is still the authoritative server of each store before
//! doing any maintenance on it.

mod conf;
mod coordinator;
mod error;
mod file;
mod maintenance;
mod registry;
mod row;
mod schema;
mod state_store;
mod state_store_provider;
mod store_identity;

pub use conf::*;
pub use coordinator::*;
pub use error::*;
pub use file::{FileStateStoreProvider, FILE_PROVIDER};
pub use registry::*;
pub use row::*;
pub use schema::*;
pub use state_store::*;
pub use state_store_provider::*;
pub use store_identity::*;
