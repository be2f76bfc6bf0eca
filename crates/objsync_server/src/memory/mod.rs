//! In-memory object store.
//!
//! Suitable for embedded hosts, tests and ephemeral servers that do not need
//! durability.

mod store;

pub use store::{InMemoryObjectStore, StoreStats};
