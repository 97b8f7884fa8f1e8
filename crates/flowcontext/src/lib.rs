//! Scoped context storage for flows and nodes.
//!
//! A [`ContextManager`] hands out [`Context`] objects for the global scope,
//! each flow and each node, and routes their reads and writes to one of the
//! configured [`ContextStore`] backends.

pub mod context;
pub mod error;
pub mod file;
pub mod manager;
pub mod memory;
pub mod path;
pub mod store;

pub use context::{Context, Entry, DEFAULT_STORE};
pub use error::ContextError;
pub use file::{FileStore, FileStoreFactory};
pub use manager::{ContextManager, ContextSettings, StorageConfig, StorageEntry, StoreListing, StoreModule};
pub use memory::{MemoryStore, MemoryStoreFactory};
pub use store::{ContextStore, StoreConfig, StoreFactory, StoreRegistry, StoreSettings, SyncAccess};
