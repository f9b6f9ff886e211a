//! Storage layer for engine documents.

mod file;
mod memory;
mod traits;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use traits::{Document, Documents, Kind, Store, StoreError, StoreResult};
