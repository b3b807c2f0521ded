//! In-memory database indexes: definitions, key computation for document
//! writes, and the copy-on-write ordered maps the committer publishes into.

pub mod index_registry;
pub mod memory_index;

pub use crate::{
    index_registry::{
        IndexRegistry,
        IndexUpdate,
        IndexValue,
    },
    memory_index::{
        DatabaseIndexMap,
        MemoryIndexes,
    },
};
