//! Foundation types shared by every layer of the database: timestamps,
//! values and their order-preserving encoding, documents, index keys,
//! intervals over index-key space, the persistence interface, error
//! metadata, and tunable knobs.

pub mod document;
pub mod env;
pub mod errors;
pub mod index;
pub mod interval;
pub mod knobs;
pub mod persistence;
pub mod sync;
pub mod types;
pub mod value;

pub use crate::{
    document::{
        Document,
        DocumentId,
        DocumentUpdate,
        InternalId,
    },
    errors::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    },
    index::{
        IndexKey,
        IndexKeyBytes,
    },
    interval::{
        BinaryKey,
        End,
        Interval,
        IntervalSet,
        StartIncluded,
    },
    types::{
        IndexDescriptor,
        IndexName,
        IndexedFields,
        Order,
        RepeatableTimestamp,
        SubscriberId,
        TableName,
        Timestamp,
        WriteTimestamp,
    },
    value::{
        FieldName,
        Object,
        Value,
    },
};
