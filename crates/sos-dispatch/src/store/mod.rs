// Store
//
// Collaborator interfaces for persistence plus the in-process backends the
// service runs on when no external store is configured.

pub mod documents;
pub mod geo;
pub mod records;
pub mod seed;
pub mod sessions;

pub use documents::{Document, DocumentStore, Filter, MemoryDocumentStore};
pub use geo::{GeoLookup, StoreGeoLookup};
pub use records::Records;
pub use sessions::{MemorySessionStore, SessionStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("duplicate {field} {value} in {collection}")]
    Duplicate {
        collection: String,
        field: String,
        value: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
