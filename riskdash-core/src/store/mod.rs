//! Storage: one portable SQL surface over an embedded or client/server backend.

pub mod adapter;
pub mod backend;
pub mod cache;
pub mod database;
pub mod postgres;
pub mod raw;
pub mod schema;
pub mod sqlite;
mod value;

pub use adapter::{Dialect, KeyRegistry, QueryAdapter};
pub use backend::Backend;
pub use cache::CacheStore;
pub use database::Database;
pub use raw::RawRecordStore;
pub use value::{Row, SqlValue};

/// Result alias for the storage layer.
pub type StoreResult<T> = std::result::Result<T, crate::error::StoreError>;
