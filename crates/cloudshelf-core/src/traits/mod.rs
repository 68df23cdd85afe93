//! Core traits defined in `cloudshelf-core` and implemented by the storage crate.

pub mod storage;

pub use storage::StorageProvider;
