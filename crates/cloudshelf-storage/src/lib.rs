//! # cloudshelf-storage
//!
//! Storage provider Facades for Cloudshelf and the shared machinery they are
//! built from: listing normalization, batch deletes, progress throttling,
//! URL resolution, content previews, request signing, and error
//! classification.

pub mod batch;
pub mod classify;
pub mod factory;
pub mod http;
pub mod manager;
pub mod multipart;
pub mod pagination;
pub mod preview;
pub mod progress;
pub mod providers;
pub mod signing;
pub mod transfer;
pub mod url;
pub mod xml;

pub use manager::StorageManager;
