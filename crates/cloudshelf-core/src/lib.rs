//! # cloudshelf-core
//!
//! Core crate for Cloudshelf. Contains the storage capability trait,
//! configuration schemas and profile normalization, listing and transfer
//! types, search matching, and the unified error system.
//!
//! This crate has **no** internal dependencies on other Cloudshelf crates.

pub mod config;
pub mod error;
pub mod result;
pub mod search;
pub mod traits;
pub mod types;

pub use error::AppError;
pub use result::AppResult;
