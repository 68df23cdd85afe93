//! Core type definitions used across the Cloudshelf workspace.

pub mod object;
pub mod progress;
pub mod provider;
pub mod response;

pub use object::{
    ConnectionStatus, DeleteFailure, DeleteOutcome, FileInfo, FolderEntry, ListOptions,
    ListResult, ObjectEntry, PreviewContent, SearchOptions, SearchResult, UploadOutcome,
};
pub use progress::{ProgressCallback, TransferProgress};
pub use provider::ProviderType;
pub use response::{OperationError, OperationResult};
