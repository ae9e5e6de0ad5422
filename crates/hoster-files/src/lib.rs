//! Sandboxed workspace file access.
//!
//! Every server instance owns one workspace root. This crate resolves
//! client-supplied relative paths against that root and guarantees that no
//! listing, upload or download can reach outside of it.

pub mod error;
pub mod workspace;

pub use error::WorkspaceError;
pub use workspace::{DirectoryListing, Download, StagedUpload, UploadedFile, Workspace};

/// Prefix of in-flight upload files. They are hidden from listings and backups.
pub const STAGING_PREFIX: &str = ".upload-";
