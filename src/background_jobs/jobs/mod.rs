//! Specific background job implementations.
//!
//! This module contains implementations of the `BackgroundJob` trait for the
//! library pipeline: sync from import sources, duplicate merging, ownership
//! consistency, download dispatch and cleanup.

pub mod download_dispatch;
pub mod duplicate_merge;
pub mod library_cleanup;
pub mod library_sync;
pub mod ownership_consistency;

pub use download_dispatch::DownloadDispatchJob;
pub use duplicate_merge::DuplicateMergeJob;
pub use library_cleanup::LibraryCleanupJob;
pub use library_sync::LibrarySyncJob;
pub use ownership_consistency::OwnershipConsistencyJob;

pub const DUPLICATE_MERGE_TASK: &str = "duplicate_merge";
pub const OWNERSHIP_CONSISTENCY_TASK: &str = "ownership_consistency";
pub const DOWNLOAD_DISPATCH_TASK: &str = "download_dispatch";
pub const LIBRARY_CLEANUP_TASK: &str = "library_cleanup";
