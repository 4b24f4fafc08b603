//! musiclib-sync library
//!
//! Exposes the internal modules for the binary and for end-to-end tests.

pub mod background_jobs;
pub mod cleanup;
pub mod config;
pub mod downloader;
pub mod import_source;
pub mod library_store;
pub mod orchestrator;
pub mod ownership;
pub mod reconciler;
pub mod resilience;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use config::{AppConfig, CliConfig, FileConfig};
pub use orchestrator::Orchestrator;
pub use server::{make_app, run_server, ServerState};
