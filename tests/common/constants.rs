//! Shared constants for end-to-end tests
//!
//! When the fixture library changes, update only this file.

// ============================================================================
// Fixture Library
// ============================================================================

/// Import source name of the fixture folder
pub const SOURCE_NAME: &str = "local";

/// Task name of the fixture folder sync
pub const SYNC_TASK: &str = "sync_local";

/// Audio files of the fixture folder, relative to its root
pub const LIBRARY_FILES: &[&str] = &[
    "Portishead/Dummy/01 - Mysterons.flac",
    "Portishead/Dummy/02 - Sour Times.flac",
    "Massive Attack/Mezzanine/01 - Angel.mp3",
];

pub const ARTIST_COUNT: usize = 2;
pub const ALBUM_COUNT: usize = 2;
pub const TRACK_COUNT: usize = 3;

// ============================================================================
// Timeouts
// ============================================================================

/// Per-request timeout of the test client
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How long to wait for the server to answer its first request
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;
