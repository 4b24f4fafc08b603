//! Import source reading a folder laid out as `Artist/Album/NN - Title.ext`.

use super::{ImportSource, RawRecord, SourceError};
use crate::library_store::EntityKind;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info};
use walkdir::WalkDir;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "opus", "m4a", "aac", "wav"];

lazy_static! {
    static ref TRACK_FILE_RE: Regex =
        Regex::new(r"^(?P<number>\d{1,3})\s*(?:[-.]\s*)?(?P<title>.+)$")
            .expect("Invalid track file regex");
}

#[derive(Default)]
struct ListingState {
    /// Start time of the last acknowledged scan.
    synced_at: Option<SystemTime>,
    /// Relative paths present at the last acknowledged scan.
    known: HashSet<String>,
    pending: Option<PendingListing>,
}

struct PendingListing {
    started_at: SystemTime,
    seen: HashSet<String>,
}

struct AudioFile {
    relative: String,
    absolute: PathBuf,
    modified: Option<SystemTime>,
}

pub struct LocalFolderSource {
    name: String,
    root: PathBuf,
    state: Mutex<ListingState>,
}

impl LocalFolderSource {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            state: Mutex::new(ListingState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(root: &Path) -> Result<Vec<AudioFile>, SourceError> {
        if !root.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "library folder {:?} is not reachable",
                root
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_audio = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if !is_audio {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                debug!("Skipping non UTF-8 path {:?}", entry.path());
                continue;
            };
            files.push(AudioFile {
                relative: relative.replace('\\', "/"),
                absolute: entry.path().to_path_buf(),
                modified: entry.metadata().ok().and_then(|m| m.modified().ok()),
            });
        }
        Ok(files)
    }

    /// Build the Artist → Album → Track record chain for a library-relative path.
    fn record_for(&self, relative: &str, absolute: Option<&Path>, owned: bool) -> Option<RawRecord> {
        let parts: Vec<&str> = relative.split('/').collect();
        let [artist_dir, album_dir, file_name] = parts.as_slice() else {
            return None;
        };

        let stem = Path::new(file_name).file_stem()?.to_str()?;
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        let (number, title) = match TRACK_FILE_RE.captures(stem) {
            Some(caps) => (
                caps.name("number").and_then(|m| m.as_str().parse::<u32>().ok()),
                caps.name("title").map(|m| m.as_str().trim().to_string()),
            ),
            None => (None, None),
        };
        let title = title
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| stem.trim().to_string());

        let artist = RawRecord::new(&self.name, EntityKind::Artist, *artist_dir)
            .with_provider_id(*artist_dir);
        let album = RawRecord::new(&self.name, EntityKind::Album, *album_dir)
            .with_provider_id(format!("{}/{}", artist_dir, album_dir))
            .with_parent(artist);

        let mut track = RawRecord::new(&self.name, EntityKind::Track, title)
            .with_provider_id(relative)
            .with_parent(album)
            .with_ownership(owned);
        if let Some(number) = number {
            track = track.with_attribute("track_number", json!(number));
        }
        if let Some(extension) = extension {
            track = track.with_attribute("format", json!(extension));
        }
        if let Some(path) = absolute {
            track = track.with_attribute("file_path", json!(path.to_string_lossy()));
        }
        Some(track)
    }
}

#[async_trait]
impl ImportSource for LocalFolderSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_new_or_changed(&self) -> Result<Vec<RawRecord>, SourceError> {
        let started_at = SystemTime::now();
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || Self::scan(&root))
            .await
            .map_err(|e| SourceError::Unavailable(format!("scan task failed: {}", e)))??;

        let mut state = self.state.lock().unwrap();
        let mut records = Vec::new();
        let mut seen = HashSet::with_capacity(files.len());

        for file in &files {
            seen.insert(file.relative.clone());
            let changed = match (state.synced_at, file.modified) {
                (Some(synced_at), Some(modified)) => modified >= synced_at,
                _ => true,
            };
            if !changed && state.known.contains(&file.relative) {
                continue;
            }
            match self.record_for(&file.relative, Some(&file.absolute), true) {
                Some(record) => records.push(record),
                None => debug!("Skipping unrecognized file {}", file.relative),
            }
        }

        let mut removed: Vec<&String> = state.known.difference(&seen).collect();
        removed.sort();
        for relative in removed {
            if let Some(record) = self.record_for(relative, None, false) {
                records.push(record);
            }
        }

        info!(
            "Source {} listed {} files, {} new, changed or removed",
            self.name,
            files.len(),
            records.len()
        );
        state.pending = Some(PendingListing { started_at, seen });
        Ok(records)
    }

    fn acknowledge(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(pending) = state.pending.take() {
            state.synced_at = Some(pending.started_at);
            state.known = pending.seen;
        }
    }
}
