//! Data models for the canonical library.
//!
//! Defines canonical entities, their lifecycle states and the duplicate
//! review queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

/// Surrogate key of a canonical entity, stable for the entity's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Artist,
    Album,
    Track,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Artist => "artist",
            EntityKind::Album => "album",
            EntityKind::Track => "track",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "artist" => Some(EntityKind::Artist),
            "album" => Some(EntityKind::Album),
            "track" => Some(EntityKind::Track),
            _ => None,
        }
    }

    /// Kind of the entity this kind hangs off, if any.
    pub fn parent_kind(&self) -> Option<EntityKind> {
        match self {
            EntityKind::Artist => None,
            EntityKind::Album => Some(EntityKind::Artist),
            EntityKind::Track => Some(EntityKind::Album),
        }
    }

    /// Tracks are the only entities that get downloaded.
    pub fn is_leaf(&self) -> bool {
        matches!(self, EntityKind::Track)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipState {
    Owned,
    Discovered,
    Ignored,
}

impl OwnershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipState::Owned => "owned",
            OwnershipState::Discovered => "discovered",
            OwnershipState::Ignored => "ignored",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "owned" => Some(OwnershipState::Owned),
            "discovered" => Some(OwnershipState::Discovered),
            "ignored" => Some(OwnershipState::Ignored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotNeeded,
    Pending,
    InProgress,
    Downloaded,
    Failed,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::NotNeeded => "not_needed",
            DownloadState::Pending => "pending",
            DownloadState::InProgress => "in_progress",
            DownloadState::Downloaded => "downloaded",
            DownloadState::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "not_needed" => Some(DownloadState::NotNeeded),
            "pending" => Some(DownloadState::Pending),
            "in_progress" => Some(DownloadState::InProgress),
            "downloaded" => Some(DownloadState::Downloaded),
            "failed" => Some(DownloadState::Failed),
            _ => None,
        }
    }
}

/// Identifiers an entity is known by outside this library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    /// Universal catalog id (e.g. a MusicBrainz id).
    pub universal: Option<String>,
    /// Tracks only.
    pub isrc: Option<String>,
    /// One id per source, keyed by source name.
    pub providers: BTreeMap<String, String>,
}

impl ExternalIds {
    pub fn is_empty(&self) -> bool {
        self.universal.is_none() && self.isrc.is_none() && self.providers.is_empty()
    }
}

/// Artist, album or track in the canonical graph.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    /// Normalized form of `name`, used for name matching and duplicate bucketing.
    pub name_key: String,
    pub external_ids: ExternalIds,
    pub attributes: BTreeMap<String, JsonValue>,
    pub parent_id: Option<EntityId>,
    pub ownership_state: OwnershipState,
    /// Sources currently asserting ownership.
    pub ownership_signals: BTreeSet<String>,
    pub primary_source: Option<String>,
    pub download_state: DownloadState,
    pub download_state_changed_at: Option<DateTime<Utc>>,
    pub merged_into: Option<EntityId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEntity {
    pub fn is_owned(&self) -> bool {
        self.ownership_state == OwnershipState::Owned
    }

    /// Moves the download state and stamps the transition time.
    pub fn set_download_state(&mut self, state: DownloadState, now: DateTime<Utc>) {
        if self.download_state != state {
            self.download_state = state;
            self.download_state_changed_at = Some(now);
        }
    }
}

/// Everything needed to create a new entity. Lifecycle fields start at
/// Discovered / NotNeeded.
#[derive(Debug, Clone)]
pub struct EntityDraft {
    pub kind: EntityKind,
    pub name: String,
    pub name_key: String,
    pub external_ids: ExternalIds,
    pub attributes: BTreeMap<String, JsonValue>,
    pub parent_id: Option<EntityId>,
}

impl EntityDraft {
    pub fn into_entity(self, id: EntityId, now: DateTime<Utc>) -> CanonicalEntity {
        CanonicalEntity {
            id,
            kind: self.kind,
            name: self.name,
            name_key: self.name_key,
            external_ids: self.external_ids,
            attributes: self.attributes,
            parent_id: self.parent_id,
            ownership_state: OwnershipState::Discovered,
            ownership_signals: BTreeSet::new(),
            primary_source: None,
            download_state: DownloadState::NotNeeded,
            download_state_changed_at: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A pair of entities of the same kind that look like the same thing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCandidate {
    pub kind: EntityKind,
    pub left: EntityId,
    pub right: EntityId,
    /// Similarity in [0, 1].
    pub score: f64,
}

impl DuplicateCandidate {
    /// Orders the pair so that `left < right`.
    pub fn new(kind: EntityKind, a: EntityId, b: EntityId, score: f64) -> Self {
        let (left, right) = if a <= b { (a, b) } else { (b, a) };
        Self {
            kind,
            left,
            right,
            score,
        }
    }
}

/// Candidate waiting for a human decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewItem {
    pub candidate: DuplicateCandidate,
    pub queued_at: DateTime<Utc>,
}
