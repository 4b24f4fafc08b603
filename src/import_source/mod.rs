//! External sources of library records.

mod local_folder;

pub use local_folder::LocalFolderSource;

use crate::library_store::{EntityKind, ExternalIds};
use crate::resilience::{Classify, ErrorClass};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tokio::time::error::Elapsed;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Listing timed out")]
    Timeout,

    #[error("Malformed record: {0}")]
    Malformed(String),
}

impl From<Elapsed> for SourceError {
    fn from(_: Elapsed) -> Self {
        SourceError::Timeout
    }
}

impl Classify for SourceError {
    fn classify(&self) -> ErrorClass {
        match self {
            SourceError::Io(_) | SourceError::Unavailable(_) | SourceError::Timeout => {
                ErrorClass::Transient
            }
            SourceError::Malformed(_) => ErrorClass::Terminal,
        }
    }
}

/// A record as reported by a source, before reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub source: String,
    pub kind: EntityKind,
    pub name: String,
    pub external_ids: ExternalIds,
    pub attributes: BTreeMap<String, JsonValue>,
    /// The album of a track, the artist of an album.
    pub parent: Option<Box<RawRecord>>,
    /// `Some(true)` liked, `Some(false)` unliked, `None` no ownership information.
    pub ownership: Option<bool>,
}

impl RawRecord {
    pub fn new(source: impl Into<String>, kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind,
            name: name.into(),
            external_ids: ExternalIds::default(),
            attributes: BTreeMap::new(),
            parent: None,
            ownership: None,
        }
    }

    pub fn with_parent(mut self, parent: RawRecord) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn with_universal_id(mut self, id: impl Into<String>) -> Self {
        self.external_ids.universal = Some(id.into());
        self
    }

    pub fn with_isrc(mut self, isrc: impl Into<String>) -> Self {
        self.external_ids.isrc = Some(isrc.into());
        self
    }

    /// Sets this record's source-specific id.
    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.external_ids
            .providers
            .insert(self.source.clone(), id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_ownership(mut self, owned: bool) -> Self {
        self.ownership = Some(owned);
        self
    }

    /// Structural checks, applied recursively to the parent chain.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.name.trim().is_empty() {
            return Err(SourceError::Malformed(format!(
                "{} record from {} has an empty name",
                self.kind, self.source
            )));
        }
        if self.external_ids.isrc.is_some() && self.kind != EntityKind::Track {
            return Err(SourceError::Malformed(format!(
                "{} '{}' carries an ISRC",
                self.kind, self.name
            )));
        }
        if let Some(parent) = &self.parent {
            if Some(parent.kind) != self.kind.parent_kind() {
                return Err(SourceError::Malformed(format!(
                    "{} '{}' cannot have a {} parent",
                    self.kind, self.name, parent.kind
                )));
            }
            parent.validate()?;
        }
        Ok(())
    }
}

/// A place records come from (local folder, streaming catalog, ...).
#[async_trait]
pub trait ImportSource: Send + Sync {
    /// Unique source name, used as the ownership signal and provider id key.
    fn name(&self) -> &str;

    /// Records that appeared or changed since the last acknowledged listing.
    async fn list_new_or_changed(&self) -> Result<Vec<RawRecord>, SourceError>;

    /// Marks the last listing as fully processed.
    fn acknowledge(&self) {}
}
