//! Priority-ordered keys used to find the canonical entity of a record.

use super::similarity::normalize_name;
use crate::import_source::RawRecord;
use crate::library_store::{EntityKind, LibrarySession, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKey {
    Universal(String),
    Isrc(String),
    Provider { source: String, id: String },
    NormalizedName { name: String, parent: Option<String> },
}

/// Normalized name, falling back to the lowercased raw name when
/// normalization leaves nothing (names made only of punctuation).
pub fn name_key(name: &str) -> String {
    let normalized = normalize_name(name);
    if normalized.is_empty() {
        name.trim().to_lowercase()
    } else {
        normalized
    }
}

/// Every key the record offers, strongest first.
pub fn match_keys(record: &RawRecord) -> Vec<MatchKey> {
    let mut keys = Vec::with_capacity(4);
    if let Some(universal) = &record.external_ids.universal {
        keys.push(MatchKey::Universal(universal.clone()));
    }
    if record.kind == EntityKind::Track {
        if let Some(isrc) = &record.external_ids.isrc {
            keys.push(MatchKey::Isrc(isrc.clone()));
        }
    }
    if let Some(id) = record.external_ids.providers.get(&record.source) {
        keys.push(MatchKey::Provider {
            source: record.source.clone(),
            id: id.clone(),
        });
    }
    keys.push(MatchKey::NormalizedName {
        name: name_key(&record.name),
        parent: record.parent.as_ref().map(|p| name_key(&p.name)),
    });
    keys
}

/// The key a record is identified by.
///
/// A provider id only counts once some entity already carries it; before
/// that the record is identified by name.
pub fn resolve_match_key(session: &dyn LibrarySession, record: &RawRecord) -> StoreResult<MatchKey> {
    for key in match_keys(record) {
        match &key {
            MatchKey::Universal(_) | MatchKey::Isrc(_) | MatchKey::NormalizedName { .. } => {
                return Ok(key)
            }
            MatchKey::Provider { source, id } => {
                if session
                    .find_by_provider_id(record.kind, source, id)?
                    .is_some()
                {
                    return Ok(key);
                }
            }
        }
    }
    // match_keys always ends with the name key
    Ok(MatchKey::NormalizedName {
        name: name_key(&record.name),
        parent: None,
    })
}
