//! Reconciliation of source records into the canonical library.

mod duplicates;
mod match_key;
mod merge;
mod similarity;

pub use duplicates::{find_candidates, pick_survivor};
pub use match_key::{match_keys, name_key, resolve_match_key, MatchKey};
pub use merge::{has_identity_conflict, merge_entities};
pub use similarity::{levenshtein_distance, name_similarity, normalize_name};

use crate::import_source::{RawRecord, SourceError};
use crate::library_store::{
    CanonicalEntity, DownloadState, EntityDraft, EntityId, LibrarySession, OwnershipState,
    StoreError,
};
use crate::ownership::{self, OwnershipEngine, OwnershipTransition};
use crate::resilience::{Classify, ErrorClass};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] SourceError),

    #[error("Cannot merge {remove} into {keep}: {reason}")]
    InvalidMerge {
        keep: EntityId,
        remove: EntityId,
        reason: String,
    },
}

impl Classify for ReconcileError {
    fn classify(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(e) => e.classify(),
            ReconcileError::Record(e) => e.classify(),
            ReconcileError::InvalidMerge { .. } => ErrorClass::Terminal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Created,
    Merged,
    Unchanged,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Created => "created",
            ReconcileAction::Merged => "merged",
            ReconcileAction::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub entity_id: EntityId,
    pub action: ReconcileAction,
    pub ownership: OwnershipTransition,
}

#[derive(Debug, Clone, Default)]
pub struct EntityReconciler {
    ownership: OwnershipEngine,
}

impl EntityReconciler {
    pub fn new(ownership: OwnershipEngine) -> Self {
        Self { ownership }
    }

    /// Merge `record` (and its parent chain) into the library.
    pub fn reconcile(
        &self,
        session: &mut dyn LibrarySession,
        record: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        record.validate()?;
        self.reconcile_validated(session, record, now)
    }

    fn reconcile_validated(
        &self,
        session: &mut dyn LibrarySession,
        record: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let parent_id = match &record.parent {
            Some(parent) => Some(self.reconcile_validated(session, parent, now)?.entity_id),
            None => None,
        };

        let (entity_id, action) = match self.lookup(session, record, parent_id)? {
            Some(mut entity) => {
                if merge::absorb(
                    &mut entity,
                    &record.external_ids,
                    &record.attributes,
                    parent_id,
                ) {
                    entity.updated_at = now;
                    session.update(&entity)?;
                    (entity.id, ReconcileAction::Merged)
                } else {
                    (entity.id, ReconcileAction::Unchanged)
                }
            }
            None => {
                let mut external_ids = record.external_ids.clone();
                if !record.kind.is_leaf() {
                    external_ids.isrc = None;
                }
                let entity = session.create(EntityDraft {
                    kind: record.kind,
                    name: record.name.trim().to_string(),
                    name_key: name_key(&record.name),
                    external_ids,
                    attributes: record.attributes.clone(),
                    parent_id,
                })?;
                debug!("Created {} {} '{}'", entity.kind, entity.id, entity.name);
                (entity.id, ReconcileAction::Created)
            }
        };

        let ownership = match record.ownership {
            Some(true) => {
                self.ownership
                    .assert_ownership(session, entity_id, &record.source, now)?
            }
            Some(false) => {
                self.ownership
                    .retract_ownership(session, entity_id, &record.source, now)?
            }
            None => OwnershipTransition::Unchanged,
        };

        Ok(ReconcileOutcome {
            entity_id,
            action,
            ownership,
        })
    }

    /// Walk the record's keys, strongest first. The first hit whose ids do not
    /// conflict with the record's wins.
    fn lookup(
        &self,
        session: &dyn LibrarySession,
        record: &RawRecord,
        parent_id: Option<EntityId>,
    ) -> Result<Option<CanonicalEntity>, StoreError> {
        for key in match_keys(record) {
            let hit = match &key {
                MatchKey::Universal(id) => session.find_by_universal_id(record.kind, id)?,
                MatchKey::Isrc(isrc) => session.find_by_isrc(isrc)?,
                MatchKey::Provider { source, id } => {
                    session.find_by_provider_id(record.kind, source, id)?
                }
                MatchKey::NormalizedName { name, parent } => {
                    Self::find_by_name(session, record, name, parent.as_deref(), parent_id)?
                }
            };
            let Some(entity) = hit else {
                continue;
            };
            if has_identity_conflict(&entity.external_ids, &record.external_ids) {
                debug!(
                    "'{}' hit {} {} by {:?} but their ids conflict",
                    record.name, entity.kind, entity.id, key
                );
                continue;
            }
            debug!("'{}' matched {} {} by {:?}", record.name, entity.kind, entity.id, key);
            return Ok(Some(entity));
        }
        Ok(None)
    }

    fn find_by_name(
        session: &dyn LibrarySession,
        record: &RawRecord,
        name: &str,
        parent_key: Option<&str>,
        parent_id: Option<EntityId>,
    ) -> Result<Option<CanonicalEntity>, StoreError> {
        for candidate in session.find_by_name_key(record.kind, name)? {
            let in_scope = match (parent_id, candidate.parent_id) {
                (None, None) => true,
                (None, Some(_)) => false,
                // Orphaned candidates adopt the record's parent on merge
                (Some(_), None) => true,
                (Some(expected), Some(actual)) if expected == actual => true,
                (Some(_), Some(actual)) => match (parent_key, session.get(actual)?) {
                    (Some(key), Some(parent)) => parent.name_key == key,
                    _ => false,
                },
            };
            if in_scope && !has_identity_conflict(&candidate.external_ids, &record.external_ids) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Fold `remove_id` into `keep_id`. The removed entity stays in the
    /// library as Discovered, pointing at the survivor.
    pub fn merge_duplicates(
        &self,
        session: &mut dyn LibrarySession,
        keep_id: EntityId,
        remove_id: EntityId,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let invalid = |reason: &str| ReconcileError::InvalidMerge {
            keep: keep_id,
            remove: remove_id,
            reason: reason.to_string(),
        };
        if keep_id == remove_id {
            return Err(invalid("same entity"));
        }
        let keep = session.get(keep_id)?.ok_or(StoreError::NotFound(keep_id))?;
        let mut remove = session
            .get(remove_id)?
            .ok_or(StoreError::NotFound(remove_id))?;
        if keep.kind != remove.kind {
            return Err(invalid("different kinds"));
        }
        if keep.merged_into.is_some() || remove.merged_into.is_some() {
            return Err(invalid("already merged"));
        }

        for mut child in session.children_of(remove_id)? {
            child.parent_id = Some(keep_id);
            child.updated_at = now;
            session.update(&child)?;
        }
        for mut previous in session
            .list_by_kind(remove.kind)?
            .into_iter()
            .filter(|e| e.merged_into == Some(remove_id))
        {
            previous.merged_into = Some(keep_id);
            previous.updated_at = now;
            session.update(&previous)?;
        }

        let mut merged = merge_entities(&keep, &remove);
        ownership::reevaluate(&mut merged, now);
        if merged.is_owned()
            && remove.download_state == DownloadState::Downloaded
            && merged.download_state != DownloadState::Downloaded
        {
            merged.set_download_state(DownloadState::Downloaded, now);
        }
        merged.updated_at = now;
        session.update(&merged)?;

        remove.merged_into = Some(keep_id);
        remove.ownership_signals.clear();
        if remove.ownership_state != OwnershipState::Ignored {
            remove.ownership_state = OwnershipState::Discovered;
        }
        remove.set_download_state(DownloadState::NotNeeded, now);
        remove.updated_at = now;
        session.update(&remove)?;

        session.remove_review(keep_id, remove_id)?;
        debug!("Merged {} {} into {}", remove.kind, remove_id, keep_id);
        Ok(())
    }
}
