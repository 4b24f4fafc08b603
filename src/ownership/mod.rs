//! Ownership and download lifecycle of canonical entities.
//!
//! An entity is Owned while at least one source asserts it. Ignored is a
//! user decision and wins over any signal until reversed.

use crate::config::OwnershipSettings;
use crate::library_store::{
    CanonicalEntity, DownloadState, EntityId, EntityKind, LibrarySession, OwnershipState,
    StoreError, StoreResult,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Signal given to a parent because one of its children is owned.
pub const DERIVED_SIGNAL: &str = "derived:children";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipTransition {
    Unchanged,
    Promoted,
    Demoted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub promoted: usize,
    pub demoted: usize,
}

/// Recompute `ownership_state` and `download_state` from the entity's signals.
pub fn reevaluate(entity: &mut CanonicalEntity, now: DateTime<Utc>) -> OwnershipTransition {
    let was_owned = entity.is_owned();

    if entity.ownership_state == OwnershipState::Ignored {
        entity.set_download_state(DownloadState::NotNeeded, now);
        return if was_owned {
            OwnershipTransition::Demoted
        } else {
            OwnershipTransition::Unchanged
        };
    }

    if entity.ownership_signals.is_empty() {
        entity.ownership_state = OwnershipState::Discovered;
        entity.set_download_state(DownloadState::NotNeeded, now);
    } else {
        entity.ownership_state = OwnershipState::Owned;
        if !entity.kind.is_leaf() {
            entity.set_download_state(DownloadState::NotNeeded, now);
        } else if entity.download_state == DownloadState::NotNeeded {
            entity.set_download_state(DownloadState::Pending, now);
        }
    }

    match (was_owned, entity.is_owned()) {
        (false, true) => OwnershipTransition::Promoted,
        (true, false) => OwnershipTransition::Demoted,
        _ => OwnershipTransition::Unchanged,
    }
}

#[derive(Debug, Clone, Default)]
pub struct OwnershipEngine {
    settings: OwnershipSettings,
}

impl OwnershipEngine {
    pub fn new(settings: OwnershipSettings) -> Self {
        Self { settings }
    }

    fn load(session: &dyn LibrarySession, id: EntityId) -> StoreResult<CanonicalEntity> {
        session.get(id)?.ok_or(StoreError::NotFound(id))
    }

    fn save(
        session: &mut dyn LibrarySession,
        entity: &mut CanonicalEntity,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        entity.updated_at = now;
        session.update(entity)
    }

    pub fn assert_ownership(
        &self,
        session: &mut dyn LibrarySession,
        id: EntityId,
        source: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<OwnershipTransition> {
        let mut entity = Self::load(session, id)?;
        entity.ownership_signals.insert(source.to_string());
        if entity.primary_source.is_none() && source != DERIVED_SIGNAL {
            entity.primary_source = Some(source.to_string());
        }
        let transition = reevaluate(&mut entity, now);
        Self::save(session, &mut entity, now)?;
        if transition != OwnershipTransition::Unchanged {
            debug!("{} {} {:?} by {}", entity.kind, id, transition, source);
        }
        Ok(transition)
    }

    /// Remove `source`'s signal from the entity. Descendants keep their own
    /// signals and are re-evaluated on them.
    pub fn retract_ownership(
        &self,
        session: &mut dyn LibrarySession,
        id: EntityId,
        source: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<OwnershipTransition> {
        let mut entity = Self::load(session, id)?;
        entity.ownership_signals.remove(source);
        let transition = reevaluate(&mut entity, now);
        Self::save(session, &mut entity, now)?;
        if transition != OwnershipTransition::Unchanged {
            debug!("{} {} {:?}, {} retracted", entity.kind, id, transition, source);
        }

        let mut stack = vec![id];
        while let Some(parent_id) = stack.pop() {
            for mut child in session.children_of(parent_id)? {
                stack.push(child.id);
                let before = (child.ownership_state, child.download_state);
                reevaluate(&mut child, now);
                if (child.ownership_state, child.download_state) != before {
                    Self::save(session, &mut child, now)?;
                }
            }
        }
        Ok(transition)
    }

    pub fn ignore(
        &self,
        session: &mut dyn LibrarySession,
        id: EntityId,
        now: DateTime<Utc>,
    ) -> StoreResult<OwnershipTransition> {
        let mut entity = Self::load(session, id)?;
        entity.ownership_state = OwnershipState::Ignored;
        let transition = reevaluate(&mut entity, now);
        Self::save(session, &mut entity, now)?;
        Ok(transition)
    }

    pub fn unignore(
        &self,
        session: &mut dyn LibrarySession,
        id: EntityId,
        now: DateTime<Utc>,
    ) -> StoreResult<OwnershipTransition> {
        let mut entity = Self::load(session, id)?;
        if entity.ownership_state != OwnershipState::Ignored {
            return Ok(OwnershipTransition::Unchanged);
        }
        entity.ownership_state = OwnershipState::Discovered;
        let transition = reevaluate(&mut entity, now);
        Self::save(session, &mut entity, now)?;
        Ok(transition)
    }

    /// Give parents with an owned child the derived signal, and take it back
    /// from parents left without one. Albums go first so that artists see
    /// the albums' updated state.
    pub fn consistency_pass(
        &self,
        session: &mut dyn LibrarySession,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        if !self.settings.promote_parents && !self.settings.demote_orphaned_parents {
            return Ok(report);
        }

        for kind in [EntityKind::Album, EntityKind::Artist] {
            for mut parent in session.list_by_kind(kind)? {
                if parent.merged_into.is_some() {
                    continue;
                }
                let has_owned_child = session
                    .children_of(parent.id)?
                    .iter()
                    .any(|c| c.merged_into.is_none() && c.is_owned());
                let has_derived = parent.ownership_signals.contains(DERIVED_SIGNAL);

                let changed = if has_owned_child && !has_derived && self.settings.promote_parents {
                    parent.ownership_signals.insert(DERIVED_SIGNAL.to_string());
                    true
                } else if !has_owned_child
                    && has_derived
                    && parent.ownership_signals.len() == 1
                    && self.settings.demote_orphaned_parents
                {
                    parent.ownership_signals.remove(DERIVED_SIGNAL);
                    true
                } else {
                    false
                };
                if !changed {
                    continue;
                }

                match reevaluate(&mut parent, now) {
                    OwnershipTransition::Promoted => report.promoted += 1,
                    OwnershipTransition::Demoted => report.demoted += 1,
                    OwnershipTransition::Unchanged => {}
                }
                Self::save(session, &mut parent, now)?;
            }
        }
        Ok(report)
    }
}
