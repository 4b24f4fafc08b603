//! Library housekeeping: dangling references and stuck download states.
//!
//! Cleanup never deletes an entity and never changes its ownership.

use crate::config::CleanupSettings;
use crate::library_store::{
    CanonicalEntity, DownloadState, EntityId, LibrarySession, StoreResult,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Parent references that did not resolve, or pointed at a merged entity.
    pub orphans_repaired: usize,
    pub failed_reset: usize,
    pub stale_reset: usize,
    /// Download states carried by entities that are not owned tracks.
    pub stray_reset: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.orphans_repaired + self.failed_reset + self.stale_reset + self.stray_reset
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupEngine {
    settings: CleanupSettings,
}

impl CleanupEngine {
    pub fn new(settings: CleanupSettings) -> Self {
        Self { settings }
    }

    fn failed_grace(&self) -> Duration {
        Duration::seconds(self.settings.failed_grace_period_secs as i64)
    }

    fn stale_threshold(&self) -> Duration {
        Duration::seconds(self.settings.stale_in_progress_threshold_secs as i64)
    }

    pub fn run(
        &self,
        session: &mut dyn LibrarySession,
        now: DateTime<Utc>,
    ) -> StoreResult<CleanupReport> {
        let entities = session.list_all()?;
        let merged_into: HashMap<EntityId, Option<EntityId>> =
            entities.iter().map(|e| (e.id, e.merged_into)).collect();

        let mut report = CleanupReport::default();
        for mut entity in entities {
            let mut changed = self.repair_parent(&mut entity, &merged_into, &mut report);
            changed |= self.reset_download_state(&mut entity, now, &mut report);
            if changed {
                entity.updated_at = now;
                session.update(&entity)?;
            }
        }
        Ok(report)
    }

    fn repair_parent(
        &self,
        entity: &mut CanonicalEntity,
        merged_into: &HashMap<EntityId, Option<EntityId>>,
        report: &mut CleanupReport,
    ) -> bool {
        let Some(parent_id) = entity.parent_id else {
            return false;
        };
        match merged_into.get(&parent_id) {
            Some(None) => false,
            Some(Some(survivor)) => {
                // Follow the merge chain to the live entity
                let mut target = *survivor;
                let mut hops = 0;
                while let Some(Some(next)) = merged_into.get(&target) {
                    target = *next;
                    hops += 1;
                    if hops > merged_into.len() {
                        warn!("Merge chain loop at {}", target);
                        break;
                    }
                }
                let target = merged_into.contains_key(&target).then_some(target);
                debug!(
                    "{} {} pointed at merged parent {}, now {:?}",
                    entity.kind, entity.id, parent_id, target
                );
                entity.parent_id = target;
                report.orphans_repaired += 1;
                true
            }
            None => {
                debug!(
                    "{} {} had dangling parent {}",
                    entity.kind, entity.id, parent_id
                );
                entity.parent_id = None;
                report.orphans_repaired += 1;
                true
            }
        }
    }

    fn reset_download_state(
        &self,
        entity: &mut CanonicalEntity,
        now: DateTime<Utc>,
        report: &mut CleanupReport,
    ) -> bool {
        if !entity.is_owned() || !entity.kind.is_leaf() {
            if entity.download_state == DownloadState::NotNeeded {
                return false;
            }
            entity.set_download_state(DownloadState::NotNeeded, now);
            report.stray_reset += 1;
            return true;
        }

        let age = entity
            .download_state_changed_at
            .map(|changed_at| now - changed_at);
        let expired = |limit: Duration| age.map_or(true, |age| age >= limit);

        match entity.download_state {
            DownloadState::Failed if expired(self.failed_grace()) => {
                entity.set_download_state(DownloadState::Pending, now);
                report.failed_reset += 1;
                true
            }
            DownloadState::InProgress if expired(self.stale_threshold()) => {
                entity.set_download_state(DownloadState::Pending, now);
                report.stale_reset += 1;
                true
            }
            _ => false,
        }
    }
}
