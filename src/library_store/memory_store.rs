use super::models::{
    CanonicalEntity, DownloadState, DuplicateCandidate, EntityDraft, EntityId, EntityKind,
    ReviewItem,
};
use super::{LibrarySession, LibraryStore, StoreError, StoreResult};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    entities: BTreeMap<EntityId, CanonicalEntity>,
    reviews: BTreeMap<(EntityId, EntityId), ReviewItem>,
}

/// In-process library store.
///
/// A session locks the whole store and works on a copy that replaces the
/// shared state on commit.
#[derive(Default)]
pub struct MemoryLibraryStore {
    state: Mutex<MemoryState>,
}

impl MemoryLibraryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LibraryStore for MemoryLibraryStore {
    fn begin(&self) -> StoreResult<Box<dyn LibrarySession + '_>> {
        let guard = self.state.lock().unwrap();
        let working = guard.clone();
        Ok(Box::new(MemorySession { guard, working }))
    }
}

struct MemorySession<'a> {
    guard: MutexGuard<'a, MemoryState>,
    working: MemoryState,
}

impl MemorySession<'_> {
    fn live(&self) -> impl Iterator<Item = &CanonicalEntity> {
        self.working.entities.values()
    }

    fn find_one<P>(&self, predicate: P) -> Option<CanonicalEntity>
    where
        P: Fn(&CanonicalEntity) -> bool,
    {
        self.live()
            .filter(|e| e.merged_into.is_none())
            .find(|e| predicate(*e))
            .cloned()
    }
}

impl LibrarySession for MemorySession<'_> {
    fn get(&self, id: EntityId) -> StoreResult<Option<CanonicalEntity>> {
        Ok(self.working.entities.get(&id).cloned())
    }

    fn find_by_universal_id(
        &self,
        kind: EntityKind,
        universal_id: &str,
    ) -> StoreResult<Option<CanonicalEntity>> {
        Ok(self.find_one(|e| {
            e.kind == kind && e.external_ids.universal.as_deref() == Some(universal_id)
        }))
    }

    fn find_by_isrc(&self, isrc: &str) -> StoreResult<Option<CanonicalEntity>> {
        Ok(self.find_one(|e| {
            e.kind == EntityKind::Track && e.external_ids.isrc.as_deref() == Some(isrc)
        }))
    }

    fn find_by_provider_id(
        &self,
        kind: EntityKind,
        source: &str,
        provider_id: &str,
    ) -> StoreResult<Option<CanonicalEntity>> {
        Ok(self.find_one(|e| {
            e.kind == kind
                && e.external_ids.providers.get(source).map(String::as_str) == Some(provider_id)
        }))
    }

    fn find_by_name_key(
        &self,
        kind: EntityKind,
        name_key: &str,
    ) -> StoreResult<Vec<CanonicalEntity>> {
        Ok(self
            .live()
            .filter(|e| e.kind == kind && e.merged_into.is_none() && e.name_key == name_key)
            .cloned()
            .collect())
    }

    fn list_by_kind(&self, kind: EntityKind) -> StoreResult<Vec<CanonicalEntity>> {
        Ok(self.live().filter(|e| e.kind == kind).cloned().collect())
    }

    fn list_all(&self) -> StoreResult<Vec<CanonicalEntity>> {
        Ok(self.live().cloned().collect())
    }

    fn children_of(&self, parent_id: EntityId) -> StoreResult<Vec<CanonicalEntity>> {
        Ok(self
            .live()
            .filter(|e| e.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    fn list_by_download_state(
        &self,
        state: DownloadState,
        limit: usize,
    ) -> StoreResult<Vec<CanonicalEntity>> {
        let mut matching: Vec<CanonicalEntity> = self
            .live()
            .filter(|e| e.download_state == state)
            .cloned()
            .collect();
        matching.sort_by_key(|e| (e.download_state_changed_at, e.id));
        matching.truncate(limit);
        Ok(matching)
    }

    fn create(&mut self, draft: EntityDraft) -> StoreResult<CanonicalEntity> {
        if draft.name.trim().is_empty() {
            return Err(StoreError::Invalid("entity name is empty".to_string()));
        }
        self.working.next_id += 1;
        let id = EntityId(self.working.next_id);
        let entity = draft.into_entity(id, chrono::Utc::now());
        self.working.entities.insert(id, entity.clone());
        Ok(entity)
    }

    fn update(&mut self, entity: &CanonicalEntity) -> StoreResult<()> {
        match self.working.entities.get_mut(&entity.id) {
            Some(stored) => {
                *stored = entity.clone();
                stored.updated_at = chrono::Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound(entity.id)),
        }
    }

    fn enqueue_review(&mut self, candidate: &DuplicateCandidate) -> StoreResult<bool> {
        let key = (candidate.left, candidate.right);
        if self.working.reviews.contains_key(&key) {
            return Ok(false);
        }
        self.working.reviews.insert(
            key,
            ReviewItem {
                candidate: candidate.clone(),
                queued_at: chrono::Utc::now(),
            },
        );
        Ok(true)
    }

    fn review_queue(&self) -> StoreResult<Vec<ReviewItem>> {
        Ok(self.working.reviews.values().cloned().collect())
    }

    fn remove_review(&mut self, a: EntityId, b: EntityId) -> StoreResult<()> {
        let key = if a <= b { (a, b) } else { (b, a) };
        self.working.reviews.remove(&key);
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemorySession { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
