//! Canonical library persistence.
//!
//! All access goes through a short-lived [`LibrarySession`] (unit of work).
//! Sessions are synchronous and must never be held across an `.await`.

mod memory_store;
mod models;
mod schema;
mod sqlite_store;

pub use memory_store::MemoryLibraryStore;
pub use models::{
    CanonicalEntity, DownloadState, DuplicateCandidate, EntityDraft, EntityId, EntityKind,
    ExternalIds, OwnershipState, ReviewItem,
};
pub use sqlite_store::SqliteLibraryStore;

use crate::resilience::{Classify, ErrorClass};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Write contention, retrying later can help.
    #[error("Database is busy: {0}")]
    Busy(String),

    #[error("Entity {0} not found")]
    NotFound(EntityId),

    #[error("Invalid data: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Busy(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Invalid(e.to_string())
    }
}

impl Classify for StoreError {
    fn classify(&self) -> ErrorClass {
        match self {
            StoreError::Busy(_) => ErrorClass::Transient,
            _ => ErrorClass::Terminal,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Unit of work over the library. Dropping a session without calling
/// [`LibrarySession::commit`] discards its writes.
pub trait LibrarySession {
    fn get(&self, id: EntityId) -> StoreResult<Option<CanonicalEntity>>;

    fn find_by_universal_id(
        &self,
        kind: EntityKind,
        universal_id: &str,
    ) -> StoreResult<Option<CanonicalEntity>>;

    fn find_by_isrc(&self, isrc: &str) -> StoreResult<Option<CanonicalEntity>>;

    fn find_by_provider_id(
        &self,
        kind: EntityKind,
        source: &str,
        provider_id: &str,
    ) -> StoreResult<Option<CanonicalEntity>>;

    /// Entities of `kind` whose normalized name equals `name_key`, merged-away
    /// entities excluded.
    fn find_by_name_key(&self, kind: EntityKind, name_key: &str)
        -> StoreResult<Vec<CanonicalEntity>>;

    fn list_by_kind(&self, kind: EntityKind) -> StoreResult<Vec<CanonicalEntity>>;

    fn list_all(&self) -> StoreResult<Vec<CanonicalEntity>>;

    fn children_of(&self, parent_id: EntityId) -> StoreResult<Vec<CanonicalEntity>>;

    /// Tracks in `state`, oldest transition first.
    fn list_by_download_state(
        &self,
        state: DownloadState,
        limit: usize,
    ) -> StoreResult<Vec<CanonicalEntity>>;

    fn create(&mut self, draft: EntityDraft) -> StoreResult<CanonicalEntity>;

    /// Overwrites the stored entity with the same id.
    fn update(&mut self, entity: &CanonicalEntity) -> StoreResult<()>;

    /// Queue a candidate for manual review. Returns false if the pair was
    /// already queued.
    fn enqueue_review(&mut self, candidate: &DuplicateCandidate) -> StoreResult<bool>;

    fn review_queue(&self) -> StoreResult<Vec<ReviewItem>>;

    fn remove_review(&mut self, a: EntityId, b: EntityId) -> StoreResult<()>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Storage backend for the canonical library.
pub trait LibraryStore: Send + Sync {
    fn begin(&self) -> StoreResult<Box<dyn LibrarySession + '_>>;
}

/// Run `f` inside a session, committing on success and rolling back on error.
pub fn with_session<T, F>(store: &dyn LibraryStore, f: F) -> StoreResult<T>
where
    F: FnOnce(&mut dyn LibrarySession) -> StoreResult<T>,
{
    in_session(store, f)
}

/// Same as [`with_session`], for work whose error type wraps [`StoreError`].
pub fn in_session<T, E, F>(store: &dyn LibraryStore, f: F) -> Result<T, E>
where
    F: FnOnce(&mut dyn LibrarySession) -> Result<T, E>,
    E: From<StoreError> + std::fmt::Display,
{
    let mut session = store.begin()?;
    match f(session.as_mut()) {
        Ok(value) => {
            session.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = session.rollback() {
                tracing::warn!("Rollback failed after error ({}): {}", e, rollback_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn draft(kind: EntityKind, name: &str, parent_id: Option<EntityId>) -> EntityDraft {
        EntityDraft {
            kind,
            name: name.to_string(),
            name_key: name.to_lowercase(),
            external_ids: ExternalIds::default(),
            attributes: BTreeMap::new(),
            parent_id,
        }
    }

    /// Behaviour every backend must share.
    fn exercise_store(store: &dyn LibraryStore) {
        // Create and read back
        let (artist_id, album_id) = with_session(store, |s| {
            let artist = s.create(draft(EntityKind::Artist, "Björk", None))?;
            let mut album_draft = draft(EntityKind::Album, "Homogenic", Some(artist.id));
            album_draft.external_ids.universal = Some("mbid-homogenic".to_string());
            album_draft
                .external_ids
                .providers
                .insert("local".to_string(), "bjork/homogenic".to_string());
            album_draft
                .attributes
                .insert("year".to_string(), serde_json::json!(1997));
            let album = s.create(album_draft)?;
            Ok((artist.id, album.id))
        })
        .unwrap();
        assert_ne!(artist_id, album_id);

        let session = store.begin().unwrap();
        let album = session.get(album_id).unwrap().unwrap();
        assert_eq!(album.name, "Homogenic");
        assert_eq!(album.parent_id, Some(artist_id));
        assert_eq!(album.ownership_state, OwnershipState::Discovered);
        assert_eq!(album.download_state, DownloadState::NotNeeded);
        assert_eq!(album.attributes["year"], serde_json::json!(1997));
        assert_eq!(
            session
                .find_by_universal_id(EntityKind::Album, "mbid-homogenic")
                .unwrap()
                .map(|e| e.id),
            Some(album_id)
        );
        assert!(session
            .find_by_universal_id(EntityKind::Artist, "mbid-homogenic")
            .unwrap()
            .is_none());
        assert_eq!(
            session
                .find_by_provider_id(EntityKind::Album, "local", "bjork/homogenic")
                .unwrap()
                .map(|e| e.id),
            Some(album_id)
        );
        assert_eq!(
            session
                .find_by_name_key(EntityKind::Artist, "björk")
                .unwrap()
                .len(),
            1
        );
        assert_eq!(session.children_of(artist_id).unwrap().len(), 1);
        assert_eq!(session.list_all().unwrap().len(), 2);
        drop(session);

        // Dropped session discards writes
        {
            let mut session = store.begin().unwrap();
            session
                .create(draft(EntityKind::Artist, "Ghost", None))
                .unwrap();
        }
        let session = store.begin().unwrap();
        assert!(session
            .find_by_name_key(EntityKind::Artist, "ghost")
            .unwrap()
            .is_empty());
        drop(session);

        // Explicit rollback discards writes too
        let mut session = store.begin().unwrap();
        session
            .create(draft(EntityKind::Artist, "Ghost", None))
            .unwrap();
        session.rollback().unwrap();
        let session = store.begin().unwrap();
        assert_eq!(session.list_by_kind(EntityKind::Artist).unwrap().len(), 1);
        drop(session);

        // Error inside with_session rolls back
        let result: StoreResult<()> = with_session(store, |s| {
            s.create(draft(EntityKind::Artist, "Ghost", None))?;
            Err(StoreError::Invalid("boom".to_string()))
        });
        assert!(result.is_err());
        let session = store.begin().unwrap();
        assert_eq!(session.list_by_kind(EntityKind::Artist).unwrap().len(), 1);
        drop(session);

        // Update and download state listing
        let now = Utc::now();
        with_session(store, |s| {
            let a = s.create(draft(EntityKind::Track, "Joga", Some(album_id)))?;
            let b = s.create(draft(EntityKind::Track, "Bachelorette", Some(album_id)))?;
            let mut a = a;
            a.ownership_state = OwnershipState::Owned;
            a.ownership_signals.insert("local".to_string());
            a.set_download_state(DownloadState::Pending, now);
            s.update(&a)?;
            let mut b = b;
            b.ownership_state = OwnershipState::Owned;
            b.set_download_state(DownloadState::Pending, now - Duration::hours(1));
            s.update(&b)
        })
        .unwrap();

        let session = store.begin().unwrap();
        let pending = session
            .list_by_download_state(DownloadState::Pending, 10)
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].name, "Bachelorette");
        assert!(pending[1].ownership_signals.contains("local"));
        assert_eq!(
            session
                .list_by_download_state(DownloadState::Pending, 1)
                .unwrap()
                .len(),
            1
        );
        drop(session);

        // Updating a missing entity fails
        let result = with_session(store, |s| {
            let mut ghost = draft(EntityKind::Artist, "Nobody", None).into_entity(EntityId(9999), now);
            ghost.name = "Nobody".to_string();
            s.update(&ghost)
        });
        assert!(matches!(result, Err(StoreError::NotFound(EntityId(9999)))));

        // Review queue
        let candidate = DuplicateCandidate::new(EntityKind::Artist, artist_id, album_id, 0.9);
        let queued = with_session(store, |s| {
            let first = s.enqueue_review(&candidate)?;
            let second = s.enqueue_review(&candidate)?;
            Ok((first, second))
        })
        .unwrap();
        assert_eq!(queued, (true, false));

        let session = store.begin().unwrap();
        let queue = session.review_queue().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].candidate.left, candidate.left);
        assert!((queue[0].candidate.score - 0.9).abs() < 1e-9);
        drop(session);

        with_session(store, |s| s.remove_review(album_id, artist_id)).unwrap();
        assert!(store.begin().unwrap().review_queue().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryLibraryStore::new();
        exercise_store(&store);
    }

    #[test]
    fn test_sqlite_store_contract() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteLibraryStore::new(temp_dir.path().join("library.db")).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_busy_errors_are_transient() {
        assert!(StoreError::Busy("locked".to_string()).is_transient());
        assert!(!StoreError::Invalid("bad".to_string()).is_transient());
        assert!(!StoreError::NotFound(EntityId(1)).is_transient());
    }
}
