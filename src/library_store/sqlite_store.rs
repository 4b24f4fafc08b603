//! SQLite-backed library store.

use super::models::{
    CanonicalEntity, DownloadState, DuplicateCandidate, EntityDraft, EntityId, EntityKind,
    ExternalIds, OwnershipState, ReviewItem,
};
use super::schema::LIBRARY_VERSIONED_SCHEMAS;
use super::{LibrarySession, LibraryStore, StoreError, StoreResult};
use crate::sqlite_persistence::open_versioned;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ENTITY_COLUMNS: &str = "id, kind, name, name_key, universal_id, isrc, attributes, \
     parent_id, ownership_state, ownership_signals, primary_source, download_state, \
     download_state_changed_at, merged_into, created_at, updated_at";

pub struct SqliteLibraryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLibraryStore {
    /// Opens an existing database or creates a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), LIBRARY_VERSIONED_SCHEMAS, "library")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        use anyhow::Context;
        let conn = Connection::open_in_memory()?;
        LIBRARY_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl LibraryStore for SqliteLibraryStore {
    fn begin(&self) -> StoreResult<Box<dyn LibrarySession + '_>> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteSession {
            conn,
            finished: false,
        }))
    }
}

struct SqliteSession<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Drop for SqliteSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back abandoned library session: {}", e);
            }
        }
    }
}

fn to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Raw columns of an `entities` row, before JSON and enum decoding.
struct EntityRow {
    id: i64,
    kind: String,
    name: String,
    name_key: String,
    universal_id: Option<String>,
    isrc: Option<String>,
    attributes: String,
    parent_id: Option<i64>,
    ownership_state: String,
    ownership_signals: String,
    primary_source: Option<String>,
    download_state: String,
    download_state_changed_at: Option<i64>,
    merged_into: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl EntityRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(EntityRow {
            id: row.get("id")?,
            kind: row.get("kind")?,
            name: row.get("name")?,
            name_key: row.get("name_key")?,
            universal_id: row.get("universal_id")?,
            isrc: row.get("isrc")?,
            attributes: row.get("attributes")?,
            parent_id: row.get("parent_id")?,
            ownership_state: row.get("ownership_state")?,
            ownership_signals: row.get("ownership_signals")?,
            primary_source: row.get("primary_source")?,
            download_state: row.get("download_state")?,
            download_state_changed_at: row.get("download_state_changed_at")?,
            merged_into: row.get("merged_into")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_entity(self, providers: BTreeMap<String, String>) -> StoreResult<CanonicalEntity> {
        let kind = EntityKind::from_db_str(&self.kind)
            .ok_or_else(|| StoreError::Invalid(format!("unknown entity kind '{}'", self.kind)))?;
        let ownership_state = OwnershipState::from_db_str(&self.ownership_state).ok_or_else(|| {
            StoreError::Invalid(format!("unknown ownership state '{}'", self.ownership_state))
        })?;
        let download_state = DownloadState::from_db_str(&self.download_state).ok_or_else(|| {
            StoreError::Invalid(format!("unknown download state '{}'", self.download_state))
        })?;
        let attributes: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&self.attributes)?;
        let ownership_signals: BTreeSet<String> = serde_json::from_str(&self.ownership_signals)?;

        Ok(CanonicalEntity {
            id: EntityId(self.id),
            kind,
            name: self.name,
            name_key: self.name_key,
            external_ids: ExternalIds {
                universal: self.universal_id,
                isrc: self.isrc,
                providers,
            },
            attributes,
            parent_id: self.parent_id.map(EntityId),
            ownership_state,
            ownership_signals,
            primary_source: self.primary_source,
            download_state,
            download_state_changed_at: self.download_state_changed_at.map(from_timestamp),
            merged_into: self.merged_into.map(EntityId),
            created_at: from_timestamp(self.created_at),
            updated_at: from_timestamp(self.updated_at),
        })
    }
}

impl SqliteSession<'_> {
    fn providers_of(&self, id: i64) -> StoreResult<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT source, provider_id FROM provider_ids WHERE entity_id = ?1")?;
        let providers = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<String, String>>>()?;
        Ok(providers)
    }

    /// Run an entity query whose columns are [`ENTITY_COLUMNS`].
    fn query_entities(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Vec<CanonicalEntity>> {
        let sql = format!("SELECT {} FROM entities {}", ENTITY_COLUMNS, where_clause);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params, EntityRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|row| {
                let providers = self.providers_of(row.id)?;
                row.into_entity(providers)
            })
            .collect()
    }

    fn query_one(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Option<CanonicalEntity>> {
        Ok(self
            .query_entities(&format!("{} LIMIT 1", where_clause), params)?
            .into_iter()
            .next())
    }

    fn write_providers(&self, entity: &CanonicalEntity) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM provider_ids WHERE entity_id = ?1",
            params![entity.id.0],
        )?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO provider_ids (entity_id, kind, source, provider_id) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (source, provider_id) in &entity.external_ids.providers {
            stmt.execute(params![
                entity.id.0,
                entity.kind.as_str(),
                source,
                provider_id
            ])?;
        }
        Ok(())
    }
}

impl LibrarySession for SqliteSession<'_> {
    fn get(&self, id: EntityId) -> StoreResult<Option<CanonicalEntity>> {
        self.query_one("WHERE id = ?1", &[&id.0])
    }

    fn find_by_universal_id(
        &self,
        kind: EntityKind,
        universal_id: &str,
    ) -> StoreResult<Option<CanonicalEntity>> {
        self.query_one(
            "WHERE kind = ?1 AND universal_id = ?2 AND merged_into IS NULL ORDER BY id",
            &[&kind.as_str(), &universal_id],
        )
    }

    fn find_by_isrc(&self, isrc: &str) -> StoreResult<Option<CanonicalEntity>> {
        self.query_one(
            "WHERE kind = 'track' AND isrc = ?1 AND merged_into IS NULL ORDER BY id",
            &[&isrc],
        )
    }

    fn find_by_provider_id(
        &self,
        kind: EntityKind,
        source: &str,
        provider_id: &str,
    ) -> StoreResult<Option<CanonicalEntity>> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT p.entity_id FROM provider_ids p JOIN entities e ON e.id = p.entity_id \
                 WHERE p.kind = ?1 AND p.source = ?2 AND p.provider_id = ?3 \
                 AND e.merged_into IS NULL ORDER BY p.entity_id LIMIT 1",
                params![kind.as_str(), source, provider_id],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            Some(id) => self.get(EntityId(id)),
            None => Ok(None),
        }
    }

    fn find_by_name_key(
        &self,
        kind: EntityKind,
        name_key: &str,
    ) -> StoreResult<Vec<CanonicalEntity>> {
        self.query_entities(
            "WHERE kind = ?1 AND name_key = ?2 AND merged_into IS NULL ORDER BY id",
            &[&kind.as_str(), &name_key],
        )
    }

    fn list_by_kind(&self, kind: EntityKind) -> StoreResult<Vec<CanonicalEntity>> {
        self.query_entities("WHERE kind = ?1 ORDER BY id", &[&kind.as_str()])
    }

    fn list_all(&self) -> StoreResult<Vec<CanonicalEntity>> {
        self.query_entities("ORDER BY id", &[])
    }

    fn children_of(&self, parent_id: EntityId) -> StoreResult<Vec<CanonicalEntity>> {
        self.query_entities("WHERE parent_id = ?1 ORDER BY id", &[&parent_id.0])
    }

    fn list_by_download_state(
        &self,
        state: DownloadState,
        limit: usize,
    ) -> StoreResult<Vec<CanonicalEntity>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        // NULL timestamps sort first, same as Option ordering
        self.query_entities(
            "WHERE download_state = ?1 ORDER BY download_state_changed_at, id LIMIT ?2",
            &[&state.as_str(), &limit],
        )
    }

    fn create(&mut self, draft: EntityDraft) -> StoreResult<CanonicalEntity> {
        if draft.name.trim().is_empty() {
            return Err(StoreError::Invalid("entity name is empty".to_string()));
        }
        let now = Utc::now();
        let attributes = serde_json::to_string(&draft.attributes)?;
        self.conn.execute(
            "INSERT INTO entities (kind, name, name_key, universal_id, isrc, attributes, \
             parent_id, ownership_state, ownership_signals, download_state, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '[]', ?9, ?10, ?10)",
            params![
                draft.kind.as_str(),
                draft.name,
                draft.name_key,
                draft.external_ids.universal,
                draft.external_ids.isrc,
                attributes,
                draft.parent_id.map(|p| p.0),
                OwnershipState::Discovered.as_str(),
                DownloadState::NotNeeded.as_str(),
                to_timestamp(now),
            ],
        )?;
        let id = EntityId(self.conn.last_insert_rowid());
        let entity = draft.into_entity(id, from_timestamp(to_timestamp(now)));
        self.write_providers(&entity)?;
        Ok(entity)
    }

    fn update(&mut self, entity: &CanonicalEntity) -> StoreResult<()> {
        let attributes = serde_json::to_string(&entity.attributes)?;
        let signals = serde_json::to_string(&entity.ownership_signals)?;
        let changed = self.conn.execute(
            "UPDATE entities SET kind = ?2, name = ?3, name_key = ?4, universal_id = ?5, \
             isrc = ?6, attributes = ?7, parent_id = ?8, ownership_state = ?9, \
             ownership_signals = ?10, primary_source = ?11, download_state = ?12, \
             download_state_changed_at = ?13, merged_into = ?14, updated_at = ?15 \
             WHERE id = ?1",
            params![
                entity.id.0,
                entity.kind.as_str(),
                entity.name,
                entity.name_key,
                entity.external_ids.universal,
                entity.external_ids.isrc,
                attributes,
                entity.parent_id.map(|p| p.0),
                entity.ownership_state.as_str(),
                signals,
                entity.primary_source,
                entity.download_state.as_str(),
                entity.download_state_changed_at.map(to_timestamp),
                entity.merged_into.map(|m| m.0),
                to_timestamp(Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(entity.id));
        }
        self.write_providers(entity)
    }

    fn enqueue_review(&mut self, candidate: &DuplicateCandidate) -> StoreResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO review_queue (left_id, right_id, kind, score, queued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                candidate.left.0,
                candidate.right.0,
                candidate.kind.as_str(),
                candidate.score,
                to_timestamp(Utc::now()),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn review_queue(&self) -> StoreResult<Vec<ReviewItem>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT left_id, right_id, kind, score, queued_at FROM review_queue \
             ORDER BY left_id, right_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(left, right, kind, score, queued_at)| {
                let kind = EntityKind::from_db_str(&kind)
                    .ok_or_else(|| StoreError::Invalid(format!("unknown entity kind '{}'", kind)))?;
                Ok(ReviewItem {
                    candidate: DuplicateCandidate::new(kind, EntityId(left), EntityId(right), score),
                    queued_at: from_timestamp(queued_at),
                })
            })
            .collect()
    }

    fn remove_review(&mut self, a: EntityId, b: EntityId) -> StoreResult<()> {
        let (left, right) = if a <= b { (a, b) } else { (b, a) };
        self.conn.execute(
            "DELETE FROM review_queue WHERE left_id = ?1 AND right_id = ?2",
            params![left.0, right.0],
        )?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
