//! Database schema for library.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 0
// =============================================================================

/// Canonical entities. `parent_id` is deliberately not a foreign key: a
/// dangling parent is repaired by the cleanup task, never cascaded.
const ENTITIES_TABLE_V0: Table = Table {
    name: "entities",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("name_key", &SqlType::Text, non_null = true),
        sqlite_column!("universal_id", &SqlType::Text),
        sqlite_column!("isrc", &SqlType::Text),
        sqlite_column!(
            "attributes",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'{}'")
        ),
        sqlite_column!("parent_id", &SqlType::Integer),
        sqlite_column!("ownership_state", &SqlType::Text, non_null = true),
        sqlite_column!(
            "ownership_signals",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'[]'")
        ),
        sqlite_column!("primary_source", &SqlType::Text),
        sqlite_column!("download_state", &SqlType::Text, non_null = true),
        sqlite_column!("download_state_changed_at", &SqlType::Integer),
        sqlite_column!("merged_into", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_entities_kind_name_key", "kind, name_key"),
        ("idx_entities_universal", "kind, universal_id"),
        ("idx_entities_isrc", "isrc"),
        ("idx_entities_parent", "parent_id"),
        (
            "idx_entities_download_state",
            "download_state, download_state_changed_at",
        ),
    ],
    unique_constraints: &[],
};

/// One row per (entity, source) provider id.
const PROVIDER_IDS_TABLE_V0: Table = Table {
    name: "provider_ids",
    columns: &[
        sqlite_column!("entity_id", &SqlType::Integer, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("source", &SqlType::Text, non_null = true),
        sqlite_column!("provider_id", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_provider_ids_lookup", "kind, source, provider_id")],
    unique_constraints: &[&["entity_id", "source"]],
};

/// Duplicate candidates waiting for manual review.
const REVIEW_QUEUE_TABLE_V0: Table = Table {
    name: "review_queue",
    columns: &[
        sqlite_column!("left_id", &SqlType::Integer, non_null = true),
        sqlite_column!("right_id", &SqlType::Integer, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("score", &SqlType::Real, non_null = true),
        sqlite_column!("queued_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["left_id", "right_id"]],
};

pub const LIBRARY_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        ENTITIES_TABLE_V0,
        PROVIDER_IDS_TABLE_V0,
        REVIEW_QUEUE_TABLE_V0,
    ],
    migration: None,
}];
