//! Additive merging of entity data.

use crate::library_store::{CanonicalEntity, EntityId, ExternalIds};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Two id sets that cannot describe the same thing: both carry a universal
/// id, an ISRC or the same source's provider id, with different values.
pub fn has_identity_conflict(a: &ExternalIds, b: &ExternalIds) -> bool {
    fn differ(a: &Option<String>, b: &Option<String>) -> bool {
        matches!((a, b), (Some(x), Some(y)) if x != y)
    }

    differ(&a.universal, &b.universal)
        || differ(&a.isrc, &b.isrc)
        || a
            .providers
            .iter()
            .any(|(source, id)| b.providers.get(source).is_some_and(|other| other != id))
}

/// Fill whatever `target` is missing from the given ids, attributes and
/// parent. Populated fields are left alone. Returns whether anything changed.
pub(crate) fn absorb(
    target: &mut CanonicalEntity,
    external_ids: &ExternalIds,
    attributes: &BTreeMap<String, JsonValue>,
    parent_id: Option<EntityId>,
) -> bool {
    let mut changed = false;

    if target.external_ids.universal.is_none() && external_ids.universal.is_some() {
        target.external_ids.universal = external_ids.universal.clone();
        changed = true;
    }
    if target.kind.is_leaf() && target.external_ids.isrc.is_none() && external_ids.isrc.is_some() {
        target.external_ids.isrc = external_ids.isrc.clone();
        changed = true;
    }
    for (source, id) in &external_ids.providers {
        if !target.external_ids.providers.contains_key(source) {
            target
                .external_ids
                .providers
                .insert(source.clone(), id.clone());
            changed = true;
        }
    }
    for (key, value) in attributes {
        if !target.attributes.contains_key(key) {
            target.attributes.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    if target.parent_id.is_none() && parent_id.is_some() {
        target.parent_id = parent_id;
        changed = true;
    }

    changed
}

/// Merge `incoming` into a copy of `existing`.
///
/// Identity, name and lifecycle state stay `existing`'s. Ids and attributes
/// only get added, ownership signals are united.
pub fn merge_entities(existing: &CanonicalEntity, incoming: &CanonicalEntity) -> CanonicalEntity {
    let mut merged = existing.clone();
    absorb(
        &mut merged,
        &incoming.external_ids,
        &incoming.attributes,
        incoming.parent_id,
    );
    merged
        .ownership_signals
        .extend(incoming.ownership_signals.iter().cloned());
    if merged.primary_source.is_none() {
        merged.primary_source = incoming.primary_source.clone();
    }
    merged
}
