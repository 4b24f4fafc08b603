//! Fuzzy duplicate detection.

use super::merge::has_identity_conflict;
use super::similarity::name_similarity;
use crate::library_store::{
    CanonicalEntity, DuplicateCandidate, EntityId, EntityKind, LibrarySession, StoreResult,
};
use std::collections::BTreeMap;

/// Pairs of `kind` entities whose names are at least `min_similarity` alike,
/// most similar first.
///
/// Entities with a universal id are trusted to be distinct and are left out.
/// Comparison only happens within a bucket: same first character of the
/// normalized name and same parent, so that two "Intro" tracks on different
/// albums are not paired.
pub fn find_candidates(
    session: &dyn LibrarySession,
    kind: EntityKind,
    min_similarity: f64,
) -> StoreResult<Vec<DuplicateCandidate>> {
    let mut buckets: BTreeMap<(Option<char>, Option<EntityId>), Vec<CanonicalEntity>> =
        BTreeMap::new();
    for entity in session.list_by_kind(kind)? {
        if entity.merged_into.is_some() || entity.external_ids.universal.is_some() {
            continue;
        }
        let first = entity.name_key.chars().next();
        buckets
            .entry((first, entity.parent_id))
            .or_default()
            .push(entity);
    }

    let mut candidates = Vec::new();
    for bucket in buckets.values() {
        for (i, a) in bucket.iter().enumerate() {
            for b in &bucket[i + 1..] {
                if has_identity_conflict(&a.external_ids, &b.external_ids) {
                    continue;
                }
                let score = name_similarity(&a.name_key, &b.name_key);
                if score >= min_similarity {
                    candidates.push(DuplicateCandidate::new(kind, a.id, b.id, score));
                }
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.left.cmp(&b.left))
            .then(a.right.cmp(&b.right))
    });
    Ok(candidates)
}

/// Which of two duplicates survives a merge: the owned one, then the one
/// known to more sources, then the older one.
pub fn pick_survivor(a: &CanonicalEntity, b: &CanonicalEntity) -> (EntityId, EntityId) {
    let rank = |e: &CanonicalEntity| {
        (
            e.is_owned(),
            e.external_ids.providers.len(),
            std::cmp::Reverse(e.id),
        )
    };
    if rank(a) >= rank(b) {
        (a.id, b.id)
    } else {
        (b.id, a.id)
    }
}
