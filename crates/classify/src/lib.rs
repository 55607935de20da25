//! Target classification: match the desired targets of a remote secret
//! (`spec.targets`) against the targets recorded in its status.
//!
//! The result says which desired targets already have a synced counterpart,
//! which recorded targets are no longer wanted, and which entries are
//! duplicates of the same `(api url, namespace)` location. The function is
//! pure; the caller turns the result into create/update/delete actions.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};

use rsecret_core::{RemoteSecret, SpecTargetIndex, StatusTargetIndex, TargetIdentity, TargetKey};
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Duplicate spec index -> matched status index (or none).
pub type DuplicateGroup = BTreeMap<SpecTargetIndex, Option<StatusTargetIndex>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetClassification {
    /// Primary (first seen per key) spec index -> matched status index.
    pub sync: BTreeMap<SpecTargetIndex, Option<StatusTargetIndex>>,
    /// Primary spec index -> later spec entries with the same key.
    pub duplicate_specs: BTreeMap<SpecTargetIndex, DuplicateGroup>,
    /// Status entries whose key is not desired at all.
    pub remove: Vec<StatusTargetIndex>,
    /// Status entries whose key is desired but which no spec entry claimed.
    pub orphan_duplicate_statuses: Vec<StatusTargetIndex>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationSummary {
    pub to_create: usize,
    pub to_update: usize,
    pub duplicates: usize,
    pub to_remove: usize,
    pub orphaned: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("spec target {0} is not classified")]
    SpecMissing(SpecTargetIndex),
    #[error("spec target {0} is classified more than once")]
    SpecRepeated(SpecTargetIndex),
    #[error("spec target {0} is out of range")]
    SpecOutOfRange(SpecTargetIndex),
    #[error("status target {0} is claimed more than once")]
    StatusRepeated(StatusTargetIndex),
    #[error("status target {0} is out of range")]
    StatusOutOfRange(StatusTargetIndex),
    #[error("status target {0} is not accounted for")]
    StatusMissing(StatusTargetIndex),
}

#[derive(Default)]
struct Bucket {
    unclaimed: VecDeque<StatusTargetIndex>,
    primary: Option<SpecTargetIndex>,
}

/// Classify `spec` targets against `status` targets.
///
/// Within one key, status entries are claimed in ascending order by spec
/// entries in ascending order: the primary first, then its duplicates.
pub fn classify<S, T>(spec: &[S], status: &[T]) -> TargetClassification
where
    S: TargetIdentity,
    T: TargetIdentity,
{
    let mut buckets: FxHashMap<TargetKey<'_>, Bucket> = FxHashMap::default();
    for (i, st) in status.iter().enumerate() {
        buckets.entry(st.key()).or_default().unclaimed.push_back(StatusTargetIndex(i));
    }

    let mut out = TargetClassification::default();
    for (i, target) in spec.iter().enumerate() {
        let idx = SpecTargetIndex(i);
        let bucket = buckets.entry(target.key()).or_default();
        let matched = bucket.unclaimed.pop_front();
        match bucket.primary {
            None => {
                bucket.primary = Some(idx);
                out.sync.insert(idx, matched);
            }
            Some(primary) => {
                out.duplicate_specs.entry(primary).or_default().insert(idx, matched);
            }
        }
    }

    for bucket in buckets.into_values() {
        let residue = if bucket.primary.is_some() {
            &mut out.orphan_duplicate_statuses
        } else {
            &mut out.remove
        };
        residue.extend(bucket.unclaimed);
    }
    // Bucket iteration order is arbitrary; ascending status order keeps the result deterministic.
    out.remove.sort_unstable();
    out.orphan_duplicate_statuses.sort_unstable();
    out
}

pub fn classify_remote_secret(rs: &RemoteSecret) -> TargetClassification {
    classify(&rs.spec.targets, &rs.status.targets)
}

impl TargetClassification {
    /// `(primary, duplicate, matched status)` in ascending primary, then duplicate order.
    pub fn duplicates(&self) -> impl Iterator<Item = (SpecTargetIndex, SpecTargetIndex, Option<StatusTargetIndex>)> + '_ {
        self.duplicate_specs
            .iter()
            .flat_map(|(p, group)| group.iter().map(move |(d, s)| (*p, *d, *s)))
    }

    /// Status index matched to any spec entry, primary or duplicate.
    pub fn status_for(&self, spec: SpecTargetIndex) -> Option<StatusTargetIndex> {
        if let Some(s) = self.sync.get(&spec) {
            return *s;
        }
        self.duplicate_specs.values().find_map(|g| g.get(&spec).copied().flatten())
    }

    /// Nothing to create, remove or report: every desired location maps to exactly one status entry.
    pub fn is_converged(&self) -> bool {
        self.sync.values().all(Option::is_some)
            && self.duplicate_specs.is_empty()
            && self.remove.is_empty()
            && self.orphan_duplicate_statuses.is_empty()
    }

    pub fn summary(&self) -> ClassificationSummary {
        let to_update = self.sync.values().filter(|s| s.is_some()).count();
        ClassificationSummary {
            to_create: self.sync.len() - to_update,
            to_update,
            duplicates: self.duplicate_specs.values().map(|g| g.len()).sum(),
            to_remove: self.remove.len(),
            orphaned: self.orphan_duplicate_statuses.len(),
        }
    }

    /// Check the coverage invariants against the lengths of the classified lists.
    pub fn verify(&self, spec_len: usize, status_len: usize) -> Result<(), InvariantViolation> {
        let mut spec_seen = vec![false; spec_len];
        let spec_indices = self
            .sync
            .keys()
            .chain(self.duplicate_specs.values().flat_map(|g| g.keys()));
        for idx in spec_indices {
            let slot = spec_seen.get_mut(idx.0).ok_or(InvariantViolation::SpecOutOfRange(*idx))?;
            if *slot {
                return Err(InvariantViolation::SpecRepeated(*idx));
            }
            *slot = true;
        }
        if let Some(missing) = spec_seen.iter().position(|seen| !seen) {
            return Err(InvariantViolation::SpecMissing(SpecTargetIndex(missing)));
        }

        let mut status_seen = vec![false; status_len];
        let status_indices = self
            .sync
            .values()
            .flatten()
            .chain(self.duplicate_specs.values().flat_map(|g| g.values().flatten()))
            .chain(self.remove.iter())
            .chain(self.orphan_duplicate_statuses.iter());
        for idx in status_indices {
            let slot = status_seen.get_mut(idx.0).ok_or(InvariantViolation::StatusOutOfRange(*idx))?;
            if *slot {
                return Err(InvariantViolation::StatusRepeated(*idx));
            }
            *slot = true;
        }
        if let Some(missing) = status_seen.iter().position(|seen| !seen) {
            return Err(InvariantViolation::StatusMissing(StatusTargetIndex(missing)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsecret_core::{RemoteSecretTarget, TargetStatus};

    fn spec(ns: &[&str]) -> Vec<RemoteSecretTarget> {
        ns.iter().map(|n| RemoteSecretTarget::local(*n)).collect()
    }

    fn status(ns: &[&str]) -> Vec<TargetStatus> {
        ns.iter().map(|n| TargetStatus { namespace: n.to_string(), ..Default::default() }).collect()
    }

    #[test]
    fn converged_when_one_to_one() {
        let c = classify(&spec(&["a", "b"]), &status(&["b", "a"]));
        assert!(c.is_converged());
        assert_eq!(c.summary(), ClassificationSummary { to_update: 2, ..Default::default() });
    }

    #[test]
    fn summary_counts_every_bucket() {
        let c = classify(&spec(&["a", "a", "c"]), &status(&["a", "b", "a", "a"]));
        let s = c.summary();
        assert_eq!(s.to_update, 1);
        assert_eq!(s.to_create, 1);
        assert_eq!(s.duplicates, 1);
        assert_eq!(s.to_remove, 1);
        assert_eq!(s.orphaned, 1);
        assert!(!c.is_converged());
        c.verify(3, 4).unwrap();
    }

    #[test]
    fn status_for_resolves_duplicates() {
        let c = classify(&spec(&["a", "a"]), &status(&["a", "a"]));
        assert_eq!(c.status_for(SpecTargetIndex(0)), Some(StatusTargetIndex(0)));
        assert_eq!(c.status_for(SpecTargetIndex(1)), Some(StatusTargetIndex(1)));
        assert_eq!(c.status_for(SpecTargetIndex(7)), None);
        let dups: Vec<_> = c.duplicates().collect();
        assert_eq!(dups, vec![(SpecTargetIndex(0), SpecTargetIndex(1), Some(StatusTargetIndex(1)))]);
    }

    #[test]
    fn verify_flags_tampered_results() {
        let mut c = classify(&spec(&["a"]), &status(&["a", "b"]));
        c.remove.push(StatusTargetIndex(0));
        assert_eq!(c.verify(1, 2), Err(InvariantViolation::StatusRepeated(StatusTargetIndex(0))));

        let c = classify(&spec(&["a"]), &status(&["a"]));
        assert_eq!(c.verify(2, 1), Err(InvariantViolation::SpecMissing(SpecTargetIndex(1))));
    }

    #[test]
    fn serializes_to_json_maps() {
        let c = classify(&spec(&["a", "b"]), &status(&["b"]));
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["sync"]["0"], serde_json::Value::Null);
        assert_eq!(v["sync"]["1"], 0);
    }
}
