#![forbid(unsafe_code)]

//! Randomized checks of the classification invariants over small key alphabets,
//! so that duplicates and reorderings are frequent.

use std::collections::HashMap;

use rsecret_classify::{classify, TargetClassification};
use rsecret_core::{RemoteSecretTarget, SpecTargetIndex, StatusTargetIndex, TargetIdentity, TargetStatus};

/// Small deterministic generator (64-bit LCG); keeps the tests reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
    fn below(&mut self, n: u64) -> usize { (self.next() % n) as usize }
}

const CLUSTERS: [&str; 3] = ["", "https://c1", "https://c2"];
const NAMESPACES: [&str; 3] = ["ns_a", "ns_b", "ns_c"];

fn random_lists(rng: &mut Lcg) -> (Vec<RemoteSecretTarget>, Vec<TargetStatus>) {
    let spec_len = rng.below(7);
    let status_len = rng.below(7);
    let spec = (0..spec_len)
        .map(|_| RemoteSecretTarget::in_cluster(CLUSTERS[rng.below(3)], NAMESPACES[rng.below(3)]))
        .collect();
    let status = (0..status_len)
        .map(|i| TargetStatus {
            namespace: NAMESPACES[rng.below(3)].into(),
            api_url: CLUSTERS[rng.below(3)].into(),
            secret_name: format!("sec{}", i),
            ..Default::default()
        })
        .collect();
    (spec, status)
}

fn matched_count(c: &TargetClassification) -> usize {
    c.sync.values().filter(|s| s.is_some()).count()
        + c.duplicate_specs.values().flat_map(|g| g.values()).filter(|s| s.is_some()).count()
}

#[test]
fn coverage_and_disjointness_hold() {
    let mut rng = Lcg(7);
    for _ in 0..2000 {
        let (spec, status) = random_lists(&mut rng);
        let c = classify(&spec, &status);
        c.verify(spec.len(), status.len()).unwrap_or_else(|e| panic!("{e}: spec={spec:?} status={status:?}"));
        assert_eq!(
            c.remove.len() + c.orphan_duplicate_statuses.len() + matched_count(&c),
            status.len()
        );
    }
}

#[test]
fn classification_is_deterministic() {
    let mut rng = Lcg(42);
    for _ in 0..500 {
        let (spec, status) = random_lists(&mut rng);
        assert_eq!(classify(&spec, &status), classify(&spec, &status));
    }
}

#[test]
fn matches_respect_key_and_order() {
    let mut rng = Lcg(99);
    for _ in 0..2000 {
        let (spec, status) = random_lists(&mut rng);
        let c = classify(&spec, &status);

        // (spec index, status index) pairs in spec order.
        let mut claims: Vec<(SpecTargetIndex, StatusTargetIndex)> = c
            .sync
            .iter()
            .filter_map(|(sp, st)| st.map(|st| (*sp, st)))
            .chain(c.duplicates().filter_map(|(_, d, st)| st.map(|st| (d, st))))
            .collect();
        claims.sort();

        let mut last_per_key: HashMap<_, StatusTargetIndex> = HashMap::new();
        for (sp, st) in claims {
            let key = spec[sp.0].key();
            assert_eq!(key, status[st.0].key(), "matched across keys");
            if let Some(prev) = last_per_key.insert(key, st) {
                assert!(prev < st, "status consumed out of order for {key}");
            }
        }

        // Primaries are the first spec entry of each key; unmatched spec entries imply an exhausted key.
        for (p, group) in &c.duplicate_specs {
            for d in group.keys() {
                assert!(p < d);
                assert_eq!(spec[p.0].key(), spec[d.0].key());
            }
        }
        for (p, st) in &c.sync {
            if st.is_none() {
                assert!(status.iter().all(|s| s.key() != spec[p.0].key()));
            }
        }
        for (_, d, st) in c.duplicates() {
            if st.is_none() {
                let key = spec[d.0].key();
                assert!(c.orphan_duplicate_statuses.iter().all(|o| status[o.0].key() != key));
            }
        }
        for st in &c.remove {
            assert!(spec.iter().all(|t| t.key() != status[st.0].key()));
        }
        for st in &c.orphan_duplicate_statuses {
            assert!(spec.iter().any(|t| t.key() == status[st.0].key()));
        }
    }
}

#[test]
fn residue_lists_are_ascending() {
    let mut rng = Lcg(3);
    for _ in 0..500 {
        let (spec, status) = random_lists(&mut rng);
        let c = classify(&spec, &status);
        assert!(c.remove.windows(2).all(|w| w[0] < w[1]));
        assert!(c.orphan_duplicate_statuses.windows(2).all(|w| w[0] < w[1]));
    }
}
