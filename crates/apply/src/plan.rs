//! Translate a target classification into concrete per-target actions.

use rsecret_classify::{classify_remote_secret, TargetClassification};
use rsecret_core::{RemoteSecret, SpecTargetIndex, StatusTargetIndex, TargetIdentity, TargetKey};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum TargetAction {
    /// Create (no `existing`) or refresh the secret of a primary spec target.
    Deploy { spec: SpecTargetIndex, existing: Option<StatusTargetIndex> },
    /// The location is no longer desired: delete its secret and drop the status entry.
    Remove { status: StatusTargetIndex },
    /// Surplus status entry for a desired location. Its secret is deleted only
    /// when it differs from the one kept by the primary target.
    Retire { status: StatusTargetIndex, delete_secret: bool },
}

/// A desired target repeating the location of an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateTarget {
    pub primary: SpecTargetIndex,
    pub duplicate: SpecTargetIndex,
    pub matched: Option<StatusTargetIndex>,
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub actions: Vec<TargetAction>,
    pub duplicates: Vec<DuplicateTarget>,
    #[serde(skip)]
    pub classification: TargetClassification,
}

impl SyncPlan {
    pub fn deploys(&self) -> impl Iterator<Item = (SpecTargetIndex, Option<StatusTargetIndex>)> + '_ {
        self.actions.iter().filter_map(|a| match *a {
            TargetAction::Deploy { spec, existing } => Some((spec, existing)),
            _ => None,
        })
    }

    pub fn is_noop_for_status(&self) -> bool {
        self.actions.iter().all(|a| matches!(a, TargetAction::Deploy { existing: Some(_), .. }))
    }
}

/// Plan the actions for one pass over `rs`.
///
/// Deploys come first in spec order, followed by removals and retirements in
/// ascending status order.
pub fn plan(rs: &RemoteSecret) -> SyncPlan {
    let classification = classify_remote_secret(rs);
    let spec = &rs.spec.targets;
    let status = &rs.status.targets;

    let mut actions: Vec<TargetAction> = classification
        .sync
        .iter()
        .map(|(s, existing)| TargetAction::Deploy { spec: *s, existing: *existing })
        .collect();
    actions.extend(classification.remove.iter().map(|s| TargetAction::Remove { status: *s }));

    let mut surplus: Vec<StatusTargetIndex> = classification
        .duplicates()
        .filter_map(|(_, _, matched)| matched)
        .chain(classification.orphan_duplicate_statuses.iter().copied())
        .collect();
    surplus.sort_unstable();
    for idx in surplus {
        let st = &status[idx.0];
        let kept = kept_secret_name(rs, &classification, st.key());
        let delete_secret = !st.secret_name.is_empty() && kept != Some(st.secret_name.as_str());
        actions.push(TargetAction::Retire { status: idx, delete_secret });
    }

    let duplicates = classification
        .duplicates()
        .map(|(primary, duplicate, matched)| DuplicateTarget {
            primary,
            duplicate,
            matched,
            location: spec[duplicate.0].key().to_string(),
        })
        .collect();

    SyncPlan { actions, duplicates, classification }
}

/// Name the primary target of `key` deploys under in this pass, when it is
/// known up front. A generated name is always fresh and never collides.
fn kept_secret_name<'a>(rs: &'a RemoteSecret, c: &TargetClassification, key: TargetKey<'_>) -> Option<&'a str> {
    let (_, matched) = c.sync.iter().find(|(s, _)| rs.spec.targets[s.0].key() == key)?;
    let previous = matched.map(|m| rs.status.targets[m.0].secret_name.as_str()).filter(|n| !n.is_empty());
    previous.or_else(|| rs.spec.secret.name.as_deref().filter(|n| !n.is_empty()))
}

/// Human readable one-liner, e.g. `deploy ns_a (new)`.
pub fn describe_action(rs: &RemoteSecret, action: &TargetAction) -> String {
    match *action {
        TargetAction::Deploy { spec, existing: None } => {
            format!("deploy {} (new)", rs.spec.targets[spec.0].key())
        }
        TargetAction::Deploy { spec, existing: Some(st) } => {
            let name = &rs.status.targets[st.0].secret_name;
            format!("deploy {} (update {})", rs.spec.targets[spec.0].key(), if name.is_empty() { "-" } else { name.as_str() })
        }
        TargetAction::Remove { status } => {
            let st = &rs.status.targets[status.0];
            format!("remove {} ({})", st.key(), if st.secret_name.is_empty() { "-" } else { st.secret_name.as_str() })
        }
        TargetAction::Retire { status, delete_secret } => {
            let st = &rs.status.targets[status.0];
            if delete_secret {
                format!("retire {} (delete {})", st.key(), st.secret_name)
            } else {
                format!("retire {} (status only)", st.key())
            }
        }
    }
}
