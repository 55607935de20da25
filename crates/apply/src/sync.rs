//! Execute a sync plan against a [`TargetDeployer`] and compute the next observed status.

use anyhow::Result;
use metrics::counter;
use rsecret_core::{
    Condition, ConditionReason, ConditionStatus, ConditionType, LinkableSecretSpec, ObjectKey, RemoteSecret,
    RemoteSecretTarget, SecretData, TargetIdentity, TargetStatus,
};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::plan::{plan, DuplicateTarget, TargetAction};

/// Everything a deployer needs to materialize the secret in one target.
#[derive(Debug, Clone)]
pub struct DeployRequest<'a> {
    pub owner: &'a ObjectKey,
    pub target: &'a RemoteSecretTarget,
    /// Status entry recorded by the previous pass, if any.
    pub previous: Option<&'a TargetStatus>,
    pub secret_name: String,
    pub secret: &'a LinkableSecretSpec,
    pub data: &'a SecretData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployedTarget {
    pub secret_name: String,
    pub service_account_names: SmallVec<[String; 4]>,
}

/// Performs the writes against a target cluster. Every call is independent and idempotent.
#[async_trait::async_trait]
pub trait TargetDeployer: Send + Sync {
    async fn deploy(&self, req: &DeployRequest<'_>) -> Result<DeployedTarget>;

    /// Delete the secret recorded in `status` and unlink it from its service accounts.
    /// A secret that is already gone is not an error.
    async fn undeploy(&self, owner: &ObjectKey, status: &TargetStatus) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub location: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// The next `status.targets`: primaries in spec order, then entries whose removal failed.
    pub targets: Vec<TargetStatus>,
    pub deployed: usize,
    pub removed: usize,
    pub failures: Vec<TargetFailure>,
    pub duplicates: Vec<DuplicateTarget>,
}

impl SyncOutcome {
    pub fn deployed_condition(&self) -> Condition {
        let (status, reason, message) = if !self.failures.is_empty() {
            let reason = if self.deployed == 0 { ConditionReason::Error } else { ConditionReason::PartiallyInjected };
            let msg = self
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.location, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            (ConditionStatus::False, reason, msg)
        } else if !self.duplicates.is_empty() {
            let msg = self
                .duplicates
                .iter()
                .map(|d| format!("target {} duplicates target {} ({})", d.duplicate, d.primary, d.location))
                .collect::<Vec<_>>()
                .join("; ");
            (ConditionStatus::False, ConditionReason::DuplicateTargets, msg)
        } else if self.deployed == 0 {
            (ConditionStatus::False, ConditionReason::NoTargets, "no targets specified".to_string())
        } else {
            (ConditionStatus::True, ConditionReason::Injected, format!("deployed to {} target(s)", self.deployed))
        };
        Condition::new(ConditionType::Deployed, status, reason, message)
    }
}

/// Pick the name of the secret deployed for a target.
///
/// A name recorded by an earlier pass wins, then `spec.secret.name`, then
/// `generateName` (or `<owner>-`) followed by `suffix()`.
pub fn resolve_secret_name(
    spec: &LinkableSecretSpec,
    previous: Option<&TargetStatus>,
    owner_name: &str,
    suffix: impl FnOnce() -> String,
) -> String {
    if let Some(prev) = previous.filter(|p| !p.secret_name.is_empty()) {
        return prev.secret_name.clone();
    }
    if let Some(name) = spec.name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let prefix = match spec.generate_name.as_deref().filter(|g| !g.is_empty()) {
        Some(g) => g.to_string(),
        None => format!("{}-", owner_name),
    };
    format!("{}{}", prefix, suffix())
}

pub fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..5].to_string()
}

/// Run one sync pass. Failures are recorded per target and never stop the other targets.
pub async fn sync_targets(rs: &RemoteSecret, data: &SecretData, deployer: &dyn TargetDeployer) -> SyncOutcome {
    let plan = plan(rs);
    let owner = rs.key();
    let mut out = SyncOutcome { duplicates: plan.duplicates.clone(), ..Default::default() };
    let mut retained: Vec<TargetStatus> = Vec::new();

    for action in &plan.actions {
        match *action {
            TargetAction::Deploy { spec, existing } => {
                let target = &rs.spec.targets[spec.0];
                let previous = existing.map(|i| &rs.status.targets[i.0]);
                let req = DeployRequest {
                    owner: &owner,
                    target,
                    previous,
                    secret_name: resolve_secret_name(&rs.spec.secret, previous, &rs.metadata.name, random_suffix),
                    secret: &rs.spec.secret,
                    data,
                };
                match deployer.deploy(&req).await {
                    Ok(d) => {
                        counter!("target_deploy_ok", 1u64);
                        debug!(rs = %owner, target = %target.key(), secret = %d.secret_name, "target deployed");
                        out.deployed += 1;
                        out.targets.push(TargetStatus {
                            namespace: target.namespace.clone(),
                            api_url: target.api_url.clone(),
                            secret_name: d.secret_name,
                            service_account_names: d.service_account_names,
                            error: None,
                        });
                    }
                    Err(e) => {
                        counter!("target_deploy_err", 1u64);
                        warn!(rs = %owner, target = %target.key(), error = %e, "target deploy failed");
                        let mut st = previous.cloned().unwrap_or_else(|| TargetStatus::for_target(target));
                        // the deployer may have written the secret before failing; keep its name
                        // so the next pass reuses it and cleanup can find it
                        if st.secret_name.is_empty() {
                            st.secret_name = req.secret_name.clone();
                        }
                        st.error = Some(format!("{:#}", e));
                        out.failures.push(TargetFailure { location: target.key().to_string(), error: format!("{:#}", e) });
                        out.targets.push(st);
                    }
                }
            }
            TargetAction::Remove { status } | TargetAction::Retire { status, delete_secret: true } => {
                let st = &rs.status.targets[status.0];
                if st.secret_name.is_empty() {
                    // nothing was ever deployed for this entry
                    continue;
                }
                match deployer.undeploy(&owner, st).await {
                    Ok(()) => {
                        counter!("target_remove_ok", 1u64);
                        debug!(rs = %owner, target = %st.key(), secret = %st.secret_name, "target removed");
                        out.removed += 1;
                    }
                    Err(e) => {
                        counter!("target_remove_err", 1u64);
                        warn!(rs = %owner, target = %st.key(), error = %e, "target removal failed");
                        let mut kept = st.clone();
                        kept.error = Some(format!("{:#}", e));
                        out.failures.push(TargetFailure { location: st.key().to_string(), error: format!("{:#}", e) });
                        retained.push(kept);
                    }
                }
            }
            TargetAction::Retire { status, delete_secret: false } => {
                debug!(rs = %owner, target = %rs.status.targets[status.0].key(), "dropping surplus status entry");
            }
        }
    }

    out.targets.extend(retained);
    out
}

/// Undeploy every recorded target. Returns the entries that could not be cleaned up.
pub async fn cleanup_targets(rs: &RemoteSecret, deployer: &dyn TargetDeployer) -> Vec<TargetStatus> {
    let owner = rs.key();
    let mut left = Vec::new();
    for st in &rs.status.targets {
        if st.secret_name.is_empty() {
            continue;
        }
        if let Err(e) = deployer.undeploy(&owner, st).await {
            counter!("target_remove_err", 1u64);
            warn!(rs = %owner, target = %st.key(), error = %e, "cleanup failed");
            let mut kept = st.clone();
            kept.error = Some(format!("{:#}", e));
            left.push(kept);
        }
    }
    left
}
