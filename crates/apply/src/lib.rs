//! Remote secret apply: turn a target classification into per-target actions,
//! run them against a deployer, and plan the effect of upload secrets.

#![forbid(unsafe_code)]

pub mod plan;
pub mod sync;
pub mod upload;

pub use plan::{describe_action, plan, DuplicateTarget, SyncPlan, TargetAction};
pub use sync::{
    cleanup_targets, random_suffix, resolve_secret_name, sync_targets, DeployRequest, DeployedTarget, SyncOutcome,
    TargetDeployer, TargetFailure,
};
pub use upload::{is_upload_secret, plan_upload, UploadAction, UploadError, UploadPlan, UploadSecret};
