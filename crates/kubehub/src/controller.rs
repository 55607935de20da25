//! Reconcile loop: finalizer handling, data lookup, target sync and status
//! write-back, plus processing of upload secrets.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, DynamicObject, Patch, PatchParams, PostParams},
    core::ObjectMeta,
    Client,
};
use metrics::{counter, histogram};
use rsecret_apply::{cleanup_targets, plan_upload, sync_targets, UploadAction, UploadSecret};
use rsecret_core::{
    set_condition, Condition, ConditionReason, ConditionStatus, ConditionType, ObjectKey, RemoteSecret,
    RemoteSecretStatus, CLEANUP_FINALIZER,
};
use rsecret_store::spawn_queue;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{datastore::DataStore, deploy::KubeDeployer, remote_secret_api, remote_secret_from_dynamic, start_watchers};

/// Shared state of the reconcile workers.
pub struct Context {
    pub client: Client,
    pub deployer: KubeDeployer,
    pub data: DataStore,
    pub field_manager: String,
    /// Restrict watches to one namespace.
    pub namespace: Option<String>,
}

/// One reconcile pass for `key`.
pub async fn reconcile(ctx: Arc<Context>, key: ObjectKey) -> Result<()> {
    let t0 = Instant::now();
    counter!("reconcile_total", 1u64);
    let res = reconcile_inner(&ctx, &key).await;
    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    if let Err(e) = &res {
        counter!("reconcile_err", 1u64);
        warn!(rs = %key, error = %format!("{:#}", e), "reconcile failed");
    }
    res
}

async fn reconcile_inner(ctx: &Context, key: &ObjectKey) -> Result<()> {
    let api = remote_secret_api(ctx.client.clone(), Some(&key.namespace));
    let Some(obj) = api.get_opt(&key.name).await.with_context(|| format!("reading remote secret {}", key))? else {
        debug!(rs = %key, "remote secret gone");
        return Ok(());
    };
    let rs = remote_secret_from_dynamic(&obj)?;

    if rs.is_being_deleted() {
        return finalize(ctx, &api, &rs).await;
    }
    if !rs.has_finalizer(CLEANUP_FINALIZER) {
        let mut finalizers = rs.metadata.finalizers.clone();
        finalizers.push(CLEANUP_FINALIZER.to_string());
        patch_finalizers(&api, &rs, finalizers).await?;
    }

    let mut status = rs.status.clone();
    let mut failed_targets = 0;
    match ctx.data.load(key).await? {
        None => {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    ConditionType::DataObtained,
                    ConditionStatus::False,
                    ConditionReason::AwaitingData,
                    "no secret data uploaded yet",
                ),
            );
        }
        Some(data) => {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    ConditionType::DataObtained,
                    ConditionStatus::True,
                    ConditionReason::DataFound,
                    "secret data found",
                ),
            );
            let outcome = sync_targets(&rs, &data, &ctx.deployer).await;
            info!(
                rs = %key,
                deployed = outcome.deployed,
                removed = outcome.removed,
                failures = outcome.failures.len(),
                duplicates = outcome.duplicates.len(),
                "targets synced"
            );
            set_condition(&mut status.conditions, outcome.deployed_condition());
            failed_targets = outcome.failures.len();
            status.targets = outcome.targets;
        }
    }

    if status != rs.status {
        patch_status(&api, key, &status).await?;
    }
    // an unchanged status produces no watch event; fail the pass so the queue retries it
    if failed_targets > 0 {
        return Err(anyhow!("{} target(s) of {} failed", failed_targets, key));
    }
    Ok(())
}

async fn finalize(ctx: &Context, api: &Api<DynamicObject>, rs: &RemoteSecret) -> Result<()> {
    if !rs.has_finalizer(CLEANUP_FINALIZER) {
        return Ok(());
    }
    let key = rs.key();
    let left = cleanup_targets(rs, &ctx.deployer).await;
    if !left.is_empty() {
        let n = left.len();
        let status = RemoteSecretStatus { conditions: rs.status.conditions.clone(), targets: left };
        patch_status(api, &key, &status).await?;
        return Err(anyhow!("{} target(s) of {} could not be cleaned up", n, key));
    }
    ctx.data.delete(&key).await?;
    let finalizers = rs.metadata.finalizers.iter().filter(|f| f.as_str() != CLEANUP_FINALIZER).cloned().collect();
    patch_finalizers(api, rs, finalizers).await?;
    info!(rs = %key, "remote secret finalized");
    Ok(())
}

async fn patch_finalizers(api: &Api<DynamicObject>, rs: &RemoteSecret, finalizers: Vec<String>) -> Result<()> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": rs.metadata.resource_version,
        }
    });
    api.patch(&rs.metadata.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("updating finalizers of {}", rs.key()))?;
    Ok(())
}

async fn patch_status(api: &Api<DynamicObject>, key: &ObjectKey, status: &RemoteSecretStatus) -> Result<()> {
    let patch = json!({ "status": status });
    api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("writing status of {}", key))?;
    Ok(())
}

pub fn upload_from_secret(secret: &Secret) -> Result<UploadSecret> {
    let meta = &secret.metadata;
    Ok(UploadSecret {
        namespace: meta.namespace.clone().ok_or_else(|| anyhow!("upload secret without namespace"))?,
        name: meta.name.clone().ok_or_else(|| anyhow!("upload secret without name"))?,
        type_: secret.type_.clone(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        data: secret.data.clone().unwrap_or_default().into_iter().map(|(k, v)| (k, v.0)).collect(),
    })
}

/// Apply an upload secret to its remote secret and delete the upload.
///
/// Returns the remote secret to reconcile. A rejected upload is deleted too
/// and reported with an `Error` event named after it.
pub async fn process_upload(ctx: &Context, secret: Secret) -> Result<ObjectKey> {
    let upload = upload_from_secret(&secret)?;
    let res = apply_upload(ctx, &upload).await;
    match &res {
        Ok(key) => {
            counter!("upload_ok", 1u64);
            info!(upload = %upload.name, rs = %key, "upload processed");
        }
        Err(e) => {
            counter!("upload_err", 1u64);
            let message = format!("{:#}", e);
            warn!(upload = %upload.name, ns = %upload.namespace, error = %message, "upload rejected");
            if let Err(ev) = record_upload_error(ctx, &secret, &message).await {
                warn!(upload = %upload.name, error = %ev, "failed to record upload event");
            }
        }
    }
    let uploads: Api<Secret> = Api::namespaced(ctx.client.clone(), &upload.namespace);
    match uploads.delete(&upload.name, &Default::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => warn!(upload = %upload.name, error = %e, "failed to delete upload secret"),
    }
    res
}

async fn apply_upload(ctx: &Context, upload: &UploadSecret) -> Result<ObjectKey> {
    let api = remote_secret_api(ctx.client.clone(), Some(&upload.namespace));
    let existing = match upload.remote_secret_name() {
        Some(name) => api.get_opt(name).await?.map(|o| remote_secret_from_dynamic(&o)).transpose()?,
        None => None,
    };
    let plan = plan_upload(upload, existing.as_ref())?;
    let key = plan.remote_secret.key();

    let uid = match plan.action {
        UploadAction::Create => {
            let obj: DynamicObject =
                serde_json::from_value(plan.remote_secret.to_manifest()?).context("encoding remote secret")?;
            let created = api.create(&PostParams::default(), &obj).await.with_context(|| format!("creating {}", key))?;
            debug!(rs = %key, "remote secret created from upload");
            created.metadata.uid
        }
        UploadAction::Update => {
            let patch = targets_patch(&plan.remote_secret)?;
            let patched = api
                .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .with_context(|| format!("updating targets of {}", key))?;
            debug!(rs = %key, "target added from upload");
            patched.metadata.uid
        }
        UploadAction::DataOnly => plan.remote_secret.metadata.uid.clone(),
    };

    if !plan.data.is_empty() {
        ctx.data.store(&key, uid.as_deref(), &plan.data).await?;
    }
    Ok(key)
}

/// Merge patch replacing `spec.targets` only, guarded by the observed resource version.
pub fn targets_patch(rs: &RemoteSecret) -> Result<serde_json::Value> {
    Ok(json!({
        "metadata": { "resourceVersion": rs.metadata.resource_version },
        "spec": { "targets": serde_json::to_value(&rs.spec.targets)? },
    }))
}

pub fn upload_error_event(secret: &Secret, message: &str, component: &str) -> Event {
    let now = Time(Utc::now());
    Event {
        metadata: ObjectMeta {
            name: secret.metadata.name.clone(),
            namespace: secret.metadata.namespace.clone(),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Secret".to_string()),
            name: secret.metadata.name.clone(),
            namespace: secret.metadata.namespace.clone(),
            uid: secret.metadata.uid.clone(),
            ..Default::default()
        },
        type_: Some("Error".to_string()),
        reason: Some("UploadFailed".to_string()),
        message: Some(message.to_string()),
        count: Some(1),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        source: Some(EventSource { component: Some(component.to_string()), host: None }),
        ..Default::default()
    }
}

async fn record_upload_error(ctx: &Context, secret: &Secret, message: &str) -> Result<()> {
    let ev = upload_error_event(secret, message, &ctx.field_manager);
    let ns = ev.metadata.namespace.clone().ok_or_else(|| anyhow!("upload secret without namespace"))?;
    let name = ev.metadata.name.clone().ok_or_else(|| anyhow!("upload secret without name"))?;
    let events: Api<Event> = Api::namespaced(ctx.client.clone(), &ns);
    events
        .patch(&name, &PatchParams::apply(&ctx.field_manager).force(), &Patch::Apply(&ev))
        .await
        .with_context(|| format!("recording event {}/{}", ns, name))?;
    Ok(())
}

/// Run watchers, the reconcile queue and upload processing until `shutdown` resolves.
pub async fn run(ctx: Arc<Context>, workers: usize, queue_cap: usize, shutdown: impl Future<Output = ()>) -> Result<()> {
    let queue = spawn_queue(queue_cap, workers, {
        let ctx = Arc::clone(&ctx);
        move |key| reconcile(Arc::clone(&ctx), key)
    });

    let (upload_tx, mut upload_rx) = mpsc::channel::<Secret>(queue_cap.max(1));
    let watchers = start_watchers(ctx.client.clone(), ctx.namespace.clone(), queue.sender(), upload_tx);
    info!(workers, queue_cap, ns = ?ctx.namespace, "controller started");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            maybe = upload_rx.recv() => {
                let Some(secret) = maybe else {
                    warn!("upload watcher stopped");
                    break;
                };
                if let Ok(key) = process_upload(&ctx, secret).await {
                    queue.enqueue(key).await?;
                }
            }
        }
    }

    for w in watchers {
        w.abort();
    }
    let stats = queue.stats();
    info!(completed = stats.completed, failed = stats.failed, coalesced = stats.coalesced, "controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use rsecret_core::{REMOTE_SECRET_NAME_ANNOTATION, UPLOAD_SECRET_LABEL, UPLOAD_SECRET_LABEL_VALUE};
    use std::collections::BTreeMap;

    fn upload_secret() -> Secret {
        let mut labels = BTreeMap::new();
        labels.insert(UPLOAD_SECRET_LABEL.to_string(), UPLOAD_SECRET_LABEL_VALUE.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(REMOTE_SECRET_NAME_ANNOTATION.to_string(), "test-remote-secret".to_string());
        let mut data = BTreeMap::new();
        data.insert("a".to_string(), ByteString(b"b".to_vec()));
        Secret {
            metadata: ObjectMeta {
                name: Some("test-remote-secret-upload".into()),
                namespace: Some("default".into()),
                uid: Some("uid-9".into()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            type_: Some("Opaque".into()),
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn converts_upload_secret() {
        let u = upload_from_secret(&upload_secret()).unwrap();
        assert_eq!(u.namespace, "default");
        assert_eq!(u.remote_secret_name(), Some("test-remote-secret"));
        assert_eq!(u.effective_type(), "Opaque");
        assert_eq!(u.data.get("a").map(Vec::as_slice), Some(&b"b"[..]));
        assert!(rsecret_apply::is_upload_secret(&u.labels));

        let mut unnamed = upload_secret();
        unnamed.metadata.name = None;
        assert!(upload_from_secret(&unnamed).is_err());
    }

    #[test]
    fn target_update_leaves_user_metadata_alone() {
        let existing = crate::remote_secret_from_dynamic(
            &serde_json::from_value(serde_json::json!({
                "apiVersion": "appstudio.redhat.com/v1beta1",
                "kind": "RemoteSecret",
                "metadata": {
                    "name": "test-remote-secret", "namespace": "default", "resourceVersion": "3",
                    "labels": { "team": "x" }, "annotations": { "note": "y" }
                },
                "spec": { "secret": { "type": "Opaque" }, "targets": [{ "namespace": "ns_a" }] }
            }))
            .unwrap(),
        )
        .unwrap();
        let mut upload = upload_from_secret(&upload_secret()).unwrap();
        upload.annotations.insert(rsecret_core::TARGET_NAMESPACE_ANNOTATION.to_string(), "ns_b".to_string());
        let plan = plan_upload(&upload, Some(&existing)).unwrap();
        assert_eq!(plan.action, UploadAction::Update);

        let patch = targets_patch(&plan.remote_secret).unwrap();
        assert_eq!(
            patch,
            serde_json::json!({
                "metadata": { "resourceVersion": "3" },
                "spec": { "targets": [{ "namespace": "ns_a" }, { "namespace": "ns_b" }] },
            })
        );
        // a merge patch never names labels or annotations, so the server keeps them
        assert!(patch["metadata"].get("labels").is_none());
        assert!(patch["metadata"].get("annotations").is_none());
    }

    #[test]
    fn error_event_is_named_after_upload() {
        let ev = upload_error_event(&upload_secret(), "secret type mismatch", "remote-secret-controller");
        assert_eq!(ev.metadata.name.as_deref(), Some("test-remote-secret-upload"));
        assert_eq!(ev.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(ev.type_.as_deref(), Some("Error"));
        assert_eq!(ev.message.as_deref(), Some("secret type mismatch"));
        assert_eq!(ev.involved_object.uid.as_deref(), Some("uid-9"));
        assert_eq!(ev.involved_object.kind.as_deref(), Some("Secret"));
    }
}
