//! Remote secret kube integration: API access, watchers, and the kube-backed
//! deployer, data store and reconcile loop.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta},
    runtime::watcher::{self, Event},
    Client,
};
use rsecret_core::{
    ObjectKey, RemoteSecret, API_GROUP, API_VERSION, KIND, LINKED_BY_REMOTE_SECRET_LABEL,
    MANAGING_REMOTE_SECRET_ANNOTATION, UPLOAD_SECRET_LABEL, UPLOAD_SECRET_LABEL_VALUE,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod controller;
pub mod datastore;
pub mod deploy;

pub use controller::{process_upload, reconcile, run, Context as ControllerContext};
pub use datastore::DataStore;
pub use deploy::{parse_cluster_mapping, ClusterClients, DeployError, KubeDeployer};

pub fn field_manager_from_env() -> String {
    std::env::var("RSECRET_FIELD_MANAGER")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "remote-secret-controller".to_string())
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("creating kube client")
}

pub fn remote_secret_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(API_GROUP, API_VERSION, KIND))
}

pub fn remote_secret_api(client: Client, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = remote_secret_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    }
}

pub fn remote_secret_from_dynamic(obj: &DynamicObject) -> Result<RemoteSecret> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    RemoteSecret::from_value(raw).context("decoding RemoteSecret")
}

fn key_of(meta: &ObjectMeta) -> Option<ObjectKey> {
    Some(ObjectKey::new(meta.namespace.clone()?, meta.name.clone()?))
}

/// Owner of a deployed secret, read from its managing annotation (`ns/name`).
pub fn managing_remote_secret(meta: &ObjectMeta) -> Option<ObjectKey> {
    let value = meta.annotations.as_ref()?.get(MANAGING_REMOTE_SECRET_ANNOTATION)?;
    let (ns, name) = value.split_once('/')?;
    if ns.is_empty() || name.is_empty() {
        return None;
    }
    Some(ObjectKey::new(ns, name))
}

fn secrets_api(client: Client, namespace: Option<&str>) -> Api<Secret> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// List+watch remote secrets and send the key of every changed object.
pub async fn watch_remote_secrets(client: Client, namespace: Option<String>, tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let api = remote_secret_api(client, namespace.as_deref());
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = KIND, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) | Event::Deleted(o) => {
                if let Some(key) = key_of(&o.metadata) {
                    let _ = tx.send(key).await;
                }
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for o in list.iter() {
                    if let Some(key) = key_of(&o.metadata) {
                        let _ = tx.send(key).await;
                    }
                }
            }
        }
    }
    warn!(kind = KIND, "watcher stream ended");
    Ok(())
}

/// Watch upload secrets (label `appstudio.redhat.com/upload-secret=remotesecret`).
pub async fn watch_upload_secrets(client: Client, namespace: Option<String>, tx: mpsc::Sender<Secret>) -> Result<()> {
    let api = secrets_api(client, namespace.as_deref());
    let selector = format!("{}={}", UPLOAD_SECRET_LABEL, UPLOAD_SECRET_LABEL_VALUE);
    let stream = watcher::watcher(api, watcher::Config::default().labels(&selector));
    futures::pin_mut!(stream);
    info!(selector = %selector, ns = ?namespace, "upload watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(s) => {
                let _ = tx.send(s).await;
            }
            Event::Deleted(_) => {}
            Event::Restarted(list) => {
                for s in list {
                    let _ = tx.send(s).await;
                }
            }
        }
    }
    warn!("upload watcher stream ended");
    Ok(())
}

/// Requeue the owning remote secret when a deployed secret in the local cluster is deleted.
pub async fn watch_deployed_secrets(client: Client, namespace: Option<String>, tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    // deployed secrets live in target namespaces, not the remote secret's
    let api = secrets_api(client, None);
    let stream = watcher::watcher(api, watcher::Config::default().labels(LINKED_BY_REMOTE_SECRET_LABEL));
    futures::pin_mut!(stream);
    info!("deployed secret watcher started");
    while let Some(ev) = stream.try_next().await? {
        if let Event::Deleted(s) = ev {
            let Some(owner) = managing_remote_secret(&s.metadata) else { continue };
            if namespace.as_deref().is_some_and(|ns| ns != owner.namespace) {
                continue;
            }
            debug!(secret = ?s.metadata.name, owner = %owner, "deployed secret deleted");
            let _ = tx.send(owner).await;
        }
    }
    warn!("deployed secret watcher stream ended");
    Ok(())
}

/// Spawn the remote secret, deployed secret and upload watchers.
pub fn start_watchers(
    client: Client,
    namespace: Option<String>,
    reconcile_tx: mpsc::Sender<ObjectKey>,
    upload_tx: mpsc::Sender<Secret>,
) -> Vec<JoinHandle<()>> {
    let remote_secrets = tokio::spawn({
        let (client, ns, tx) = (client.clone(), namespace.clone(), reconcile_tx.clone());
        async move {
            if let Err(e) = watch_remote_secrets(client, ns, tx).await {
                error!(error = ?e, "remote secret watcher failed");
            }
        }
    });
    let deployed = tokio::spawn({
        let (client, ns) = (client.clone(), namespace.clone());
        async move {
            if let Err(e) = watch_deployed_secrets(client, ns, reconcile_tx).await {
                error!(error = ?e, "deployed secret watcher failed");
            }
        }
    });
    let uploads = tokio::spawn(async move {
        if let Err(e) = watch_upload_secrets(client, namespace, upload_tx).await {
            error!(error = ?e, "upload watcher failed");
        }
    });
    vec![remote_secrets, deployed, uploads]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn resource_points_at_remote_secrets() {
        let ar = remote_secret_resource();
        assert_eq!(ar.group, "appstudio.redhat.com");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.api_version, "appstudio.redhat.com/v1beta1");
        assert_eq!(ar.plural, "remotesecrets");
    }

    #[test]
    fn decodes_dynamic_object() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "appstudio.redhat.com/v1beta1",
            "kind": "RemoteSecret",
            "metadata": {
                "name": "rs", "namespace": "default", "uid": "u-1", "resourceVersion": "7",
                "finalizers": ["appstudio.redhat.com/remotesecret-cleanup"],
                "managedFields": [{"manager": "kubectl"}]
            },
            "spec": { "secret": { "generateName": "gen-" }, "targets": [{"namespace": "a"}] },
            "status": { "targets": [{"namespace": "a", "secretName": "gen-abcde"}] }
        }))
        .unwrap();
        let rs = remote_secret_from_dynamic(&obj).unwrap();
        assert_eq!(rs.key(), ObjectKey::new("default", "rs"));
        assert_eq!(rs.metadata.resource_version.as_deref(), Some("7"));
        assert!(rs.has_finalizer(rsecret_core::CLEANUP_FINALIZER));
        assert_eq!(rs.spec.secret.generate_name.as_deref(), Some("gen-"));
        assert_eq!(rs.status.targets[0].secret_name, "gen-abcde");
    }

    #[test]
    fn managing_annotation_parsing() {
        let mut meta = ObjectMeta::default();
        assert_eq!(managing_remote_secret(&meta), None);
        let mut ann = BTreeMap::new();
        ann.insert(MANAGING_REMOTE_SECRET_ANNOTATION.to_string(), "default/rs".to_string());
        meta.annotations = Some(ann.clone());
        assert_eq!(managing_remote_secret(&meta), Some(ObjectKey::new("default", "rs")));
        ann.insert(MANAGING_REMOTE_SECRET_ANNOTATION.to_string(), "no-slash".to_string());
        meta.annotations = Some(ann);
        assert_eq!(managing_remote_secret(&meta), None);
    }
}
