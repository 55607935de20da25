//! Kube-backed [`TargetDeployer`]: server-side applies the secret into each
//! target namespace and links it to the requested service accounts.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LocalObjectReference, ObjectReference, Secret, ServiceAccount};
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    config::KubeConfigOptions,
    core::ObjectMeta,
    Client,
};
use rsecret_apply::{DeployRequest, DeployedTarget, TargetDeployer};
use rsecret_core::{ObjectKey, TargetStatus, LINKED_BY_REMOTE_SECRET_LABEL, MANAGING_REMOTE_SECRET_ANNOTATION};
use tracing::{debug, info, warn};

use crate::managing_remote_secret;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("no client registered for cluster {0}")]
    UnknownCluster(String),
    #[error("service account {namespace}/{name} not found")]
    MissingServiceAccount { namespace: String, name: String },
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Clients per target cluster. An empty API URL means the local cluster.
#[derive(Clone)]
pub struct ClusterClients {
    local: Client,
    remote: HashMap<String, Client>,
}

impl ClusterClients {
    pub fn local_only(local: Client) -> Self {
        Self { local, remote: HashMap::new() }
    }

    pub fn with_cluster(mut self, api_url: impl Into<String>, client: Client) -> Self {
        self.remote.insert(api_url.into(), client);
        self
    }

    /// Build clients for `(api_url, kubeconfig context)` pairs.
    pub async fn from_contexts(local: Client, mappings: &[(String, String)]) -> Result<Self> {
        let mut out = Self::local_only(local);
        for (api_url, context) in mappings {
            let opts = KubeConfigOptions { context: Some(context.clone()), ..Default::default() };
            let cfg = kube::Config::from_kubeconfig(&opts)
                .await
                .with_context(|| format!("loading kubeconfig context {}", context))?;
            let client = Client::try_from(cfg).with_context(|| format!("creating client for {}", api_url))?;
            info!(api_url = %api_url, context = %context, "registered target cluster");
            out = out.with_cluster(api_url.clone(), client);
        }
        Ok(out)
    }

    pub fn client_for(&self, api_url: &str) -> Result<Client, DeployError> {
        if api_url.is_empty() {
            return Ok(self.local.clone());
        }
        self.remote.get(api_url).cloned().ok_or_else(|| DeployError::UnknownCluster(api_url.to_string()))
    }

    pub fn local(&self) -> Client { self.local.clone() }
}

/// Parse a `--cluster <apiUrl>=<context>` argument.
pub fn parse_cluster_mapping(s: &str) -> Result<(String, String)> {
    let (url, ctx) = s.split_once('=').ok_or_else(|| anyhow!("invalid cluster mapping: {} (expect <apiUrl>=<context>)", s))?;
    if url.is_empty() || ctx.is_empty() {
        return Err(anyhow!("invalid cluster mapping: {} (expect <apiUrl>=<context>)", s));
    }
    Ok((url.to_string(), ctx.to_string()))
}

/// The Secret applied into a target for `req`.
pub fn build_target_secret(req: &DeployRequest<'_>) -> Secret {
    let mut labels = req.secret.labels.clone();
    labels.insert(LINKED_BY_REMOTE_SECRET_LABEL.to_string(), req.owner.name.clone());
    let mut annotations = req.secret.annotations.clone();
    annotations.insert(MANAGING_REMOTE_SECRET_ANNOTATION.to_string(), req.owner.to_string());
    Secret {
        metadata: ObjectMeta {
            name: Some(req.secret_name.clone()),
            namespace: Some(req.target.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        type_: req.secret.type_.clone(),
        data: Some(req.data.iter().map(|(k, v)| (k.clone(), ByteString(v.clone()))).collect()),
        ..Default::default()
    }
}

/// Add `secret` to the account's `secrets` (and `imagePullSecrets`). Returns whether anything changed.
fn link_secret(sa: &mut ServiceAccount, secret: &str, as_image_pull_secret: bool) -> bool {
    let mut changed = false;
    let secrets = sa.secrets.get_or_insert_with(Vec::new);
    if !secrets.iter().any(|r| r.name.as_deref() == Some(secret)) {
        secrets.push(ObjectReference { name: Some(secret.to_string()), ..Default::default() });
        changed = true;
    }
    if as_image_pull_secret {
        let pulls = sa.image_pull_secrets.get_or_insert_with(Vec::new);
        if !pulls.iter().any(|r| r.name.as_deref() == Some(secret)) {
            pulls.push(LocalObjectReference { name: Some(secret.to_string()) });
            changed = true;
        }
    }
    changed
}

fn unlink_secret(sa: &mut ServiceAccount, secret: &str) -> bool {
    let mut changed = false;
    if let Some(secrets) = sa.secrets.as_mut() {
        let before = secrets.len();
        secrets.retain(|r| r.name.as_deref() != Some(secret));
        changed |= secrets.len() != before;
    }
    if let Some(pulls) = sa.image_pull_secrets.as_mut() {
        let before = pulls.len();
        pulls.retain(|r| r.name.as_deref() != Some(secret));
        changed |= pulls.len() != before;
    }
    changed
}

pub struct KubeDeployer {
    clients: ClusterClients,
    field_manager: String,
}

impl KubeDeployer {
    pub fn new(clients: ClusterClients, field_manager: impl Into<String>) -> Self {
        Self { clients, field_manager: field_manager.into() }
    }

    async fn link(&self, sas: &Api<ServiceAccount>, ns: &str, sa_name: &str, secret: &str, pull: bool) -> Result<()> {
        let mut sa = sas
            .get_opt(sa_name)
            .await?
            .ok_or_else(|| DeployError::MissingServiceAccount { namespace: ns.to_string(), name: sa_name.to_string() })?;
        if link_secret(&mut sa, secret, pull) {
            sas.replace(sa_name, &PostParams::default(), &sa)
                .await
                .with_context(|| format!("linking secret {} to service account {}/{}", secret, ns, sa_name))?;
            debug!(sa = %sa_name, secret = %secret, "service account linked");
        }
        Ok(())
    }

    async fn unlink(&self, sas: &Api<ServiceAccount>, ns: &str, sa_name: &str, secret: &str) -> Result<()> {
        let Some(mut sa) = sas.get_opt(sa_name).await? else { return Ok(()) };
        if unlink_secret(&mut sa, secret) {
            sas.replace(sa_name, &PostParams::default(), &sa)
                .await
                .with_context(|| format!("unlinking secret {} from service account {}/{}", secret, ns, sa_name))?;
            debug!(sa = %sa_name, secret = %secret, "service account unlinked");
        }
        Ok(())
    }
}

#[async_trait]
impl TargetDeployer for KubeDeployer {
    async fn deploy(&self, req: &DeployRequest<'_>) -> Result<DeployedTarget> {
        let client = self.clients.client_for(&req.target.api_url)?;
        let ns = req.target.namespace.as_str();
        let secrets: Api<Secret> = Api::namespaced(client.clone(), ns);
        let manifest = build_target_secret(req);
        let pp = PatchParams::apply(&self.field_manager).force();
        secrets
            .patch(&req.secret_name, &pp, &Patch::Apply(&manifest))
            .await
            .with_context(|| format!("applying secret {}/{}", ns, req.secret_name))?;

        let sas: Api<ServiceAccount> = Api::namespaced(client, ns);
        let mut out = DeployedTarget { secret_name: req.secret_name.clone(), ..Default::default() };
        for link in &req.secret.linked_to {
            self.link(&sas, ns, &link.name, &req.secret_name, link.as_image_pull_secret).await?;
            out.service_account_names.push(link.name.clone());
        }
        if let Some(prev) = req.previous {
            for stale in prev.service_account_names.iter().filter(|n| !out.service_account_names.contains(n)) {
                self.unlink(&sas, ns, stale, &prev.secret_name).await?;
            }
        }
        Ok(out)
    }

    async fn undeploy(&self, owner: &ObjectKey, status: &TargetStatus) -> Result<()> {
        let client = self.clients.client_for(&status.api_url)?;
        let ns = status.namespace.as_str();
        let sas: Api<ServiceAccount> = Api::namespaced(client.clone(), ns);
        for sa in &status.service_account_names {
            self.unlink(&sas, ns, sa, &status.secret_name).await?;
        }

        let secrets: Api<Secret> = Api::namespaced(client, ns);
        let Some(existing) = secrets.get_opt(&status.secret_name).await? else { return Ok(()) };
        if managing_remote_secret(&existing.metadata).as_ref() != Some(owner) {
            warn!(secret = %status.secret_name, ns = %ns, owner = %owner, "secret not managed by this remote secret; leaving it");
            return Ok(());
        }
        match secrets.delete(&status.secret_name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting secret {}/{}", ns, status.secret_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsecret_core::{LinkableSecretSpec, RemoteSecretTarget, SecretData};

    #[test]
    fn cluster_mapping() {
        assert_eq!(
            parse_cluster_mapping("https://api.other:6443=other").unwrap(),
            ("https://api.other:6443".to_string(), "other".to_string())
        );
        assert!(parse_cluster_mapping("no-separator").is_err());
        assert!(parse_cluster_mapping("=ctx").is_err());
        assert!(parse_cluster_mapping("url=").is_err());
    }

    #[test]
    fn target_secret_carries_owner_and_data() {
        let owner = ObjectKey::new("default", "rs");
        let target = RemoteSecretTarget::local("ns-a");
        let mut spec = LinkableSecretSpec { type_: Some("Opaque".into()), ..Default::default() };
        spec.labels.insert("team".into(), "x".into());
        let mut data = SecretData::new();
        data.insert("token".into(), b"s3cr3t".to_vec());
        let req = DeployRequest {
            owner: &owner,
            target: &target,
            previous: None,
            secret_name: "rs-abcde".into(),
            secret: &spec,
            data: &data,
        };

        let s = build_target_secret(&req);
        assert_eq!(s.metadata.name.as_deref(), Some("rs-abcde"));
        assert_eq!(s.metadata.namespace.as_deref(), Some("ns-a"));
        let labels = s.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("x"));
        assert_eq!(labels.get(LINKED_BY_REMOTE_SECRET_LABEL).map(String::as_str), Some("rs"));
        assert_eq!(managing_remote_secret(&s.metadata), Some(owner.clone()));
        assert_eq!(s.type_.as_deref(), Some("Opaque"));
        assert_eq!(s.data.unwrap().get("token").map(|b| b.0.clone()), Some(b"s3cr3t".to_vec()));
    }

    #[test]
    fn linking_is_idempotent() {
        let mut sa = ServiceAccount::default();
        assert!(link_secret(&mut sa, "s", true));
        assert!(!link_secret(&mut sa, "s", true));
        assert_eq!(sa.secrets.as_ref().unwrap().len(), 1);
        assert_eq!(sa.image_pull_secrets.as_ref().unwrap().len(), 1);

        assert!(link_secret(&mut sa, "t", false));
        assert!(sa.image_pull_secrets.as_ref().unwrap().iter().all(|r| r.name.as_deref() != Some("t")));

        assert!(unlink_secret(&mut sa, "s"));
        assert!(!unlink_secret(&mut sa, "s"));
        assert_eq!(sa.secrets.as_ref().unwrap().len(), 1);
        assert!(sa.image_pull_secrets.as_ref().unwrap().is_empty());
    }
}
