//! Uploaded secret data, kept in a Secret next to its remote secret and owned by it.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::ObjectMeta,
    Client,
};
use rsecret_core::{ObjectKey, RemoteSecret, SecretData, KIND};
use tracing::debug;

pub fn data_secret_name(remote_secret: &str) -> String {
    format!("{}-remotesecret-data", remote_secret)
}

pub fn build_data_secret(key: &ObjectKey, owner_uid: Option<&str>, data: &SecretData) -> Secret {
    let owner_references = owner_uid.map(|uid| {
        vec![OwnerReference {
            api_version: RemoteSecret::api_version(),
            kind: KIND.to_string(),
            name: key.name.clone(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });
    Secret {
        metadata: ObjectMeta {
            name: Some(data_secret_name(&key.name)),
            namespace: Some(key.namespace.clone()),
            owner_references,
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data.iter().map(|(k, v)| (k.clone(), ByteString(v.clone()))).collect()),
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct DataStore {
    client: Client,
    field_manager: String,
}

impl DataStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn api(&self, namespace: &str) -> Api<Secret> { Api::namespaced(self.client.clone(), namespace) }

    /// Data stored for `key`; `None` until something was uploaded.
    pub async fn load(&self, key: &ObjectKey) -> Result<Option<SecretData>> {
        let name = data_secret_name(&key.name);
        let Some(secret) = self.api(&key.namespace).get_opt(&name).await.with_context(|| format!("reading {}/{}", key.namespace, name))? else {
            return Ok(None);
        };
        let data: SecretData = secret.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.0)).collect();
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(data))
    }

    pub async fn store(&self, key: &ObjectKey, owner_uid: Option<&str>, data: &SecretData) -> Result<()> {
        let secret = build_data_secret(key, owner_uid, data);
        let name = data_secret_name(&key.name);
        let pp = PatchParams::apply(&self.field_manager).force();
        self.api(&key.namespace)
            .patch(&name, &pp, &Patch::Apply(&secret))
            .await
            .with_context(|| format!("storing data for {}", key))?;
        debug!(rs = %key, keys = data.len(), "secret data stored");
        Ok(())
    }

    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let name = data_secret_name(&key.name);
        match self.api(&key.namespace).delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting data for {}", key)),
        }
    }
}
