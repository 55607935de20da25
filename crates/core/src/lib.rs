//! Remote secret core types: the distribution request, its targets and the
//! observed target status the controller records.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod conditions;

pub use conditions::{find_condition, set_condition, Condition, ConditionReason, ConditionStatus, ConditionType};

pub const API_GROUP: &str = "appstudio.redhat.com";
pub const API_VERSION: &str = "v1beta1";
pub const KIND: &str = "RemoteSecret";

/// Label marking a Secret as an upload for a remote secret. Value must be `remotesecret`.
pub const UPLOAD_SECRET_LABEL: &str = "appstudio.redhat.com/upload-secret";
pub const UPLOAD_SECRET_LABEL_VALUE: &str = "remotesecret";
/// Annotation on an upload Secret naming the remote secret to feed.
pub const REMOTE_SECRET_NAME_ANNOTATION: &str = "appstudio.redhat.com/remotesecret-name";
/// Annotation on an upload Secret naming a target namespace to add.
pub const TARGET_NAMESPACE_ANNOTATION: &str = "appstudio.redhat.com/remotesecret-target-namespace";
/// Label put on every deployed target secret.
pub const LINKED_BY_REMOTE_SECRET_LABEL: &str = "appstudio.redhat.com/linked-by-remote-secret";
/// Annotation put on every deployed target secret: `<namespace>/<name>` of the owner.
pub const MANAGING_REMOTE_SECRET_ANNOTATION: &str = "appstudio.redhat.com/managing-remote-secret";
/// Finalizer guarding cleanup of deployed targets.
pub const CLEANUP_FINALIZER: &str = "appstudio.redhat.com/remotesecret-cleanup";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("not a RemoteSecret: {0}")]
    WrongKind(String),
    #[error("remote secret is missing metadata.{0}")]
    MissingMeta(&'static str),
    #[error("decoding remote secret: {0}")]
    Json(#[from] serde_json::Error),
}

/// Secret payload keyed by data key.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Namespace/name pair identifying one remote secret object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Position of a target in `spec.targets`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecTargetIndex(pub usize);

/// Position of a target in `status.targets`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusTargetIndex(pub usize);

impl fmt::Display for SpecTargetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl fmt::Display for StatusTargetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Identity of a target location: `(cluster api url, namespace)`.
///
/// An empty `api_url` is an ordinary value (the controller's own cluster), not a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey<'a> {
    pub api_url: &'a str,
    pub namespace: &'a str,
}

impl fmt::Display for TargetKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.api_url.is_empty() {
            write!(f, "{}", self.namespace)
        } else {
            write!(f, "{}@{}", self.namespace, self.api_url)
        }
    }
}

/// Anything that names a target location.
pub trait TargetIdentity {
    fn api_url(&self) -> &str;
    fn namespace(&self) -> &str;

    fn key(&self) -> TargetKey<'_> {
        TargetKey { api_url: self.api_url(), namespace: self.namespace() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSecretTarget {
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_url: String,
    /// Secret holding credentials for `api_url`. Opaque to the controller core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_credentials_secret: Option<String>,
}

impl RemoteSecretTarget {
    pub fn local(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), ..Default::default() }
    }

    pub fn in_cluster(api_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), api_url: api_url.into(), cluster_credentials_secret: None }
    }
}

impl TargetIdentity for RemoteSecretTarget {
    fn api_url(&self) -> &str { &self.api_url }
    fn namespace(&self) -> &str { &self.namespace }
}

/// Observed state of one deployed target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub service_account_names: SmallVec<[String; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetStatus {
    pub fn for_target(target: &RemoteSecretTarget) -> Self {
        Self { namespace: target.namespace.clone(), api_url: target.api_url.clone(), ..Default::default() }
    }
}

impl TargetIdentity for TargetStatus {
    fn api_url(&self) -> &str { &self.api_url }
    fn namespace(&self) -> &str { &self.namespace }
}

/// Service account to link the deployed secret to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountLink {
    pub name: String,
    /// Also add the secret to `imagePullSecrets`.
    #[serde(default)]
    pub as_image_pull_secret: bool,
}

/// Shape of the Secret created in every target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkableSecretSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_to: Vec<ServiceAccountLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSecretSpec {
    #[serde(default)]
    pub secret: LinkableSecretSpec,
    #[serde(default)]
    pub targets: Vec<RemoteSecretTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSecretStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub targets: Vec<TargetStatus>,
}

/// The subset of object metadata the controller needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSecretMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSecret {
    #[serde(default)]
    pub metadata: RemoteSecretMeta,
    #[serde(default)]
    pub spec: RemoteSecretSpec,
    #[serde(default)]
    pub status: RemoteSecretStatus,
}

impl RemoteSecret {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: RemoteSecretMeta { name: name.into(), namespace: namespace.into(), ..Default::default() },
            ..Default::default()
        }
    }

    /// Decode a full object (as served by the API server or read from a manifest).
    pub fn from_value(v: serde_json::Value) -> Result<Self, CoreError> {
        if let Some(kind) = v.get("kind").and_then(|k| k.as_str()) {
            if kind != KIND {
                return Err(CoreError::WrongKind(kind.to_string()));
            }
        }
        let rs: RemoteSecret = serde_json::from_value(v)?;
        if rs.metadata.name.is_empty() {
            return Err(CoreError::MissingMeta("name"));
        }
        Ok(rs)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.metadata.namespace.clone(), self.metadata.name.clone())
    }

    pub fn is_being_deleted(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, f: &str) -> bool { self.metadata.finalizers.iter().any(|x| x == f) }

    pub fn api_version() -> String { format!("{}/{}", API_GROUP, API_VERSION) }

    /// Serialize with `apiVersion`/`kind` so the result can be applied as-is.
    pub fn to_manifest(&self) -> Result<serde_json::Value, CoreError> {
        let mut v = serde_json::to_value(self)?;
        if let Some(obj) = v.as_object_mut() {
            obj.insert("apiVersion".into(), serde_json::Value::String(Self::api_version()));
            obj.insert("kind".into(), serde_json::Value::String(KIND.to_string()));
        }
        Ok(v)
    }
}
