//! Upload secrets: user-created Secrets that carry data (and optionally a new
//! target namespace) for a remote secret. Planning only; the caller performs
//! the writes and always deletes the upload afterwards.

use std::collections::BTreeMap;

use rsecret_core::{
    RemoteSecret, RemoteSecretTarget, SecretData, REMOTE_SECRET_NAME_ANNOTATION, TARGET_NAMESPACE_ANNOTATION,
    UPLOAD_SECRET_LABEL, UPLOAD_SECRET_LABEL_VALUE,
};

/// Type assumed for secrets that do not declare one.
pub const DEFAULT_SECRET_TYPE: &str = "Opaque";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSecret {
    pub namespace: String,
    pub name: String,
    pub type_: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: SecretData,
}

impl UploadSecret {
    pub fn effective_type(&self) -> &str { self.type_.as_deref().unwrap_or(DEFAULT_SECRET_TYPE) }

    pub fn remote_secret_name(&self) -> Option<&str> {
        self.annotations.get(REMOTE_SECRET_NAME_ANNOTATION).map(String::as_str).filter(|s| !s.is_empty())
    }

    pub fn target_namespace(&self) -> Option<&str> {
        self.annotations.get(TARGET_NAMESPACE_ANNOTATION).map(String::as_str).filter(|s| !s.is_empty())
    }
}

pub fn is_upload_secret(labels: &BTreeMap<String, String>) -> bool {
    labels.get(UPLOAD_SECRET_LABEL).map(String::as_str) == Some(UPLOAD_SECRET_LABEL_VALUE)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("upload secret {0} does not name a remote secret (annotation appstudio.redhat.com/remotesecret-name)")]
    MissingRemoteSecretName(String),
    #[error("secret type mismatch: remote secret {remote_secret} expects {expected}, upload has {actual}")]
    TypeMismatch { remote_secret: String, expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAction {
    /// The remote secret does not exist yet.
    Create,
    /// The remote secret gains a target.
    Update,
    /// Only the data changes.
    DataOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    pub action: UploadAction,
    pub remote_secret: RemoteSecret,
    pub data: SecretData,
}

/// Decide what an upload does to its remote secret.
pub fn plan_upload(upload: &UploadSecret, existing: Option<&RemoteSecret>) -> Result<UploadPlan, UploadError> {
    let rs_name = upload
        .remote_secret_name()
        .ok_or_else(|| UploadError::MissingRemoteSecretName(format!("{}/{}", upload.namespace, upload.name)))?;

    let Some(existing) = existing else {
        let mut rs = RemoteSecret::new(upload.namespace.clone(), rs_name);
        rs.spec.secret.type_ = upload.type_.clone();
        if let Some(ns) = upload.target_namespace() {
            rs.spec.targets.push(RemoteSecretTarget::local(ns));
        }
        return Ok(UploadPlan { action: UploadAction::Create, remote_secret: rs, data: upload.data.clone() });
    };

    if let Some(expected) = existing.spec.secret.type_.as_deref() {
        if expected != upload.effective_type() {
            return Err(UploadError::TypeMismatch {
                remote_secret: existing.key().to_string(),
                expected: expected.to_string(),
                actual: upload.effective_type().to_string(),
            });
        }
    }

    let mut rs = existing.clone();
    let mut action = UploadAction::DataOnly;
    if let Some(ns) = upload.target_namespace() {
        let present = rs.spec.targets.iter().any(|t| t.api_url.is_empty() && t.namespace == ns);
        if !present {
            rs.spec.targets.push(RemoteSecretTarget::local(ns));
            action = UploadAction::Update;
        }
    }
    Ok(UploadPlan { action, remote_secret: rs, data: upload.data.clone() })
}
