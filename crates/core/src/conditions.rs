//! Status conditions reported on a remote secret.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    /// Secret data has been provided for the remote secret.
    DataObtained,
    /// The secret has been deployed to every target.
    Deployed,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::DataObtained => "DataObtained",
            ConditionType::Deployed => "Deployed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionReason {
    AwaitingData,
    DataFound,
    Injected,
    PartiallyInjected,
    Error,
    DuplicateTargets,
    NoTargets,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::AwaitingData => "AwaitingData",
            ConditionReason::DataFound => "DataFound",
            ConditionReason::Injected => "Injected",
            ConditionReason::PartiallyInjected => "PartiallyInjected",
            ConditionReason::Error => "Error",
            ConditionReason::DuplicateTargets => "DuplicateTargets",
            ConditionReason::NoTargets => "NoTargets",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Kubernetes-style condition (`metav1.Condition` shape).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: ConditionType, status: ConditionStatus, reason: ConditionReason, message: impl Into<String>) -> Self {
        Self {
            type_: type_.as_str().to_string(),
            status: status.as_str().to_string(),
            reason: reason.as_str().to_string(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    pub fn is(&self, type_: ConditionType) -> bool { self.type_ == type_.as_str() }

    pub fn is_true(&self) -> bool { self.status == ConditionStatus::True.as_str() }
}

pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.is(type_))
}

/// Insert or replace the condition of the same type.
///
/// The transition time only moves when `status` changes.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => {
            if existing.status == cond.status && existing.last_transition_time.is_some() {
                cond.last_transition_time = existing.last_transition_time.clone();
            } else if cond.last_transition_time.is_none() {
                cond.last_transition_time = Some(now_rfc3339());
            }
            *existing = cond;
        }
        None => {
            if cond.last_transition_time.is_none() {
                cond.last_transition_time = Some(now_rfc3339());
            }
            conditions.push(cond);
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
