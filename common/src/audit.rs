use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A job the auditor believes is stuck. A job matching several rules shows
/// up once per rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Suspect {
    pub id: String,
    pub status: String,
    /// Minutes since the job last changed; `None` when no usable timestamp exists.
    pub age_min: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub ok: bool,
    pub counts: BTreeMap<String, usize>,
    pub suspects: Vec<Suspect>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFailure {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuditOutcome {
    Completed(AuditReport),
    Failed(AuditFailure),
}

impl AuditOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        AuditOutcome::Failed(AuditFailure {
            ok: false,
            error: error.into(),
        })
    }

    pub fn is_ok(&self) -> bool {
        match self {
            AuditOutcome::Completed(r) => r.ok,
            AuditOutcome::Failed(_) => false,
        }
    }
}
