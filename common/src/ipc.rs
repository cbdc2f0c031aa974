use serde::{Deserialize, Serialize};

use crate::audit::AuditOutcome;
use crate::job::{JobEvent, JobId};
use crate::status::DerivedStatus;

/// One request per line, newline-delimited JSON.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    /// Streams a `Status` response on every change until the job ends.
    Watch(JobId),
    Unwatch(JobId),
    GetStatus(JobId),
    ListWatched,
    PublishEvent(JobEvent),
    Audit {
        max_queued_min: Option<i64>,
        max_processing_min: Option<i64>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Status(Option<DerivedStatus>),
    Watched(Vec<JobId>),
    Audit(AuditOutcome),
}
