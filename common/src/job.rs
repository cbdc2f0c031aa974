use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Step name producers use for keepalive events.
pub const HEARTBEAT_STEP: &str = "heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl JobId {
    /// A blank id means "no job".
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    #[serde(alias = "running")]
    Processing,
    #[serde(alias = "completed")]
    Done,
    Failed,
    NeedsAttention,
    Stalled,
    #[default]
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::NeedsAttention => "needs_attention",
            JobStatus::Stalled => "stalled",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "queued" => JobStatus::Queued,
            "processing" | "running" => JobStatus::Processing,
            "done" | "completed" => JobStatus::Done,
            "failed" => JobStatus::Failed,
            "needs_attention" => JobStatus::NeedsAttention,
            "stalled" => JobStatus::Stalled,
            _ => JobStatus::Unknown,
        })
    }
}

/// What an event says about the job's step.
///
/// Keepalives are kept apart from substantive step changes so that folding a
/// heartbeat can never replace the last real step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Heartbeat,
    Step(String),
}

impl EventKind {
    pub fn from_step(step: &str) -> Self {
        if step == HEARTBEAT_STEP {
            EventKind::Heartbeat
        } else {
            EventKind::Step(step.to_string())
        }
    }

    pub fn as_step(&self) -> &str {
        match self {
            EventKind::Heartbeat => HEARTBEAT_STEP,
            EventKind::Step(s) => s,
        }
    }
}

/// Append-only progress record for a job.
///
/// On the wire the kind travels as a plain `step` string; it is decoded into
/// [`EventKind`] here, at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireJobEvent", into = "WireJobEvent")]
pub struct JobEvent {
    pub id: String,
    pub job_id: JobId,
    pub kind: EventKind,
    pub status: JobStatus,
    pub progress: f64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn is_heartbeat(&self) -> bool {
        self.kind == EventKind::Heartbeat
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireJobEvent {
    #[serde(default)]
    id: String,
    #[serde(alias = "jobId")]
    job_id: JobId,
    step: String,
    #[serde(default)]
    status: JobStatus,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    message: Option<String>,
    #[serde(alias = "createdAt", default = "Utc::now")]
    created_at: DateTime<Utc>,
}

impl From<WireJobEvent> for JobEvent {
    fn from(w: WireJobEvent) -> Self {
        JobEvent {
            id: w.id,
            job_id: w.job_id,
            kind: EventKind::from_step(&w.step),
            status: w.status,
            progress: w.progress,
            message: w.message,
            created_at: w.created_at,
        }
    }
}

impl From<JobEvent> for WireJobEvent {
    fn from(e: JobEvent) -> Self {
        WireJobEvent {
            id: e.id,
            job_id: e.job_id,
            step: e.kind.as_step().to_string(),
            status: e.status,
            progress: e.progress,
            message: e.message,
            created_at: e.created_at,
        }
    }
}
