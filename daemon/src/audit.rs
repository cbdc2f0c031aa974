//! Dead-job auditor: a point-in-time scan of recent jobs for ones that look
//! stuck. Stateless; the same backing data always yields the same report.

use chrono::{DateTime, NaiveDateTime, Utc};
use common::{AuditOutcome, AuditReport, JobStatus, Suspect};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::client::{FetchError, JobSource};

pub const DEFAULT_MAX_QUEUED_MIN: i64 = 30;
pub const DEFAULT_MAX_PROCESSING_MIN: i64 = 60;
pub const DEFAULT_LIST_LIMIT: usize = 500;

const TIMESTAMP_FIELDS: [&str; 4] = ["updated_at", "updatedAt", "created_at", "createdAt"];
const LAST_LOG_FIELDS: [&str; 2] = ["last_log_at", "lastLogAt"];
const LOG_COUNT_FIELDS: [&str; 2] = ["log_count", "logCount"];

const SUGGESTIONS: [&str; 3] = [
    "Re-enqueue or cancel jobs stuck in 'queued'; check that the dispatcher is running.",
    "Inspect worker logs for jobs stuck in 'processing' and restart unhealthy workers.",
    "Verify the job runner writes log rows for jobs reported with 'missing logs'.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditThresholds {
    pub max_queued_min: i64,
    pub max_processing_min: i64,
}

impl AuditThresholds {
    /// Both thresholds are clamped to at least one minute.
    pub fn new(max_queued_min: i64, max_processing_min: i64) -> Self {
        Self {
            max_queued_min: max_queued_min.max(1),
            max_processing_min: max_processing_min.max(1),
        }
    }
}

impl Default for AuditThresholds {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED_MIN, DEFAULT_MAX_PROCESSING_MIN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListingError {
    #[error("unrecognized list-jobs response: expected an array, {{items: [...]}} or {{jobs: [...]}}")]
    UnrecognizedShape,
}

/// Normalizes the listing envelope. Anything other than a bare array,
/// `{"items": [...]}` or `{"jobs": [...]}` is rejected.
pub fn decode_listing(body: Value) -> Result<Vec<Value>, ListingError> {
    match body {
        Value::Array(jobs) => Ok(jobs),
        Value::Object(mut map) => match (map.remove("items"), map.remove("jobs")) {
            (Some(Value::Array(jobs)), _) | (_, Some(Value::Array(jobs))) => Ok(jobs),
            _ => Err(ListingError::UnrecognizedShape),
        },
        _ => Err(ListingError::UnrecognizedShape),
    }
}

/// Case-insensitive lookup of the first candidate key holding a value.
/// Nulls and blank strings count as absent.
fn field<'a>(job: &'a Map<String, Value>, candidates: &[&str]) -> Option<&'a Value> {
    candidates.iter().find_map(|name| {
        job.get(*name)
            .or_else(|| {
                job.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .filter(|v| match v {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                _ => true,
            })
    })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Whole minutes since the job's last timestamp. `None` means no usable
/// timestamp, which the rules treat as infinitely old.
pub fn age_minutes(job: &Map<String, Value>, now: DateTime<Utc>) -> Option<i64> {
    let ts = field(job, &TIMESTAMP_FIELDS).and_then(parse_timestamp)?;
    Some((now - ts).num_minutes())
}

fn exceeds(age: Option<i64>, limit: i64) -> bool {
    age.map_or(true, |a| a > limit)
}

fn has_logs(job: &Map<String, Value>) -> bool {
    let last_log = field(job, &LAST_LOG_FIELDS).is_some();
    let log_count = field(job, &LOG_COUNT_FIELDS).is_some_and(|v| v.as_f64().is_some_and(|n| n != 0.0));
    last_log || log_count
}

fn job_id(job: &Map<String, Value>) -> String {
    match field(job, &["id", "job_id", "jobId"]) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Lower-cased status. Aliases known to [`JobStatus`] (`running`,
/// `completed`) are folded into their canonical name; other values are kept.
fn job_status(job: &Map<String, Value>) -> String {
    let raw = field(job, &["status"])
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    match raw.parse::<JobStatus>().unwrap_or_default() {
        JobStatus::Unknown => raw,
        status => status.as_str().to_string(),
    }
}

/// Classifies `jobs` against `thresholds` as of `now`.
pub fn audit_jobs(jobs: &[Value], thresholds: AuditThresholds, now: DateTime<Utc>) -> AuditReport {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut suspects = Vec::new();

    for job in jobs.iter().filter_map(Value::as_object) {
        let status = job_status(job);
        *counts.entry(status.clone()).or_default() += 1;

        let age = age_minutes(job, now);
        let mut flag = |reason: String| {
            suspects.push(Suspect {
                id: job_id(job),
                status: status.clone(),
                age_min: age,
                reason,
            })
        };

        match status.as_str() {
            "queued" if exceeds(age, thresholds.max_queued_min) => {
                flag(format!("queued > {}m", thresholds.max_queued_min))
            }
            "processing" if exceeds(age, thresholds.max_processing_min) => {
                flag(format!("processing > {}m", thresholds.max_processing_min))
            }
            _ => {}
        }
        if matches!(status.as_str(), "queued" | "processing") && !has_logs(job) {
            flag("missing logs".to_string());
        }
    }

    let ok = suspects.is_empty();
    let suggestions = if ok {
        Vec::new()
    } else {
        SUGGESTIONS.iter().map(|s| s.to_string()).collect()
    };

    AuditReport {
        ok,
        counts,
        suspects,
        suggestions,
    }
}

/// Fetches up to `limit` recent jobs and audits them. Never fails: upstream
/// and decoding problems come back as [`AuditOutcome::Failed`].
pub async fn run_audit<S>(source: &S, thresholds: AuditThresholds, limit: usize) -> AuditOutcome
where
    S: JobSource + ?Sized,
{
    let body = match source.list_jobs(limit).await {
        Ok(body) => body,
        Err(e) => {
            log::warn!("Dead-job audit could not list jobs: {}", e);
            return AuditOutcome::failed(list_error(&e));
        }
    };

    let jobs = match decode_listing(body) {
        Ok(jobs) => jobs,
        Err(e) => {
            log::warn!("Dead-job audit: {}", e);
            return AuditOutcome::failed(e.to_string());
        }
    };

    let report = audit_jobs(&jobs, thresholds, Utc::now());
    log::info!(
        "Dead-job audit scanned {} jobs, {} suspects",
        jobs.len(),
        report.suspects.len()
    );
    AuditOutcome::Completed(report)
}

fn list_error(e: &FetchError) -> String {
    format!("list-jobs failed ({})", e)
}
