use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{EventKind, JobEvent, JobId, JobStatus};

/// Client-side view of the latest known state of one job. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedStatus {
    #[serde(alias = "jobId")]
    pub job_id: JobId,
    #[serde(alias = "status", default)]
    pub state: JobStatus,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(alias = "lastUpdate", default = "Utc::now")]
    pub last_update: DateTime<Utc>,
}

impl DerivedStatus {
    /// Folds an event into `prev`. A heartbeat keeps the previous real step.
    pub fn fold(prev: Option<&DerivedStatus>, event: &JobEvent, now: DateTime<Utc>) -> Self {
        let step = match &event.kind {
            EventKind::Heartbeat => prev.and_then(|p| p.step.clone()),
            EventKind::Step(s) => Some(s.clone()),
        };

        DerivedStatus {
            job_id: event.job_id.clone(),
            state: event.status,
            step,
            progress: event.progress,
            message: event.message.clone(),
            last_update: now,
        }
    }
}

/// Replays `events` in order, stamping each update with `now`.
pub fn reduce<'a, I>(events: I, now: DateTime<Utc>) -> Option<DerivedStatus>
where
    I: IntoIterator<Item = &'a JobEvent>,
{
    events
        .into_iter()
        .fold(None, |acc, e| Some(DerivedStatus::fold(acc.as_ref(), e, now)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(step: &str, progress: f64) -> JobEvent {
        JobEvent {
            id: format!("{step}-{progress}"),
            job_id: JobId::from("job-1"),
            kind: EventKind::from_step(step),
            status: JobStatus::Processing,
            progress,
            message: Some(format!("at {step}")),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_heartbeat_keeps_previous_step() {
        let events = vec![
            event("outline", 10.0),
            event("heartbeat", 20.0),
            event("heartbeat", 25.0),
        ];
        let status = reduce(&events, Utc::now()).unwrap();

        assert_eq!(status.step.as_deref(), Some("outline"));
        assert_eq!(status.progress, 25.0);
        assert_eq!(status.message.as_deref(), Some("at heartbeat"));
    }

    #[test]
    fn test_heartbeat_first_has_no_step() {
        let status = reduce(&[event("heartbeat", 0.0)], Utc::now()).unwrap();
        assert_eq!(status.step, None);
    }

    #[test]
    fn test_real_steps_replace_each_other() {
        let events = vec![
            event("outline", 10.0),
            event("heartbeat", 15.0),
            event("lessons", 50.0),
            event("heartbeat", 55.0),
        ];
        let status = reduce(&events, Utc::now()).unwrap();
        assert_eq!(status.step.as_deref(), Some("lessons"));
    }

    #[test]
    fn test_step_matches_last_real_step_for_any_interleaving() {
        let steps = ["a", "heartbeat", "b", "heartbeat", "heartbeat", "c", "heartbeat"];
        for n in 1..=steps.len() {
            let events: Vec<_> = steps[..n].iter().map(|s| event(s, 0.0)).collect();
            let expected = steps[..n].iter().rev().find(|s| **s != "heartbeat").map(|s| s.to_string());
            assert_eq!(reduce(&events, Utc::now()).unwrap().step, expected);
        }
    }

    #[test]
    fn test_progress_regression_is_kept() {
        let status = reduce(&[event("a", 80.0), event("b", 30.0)], Utc::now()).unwrap();
        assert_eq!(status.progress, 30.0);
    }

    #[test]
    fn test_no_events_no_status() {
        assert!(reduce(&Vec::<JobEvent>::new(), Utc::now()).is_none());
    }

    #[test]
    fn test_decodes_camel_case_pull_payload() {
        let status: DerivedStatus = serde_json::from_value(serde_json::json!({
            "jobId": "job-9",
            "status": "running",
            "step": "render",
            "progress": 70,
        }))
        .unwrap();
        assert_eq!(status.job_id, JobId::from("job-9"));
        assert_eq!(status.state, JobStatus::Processing);
        assert_eq!(status.step.as_deref(), Some("render"));
    }
}
