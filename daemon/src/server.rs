//! Unix socket front end: newline-delimited JSON requests and responses.

use anyhow::Result;
use common::{JobEvent, JobId, Request, Response};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::audit::{self, AuditThresholds};
use crate::client::JobSource;
use crate::config::AuditConfig;
use crate::registry::Registry;

pub struct AppState {
    pub registry: Registry,
    pub jobs: Arc<dyn JobSource>,
    pub audit: AuditConfig,
}

pub async fn serve(listener: UnixListener, state: Arc<AppState>) -> Result<()> {
    loop {
        let (socket, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, state).await {
                log::error!("Connection closed with error: {:#}", e);
            }
        });
    }
}

async fn handle_connection(socket: UnixStream, state: Arc<AppState>) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut queued = None;

    loop {
        let line = match queued.take() {
            Some(line) => line,
            None => match lines.next_line().await? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                log::error!("failed to deserialize request; err = {:?}", e);
                write_response(&mut writer, &Response::Error(format!("Invalid request: {}", e))).await?;
                continue;
            }
        };

        // Keep reading while a request is answered so a hangup drops its watchers.
        let handling = handle_request(&state, req, &mut writer);
        tokio::pin!(handling);
        loop {
            tokio::select! {
                biased;

                res = &mut handling => {
                    res?;
                    break;
                }

                line = lines.next_line(), if queued.is_none() => match line? {
                    Some(line) => queued = Some(line),
                    None => {
                        log::debug!("Client hung up before its request finished");
                        return Ok(());
                    }
                },
            }
        }
    }
    Ok(())
}

async fn write_response<W>(writer: &mut W, resp: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(resp)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes one `Status` line per change, then `Ok` once the job is terminal.
/// Ends with `Error` if the job stops being watched first.
async fn stream_status<W>(state: &AppState, job_id: JobId, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    log::info!("Streaming status for job {}", job_id);
    let mut rx = state.registry.watch(&job_id);
    loop {
        let current = rx.borrow_and_update().clone();
        let finished = current.as_ref().is_some_and(|s| s.state.is_terminal());

        if current.is_some() {
            write_response(writer, &Response::Status(current)).await?;
        }
        if finished {
            return write_response(writer, &Response::Ok).await;
        }
        if rx.changed().await.is_err() {
            let msg = format!("Job {} is no longer watched", job_id);
            return write_response(writer, &Response::Error(msg)).await;
        }
    }
}

/// Answers one request. `Watch` streams until the job finishes; everything
/// else gets a single response line.
pub async fn handle_request<W>(state: &AppState, req: Request, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let resp = match req {
        Request::Watch(job_id) => return stream_status(state, job_id, writer).await,
        Request::GetStatus(job_id) => {
            let mut rx = state.registry.watch(&job_id);
            if rx.borrow_and_update().is_none() {
                // Give a fresh reconciler time for its first pull.
                let settings = state.registry.settings();
                let wait = settings.first_check + settings.request_timeout;
                let _ = tokio::time::timeout(wait, rx.changed()).await;
            }
            let status = rx.borrow().clone();
            Response::Status(status)
        }
        Request::Unwatch(job_id) => {
            if state.registry.unwatch(&job_id) {
                Response::Ok
            } else {
                Response::Error(format!("Job {} is not watched", job_id))
            }
        }
        Request::ListWatched => Response::Watched(state.registry.watched()),
        Request::PublishEvent(event) => {
            let event = stamp(event);
            log::debug!("Publishing event {} for job {}", event.id, event.job_id);
            state.registry.publish(event);
            Response::Ok
        }
        Request::Audit {
            max_queued_min,
            max_processing_min,
        } => {
            let thresholds = AuditThresholds::new(
                max_queued_min.unwrap_or(state.audit.max_queued_min),
                max_processing_min.unwrap_or(state.audit.max_processing_min),
            );
            let outcome = audit::run_audit(state.jobs.as_ref(), thresholds, state.audit.list_limit).await;
            Response::Audit(outcome)
        }
    };
    write_response(writer, &resp).await
}

fn stamp(mut event: JobEvent) -> JobEvent {
    if event.id.is_empty() {
        event.id = uuid::Uuid::new_v4().to_string();
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FetchError, StatusSource};
    use crate::feed::EventHub;
    use crate::reconciler::ReconcilerSettings;
    use async_trait::async_trait;
    use chrono::Utc;
    use common::{AuditOutcome, DerivedStatus, EventKind, JobStatus};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    struct Upstream {
        state: JobStatus,
        calls: AtomicUsize,
    }

    impl Upstream {
        fn new(state: JobStatus) -> Arc<Self> {
            Arc::new(Self {
                state,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusSource for Upstream {
        async fn fetch_status(&self, job_id: &JobId) -> Result<DerivedStatus, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DerivedStatus {
                job_id: job_id.clone(),
                state: self.state,
                step: None,
                progress: 0.0,
                message: None,
                last_update: Utc::now(),
            })
        }
    }

    #[async_trait]
    impl JobSource for Upstream {
        async fn list_jobs(&self, _limit: usize) -> Result<Value, FetchError> {
            Ok(json!({"items": [
                {"id": "q1", "status": "queued", "updated_at": "2000-01-01T00:00:00Z", "log_count": 1}
            ]}))
        }
    }

    fn state_with(upstream: Arc<Upstream>) -> AppState {
        AppState {
            registry: Registry::new(EventHub::new(16), upstream.clone(), ReconcilerSettings::default()),
            jobs: upstream,
            audit: AuditConfig::default(),
        }
    }

    fn state() -> AppState {
        state_with(Upstream::new(JobStatus::Queued))
    }

    async fn ask(state: &AppState, req: Request) -> Response {
        let mut out = Vec::new();
        handle_request(state, req, &mut out).await.unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    fn event(step: &str, status: JobStatus, progress: f64) -> JobEvent {
        JobEvent {
            id: String::new(),
            job_id: JobId::from("job-1"),
            kind: EventKind::from_step(step),
            status,
            progress,
            message: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_status_waits_for_first_pull() {
        let state = state();
        match ask(&state, Request::GetStatus(JobId::from("job-1"))).await {
            Response::Status(Some(status)) => assert_eq!(status.state, JobStatus::Queued),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(state.registry.watched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_status_leaves_no_pollers() {
        let upstream = Upstream::new(JobStatus::Done);
        let state = state_with(upstream.clone());

        for i in 0..50 {
            match ask(&state, Request::GetStatus(JobId(format!("job-{i}")))).await {
                Response::Status(Some(status)) => assert_eq!(status.state, JobStatus::Done),
                other => panic!("unexpected response: {:?}", other),
            }
        }
        assert!(state.registry.watched().is_empty());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(upstream.calls(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_job_id_has_no_status() {
        let state = state();
        assert!(matches!(
            ask(&state, Request::GetStatus(JobId::from(""))).await,
            Response::Status(None)
        ));
        assert!(state.registry.watched().is_empty());
    }

    #[tokio::test]
    async fn test_unwatch_unknown_job_is_error() {
        let state = state();
        assert!(matches!(
            ask(&state, Request::Unwatch(JobId::from("nope"))).await,
            Response::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_audit_uses_request_thresholds() {
        let state = state();
        let resp = ask(
            &state,
            Request::Audit { max_queued_min: Some(-3), max_processing_min: None },
        )
        .await;

        match resp {
            Response::Audit(AuditOutcome::Completed(report)) => {
                assert_eq!(report.suspects.len(), 1);
                assert_eq!(report.suspects[0].reason, "queued > 1m");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ends_on_terminal_status() {
        let state = Arc::new(state());
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        let streaming = {
            let state = state.clone();
            tokio::spawn(async move {
                handle_request(&state, Request::Watch(JobId::from("job-1")), &mut server).await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(state.registry.watched(), vec![JobId::from("job-1")]);

        for (step, status, progress) in [
            ("outline", JobStatus::Processing, 10.0),
            ("heartbeat", JobStatus::Processing, 20.0),
            ("publish", JobStatus::Done, 100.0),
        ] {
            ask(&state, Request::PublishEvent(event(step, status, progress))).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        streaming.await.unwrap().unwrap();
        assert!(state.registry.watched().is_empty());

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        let lines: Vec<Response> = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();

        assert!(matches!(lines.last(), Some(Response::Ok)));
        let steps: Vec<_> = lines
            .iter()
            .filter_map(|r| match r {
                Response::Status(Some(s)) => Some((s.step.clone(), s.progress)),
                _ => None,
            })
            .collect();
        assert_eq!(
            steps,
            vec![
                (Some("outline".to_string()), 10.0),
                (Some("outline".to_string()), 20.0),
                (Some("publish".to_string()), 100.0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_during_watch_stops_reconciler() {
        let upstream = Upstream::new(JobStatus::Queued);
        let state = Arc::new(state_with(upstream.clone()));
        let (client, server) = UnixStream::pair().unwrap();
        let conn = tokio::spawn(handle_connection(server, state.clone()));

        let (reader, mut writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();
        let req = serde_json::to_string(&Request::Watch(JobId::from("job-1"))).unwrap();
        writer.write_all(format!("{}\n", req).as_bytes()).await.unwrap();

        let first: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(first, Response::Status(Some(s)) if s.state == JobStatus::Queued));
        assert_eq!(state.registry.watched(), vec![JobId::from("job-1")]);

        drop(writer);
        drop(lines);
        conn.await.unwrap().unwrap();
        assert!(state.registry.watched().is_empty());

        let calls = upstream.calls();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(upstream.calls(), calls);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let path = std::env::temp_dir().join(format!("jobwatch-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve(listener, Arc::new(state())));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"not json\n").await.unwrap();
        let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(resp, Response::Error(_)));

        let req = serde_json::to_string(&Request::ListWatched).unwrap();
        writer.write_all(format!("{}\n", req).as_bytes()).await.unwrap();
        let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(resp, Response::Watched(ids) if ids.is_empty()));

        std::fs::remove_file(&path).unwrap();
    }
}
