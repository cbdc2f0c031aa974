//! Per-job status reconciliation.
//!
//! A reconciler folds push events from its [`Subscription`] into a
//! [`DerivedStatus`] and, when the push side goes quiet for longer than
//! `stale_after`, pulls the status from a [`StatusSource`] on a fixed cadence.
//! Both sources stamp a single monotonic last-update clock; a pull result is
//! discarded if a push update landed after the pull was issued.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{DerivedStatus, JobEvent, JobId, HEARTBEAT_STEP};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::{self, FetchError, StatusSource};
use crate::config::{ReconcilerConfig, UpstreamConfig};
use crate::feed::Subscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub first_check: Duration,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub request_timeout: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&ReconcilerConfig::default(), &UpstreamConfig::default())
    }
}

impl ReconcilerSettings {
    pub fn from_config(reconciler: &ReconcilerConfig, upstream: &UpstreamConfig) -> Self {
        Self {
            first_check: Duration::from_secs(reconciler.first_check_secs),
            // interval() panics on a zero period
            poll_interval: Duration::from_secs(reconciler.poll_interval_secs.max(1)),
            stale_after: Duration::from_secs(reconciler.stale_after_secs),
            request_timeout: upstream.request_timeout(),
        }
    }
}

/// Owner side of a running reconciler. Dropping it tears the reconciler down.
pub struct ReconcilerHandle {
    job_id: Option<JobId>,
    status: watch::Receiver<Option<DerivedStatus>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// A handle with no job attached. It never exposes a status.
    pub fn idle() -> Self {
        let (_tx, status) = watch::channel(None);
        Self {
            job_id: None,
            status,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// A receiver that wakes only when the derived status changes value.
    pub fn subscribe(&self) -> watch::Receiver<Option<DerivedStatus>> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancels the reconciler and waits for its task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Some(job_id) = &self.job_id {
                log::debug!("Tearing down reconciler for job {}", job_id);
            }
            task.abort();
        }
    }
}

struct PullOutcome {
    issued_at: Instant,
    result: Result<DerivedStatus, FetchError>,
}

pub struct Reconciler {
    job_id: JobId,
    subscription: Subscription,
    source: Arc<dyn StatusSource>,
    settings: ReconcilerSettings,
    status_tx: watch::Sender<Option<DerivedStatus>>,
    cancel: CancellationToken,
    last_update: Option<Instant>,
    pulls: JoinSet<PullOutcome>,
}

impl Reconciler {
    /// Starts reconciling `job_id`. Must be called from within a tokio runtime.
    pub fn spawn(
        job_id: JobId,
        subscription: Subscription,
        source: Arc<dyn StatusSource>,
        settings: ReconcilerSettings,
    ) -> ReconcilerHandle {
        let (status_tx, status) = watch::channel(None);
        let cancel = CancellationToken::new();

        let reconciler = Reconciler {
            job_id: job_id.clone(),
            subscription,
            source,
            settings,
            status_tx,
            cancel: cancel.clone(),
            last_update: None,
            pulls: JoinSet::new(),
        };

        log::info!("Starting reconciler for job {}", job_id);
        let task = tokio::spawn(reconciler.run());

        ReconcilerHandle {
            job_id: Some(job_id),
            status,
            cancel,
            task: Some(task),
        }
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.settings.first_check,
            self.settings.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = self.subscription.recv(), if feed_open => match event {
                    Some(event) => self.apply_event(&event),
                    None => {
                        log::warn!("Event feed for job {} closed, relying on polling", self.job_id);
                        feed_open = false;
                    }
                },

                Some(joined) = self.pulls.join_next(), if !self.pulls.is_empty() => match joined {
                    Ok(outcome) => self.apply_pull(outcome),
                    Err(e) => log::warn!("Status pull task for job {} failed: {}", self.job_id, e),
                },

                _ = ticker.tick() => self.on_tick(),
            }
        }

        self.pulls.abort_all();
        log::info!("Reconciler for job {} stopped", self.job_id);
    }

    fn apply_event(&mut self, event: &JobEvent) {
        if event.job_id != self.job_id {
            return;
        }
        log::debug!(
            "Job {} event {} step={} status={} progress={}",
            self.job_id,
            event.id,
            event.kind.as_step(),
            event.status,
            event.progress
        );

        let next = DerivedStatus::fold(self.status_tx.borrow().as_ref(), event, Utc::now());
        self.last_update = Some(Instant::now());
        self.publish(next);
    }

    fn on_tick(&mut self) {
        // Nothing left to poll for; pushes are still applied.
        if self.status_tx.borrow().as_ref().is_some_and(|s| s.state.is_terminal()) {
            return;
        }

        let now = Instant::now();
        let stale = self
            .last_update
            .map_or(true, |t| now.duration_since(t) > self.settings.stale_after);
        if !stale {
            return;
        }
        if !self.pulls.is_empty() {
            log::debug!("Status pull for job {} still in flight, skipping tick", self.job_id);
            return;
        }

        log::debug!("No update for job {} within {:?}, pulling status", self.job_id, self.settings.stale_after);
        let source = self.source.clone();
        let job_id = self.job_id.clone();
        let timeout = self.settings.request_timeout;
        self.pulls.spawn(async move {
            let result = client::with_timeout(timeout, source.fetch_status(&job_id)).await;
            PullOutcome { issued_at: now, result }
        });
    }

    fn apply_pull(&mut self, outcome: PullOutcome) {
        let mut status = match outcome.result {
            Ok(status) => status,
            Err(e) => {
                log::warn!("Status pull for job {} failed: {}; keeping last known status", self.job_id, e);
                return;
            }
        };

        if self.last_update.is_some_and(|t| t > outcome.issued_at) {
            log::debug!("Discarding status pull for job {}: a newer update arrived", self.job_id);
            return;
        }

        status.job_id = self.job_id.clone();
        if status.step.as_deref() == Some(HEARTBEAT_STEP) {
            status.step = self.status_tx.borrow().as_ref().and_then(|s| s.step.clone());
        }
        self.last_update = Some(Instant::now());
        self.publish(status);
    }

    fn publish(&self, next: DerivedStatus) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.status_tx.send_if_modified(|current| {
            if current.as_ref() == Some(&next) {
                false
            } else {
                *current = Some(next);
                true
            }
        });
    }
}
