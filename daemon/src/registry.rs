use common::{DerivedStatus, JobEvent, JobId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::client::StatusSource;
use crate::feed::EventHub;
use crate::reconciler::{Reconciler, ReconcilerHandle, ReconcilerSettings};

type Slots = Arc<DashMap<JobId, Slot>>;

struct Slot {
    handle: ReconcilerHandle,
    generation: u64,
    watchers: usize,
}

/// Owns at most one reconciler per job id, kept alive while it has watchers.
pub struct Registry {
    reconcilers: Slots,
    generation: AtomicU64,
    hub: EventHub,
    source: Arc<dyn StatusSource>,
    settings: ReconcilerSettings,
}

impl Registry {
    pub fn new(hub: EventHub, source: Arc<dyn StatusSource>, settings: ReconcilerSettings) -> Self {
        Self {
            reconcilers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            hub,
            source,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Starts watching `job_id`, spawning a reconciler if the job is not
    /// watched yet (or its reconciler has exited). The reconciler is torn
    /// down when the last [`Watcher`] for the job is dropped.
    ///
    /// A blank id yields an idle watcher that never sees a status.
    pub fn watch(&self, job_id: &JobId) -> Watcher {
        if job_id.is_blank() {
            return Watcher {
                rx: ReconcilerHandle::idle().subscribe(),
                lease: None,
            };
        }

        let mut slot = self.reconcilers.entry(job_id.clone()).or_insert_with(|| Slot {
            handle: self.spawn(job_id),
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            watchers: 0,
        });

        if !slot.handle.is_running() {
            log::warn!("Reconciler for job {} had exited, restarting", job_id);
            slot.handle = self.spawn(job_id);
        }
        slot.watchers += 1;

        Watcher {
            rx: slot.handle.subscribe(),
            lease: Some(Lease {
                job_id: job_id.clone(),
                generation: slot.generation,
                reconcilers: self.reconcilers.clone(),
            }),
        }
    }

    fn spawn(&self, job_id: &JobId) -> ReconcilerHandle {
        Reconciler::spawn(
            job_id.clone(),
            self.hub.subscribe(job_id),
            self.source.clone(),
            self.settings,
        )
    }

    /// Tears down the reconciler for `job_id` regardless of its watchers.
    /// Returns false if it was not watched.
    pub fn unwatch(&self, job_id: &JobId) -> bool {
        match self.reconcilers.remove(job_id) {
            Some(_) => {
                log::info!("Stopped watching job {}", job_id);
                true
            }
            None => false,
        }
    }

    pub fn watched(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.reconcilers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn publish(&self, event: JobEvent) -> usize {
        self.hub.publish(event)
    }

    /// Stops every reconciler and waits for their tasks to exit.
    pub async fn shutdown(&self) {
        let ids = self.watched();
        let mut stopped = 0;
        for job_id in &ids {
            if let Some((_, slot)) = self.reconcilers.remove(job_id) {
                slot.handle.shutdown().await;
                stopped += 1;
            }
        }
        log::info!(
            "Stopped {} reconcilers, {} event topics still open",
            stopped,
            self.hub.topic_count()
        );
    }
}

/// A caller's interest in one job's status. Derefs to the status receiver.
pub struct Watcher {
    rx: watch::Receiver<Option<DerivedStatus>>,
    lease: Option<Lease>,
}

impl Deref for Watcher {
    type Target = watch::Receiver<Option<DerivedStatus>>;

    fn deref(&self) -> &Self::Target {
        &self.rx
    }
}

impl DerefMut for Watcher {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.rx
    }
}

struct Lease {
    job_id: JobId,
    generation: u64,
    reconcilers: Slots,
}

impl Drop for Lease {
    fn drop(&mut self) {
        // A slot from another generation was replaced after an unwatch.
        if let Entry::Occupied(mut slot) = self.reconcilers.entry(self.job_id.clone()) {
            if slot.get().generation != self.generation {
                return;
            }
            slot.get_mut().watchers -= 1;
            if slot.get().watchers == 0 {
                slot.remove();
                log::info!("Last watcher for job {} left, reconciler stopped", self.job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FetchError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingSource(AtomicUsize);

    impl CountingSource {
        fn calls(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusSource for CountingSource {
        async fn fetch_status(&self, _job_id: &JobId) -> Result<DerivedStatus, FetchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Status(404))
        }
    }

    fn registry(source: Arc<CountingSource>) -> Registry {
        Registry::new(EventHub::new(8), source, ReconcilerSettings::default())
    }

    fn counting() -> Arc<CountingSource> {
        Arc::new(CountingSource(AtomicUsize::new(0)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_reconciler_per_job() {
        let source = counting();
        let registry = registry(source.clone());
        let job = JobId::from("job-1");

        let _a = registry.watch(&job);
        let _b = registry.watch(&job);
        assert_eq!(registry.watched(), vec![job.clone()]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_tears_down() {
        let source = counting();
        let registry = registry(source.clone());
        let job = JobId::from("job-1");

        let mut rx = registry.watch(&job);
        assert!(registry.unwatch(&job));
        assert!(!registry.unwatch(&job));
        assert!(registry.watched().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls(), 0);
        assert!(rx.changed().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_watcher_dropping_stops_reconciler() {
        let source = counting();
        let registry = registry(source.clone());
        let job = JobId::from("job-1");

        let first = registry.watch(&job);
        let second = registry.watch(&job);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(source.calls(), 1);

        drop(first);
        assert_eq!(registry.watched(), vec![job.clone()]);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 2);

        drop(second);
        assert!(registry.watched().is_empty());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_watcher_does_not_release_new_slot() {
        let source = counting();
        let registry = registry(source.clone());
        let job = JobId::from("job-1");

        let old = registry.watch(&job);
        registry.unwatch(&job);
        let _current = registry.watch(&job);

        drop(old);
        assert_eq!(registry.watched(), vec![job]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_id_is_idle() {
        let source = counting();
        let registry = registry(source.clone());

        let mut rx = registry.watch(&JobId::from("  "));
        assert!(registry.watched().is_empty());
        assert!(rx.borrow_and_update().is_none());
        assert!(rx.changed().await.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let source = counting();
        let registry = registry(source.clone());
        let _a = registry.watch(&JobId::from("a"));
        let _b = registry.watch(&JobId::from("b"));

        registry.shutdown().await;
        assert!(registry.watched().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls(), 0);
    }
}
