//! Push side of status reconciliation.
//!
//! Producers publish [`JobEvent`]s into the hub; each job id has its own
//! broadcast topic, created on first subscription and dropped once the last
//! subscriber goes away.

use common::{JobEvent, JobId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventHub {
    topics: Arc<DashMap<JobId, broadcast::Sender<JobEvent>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers interest in events for `job_id`. Events published before
    /// this call are not delivered.
    pub fn subscribe(&self, job_id: &JobId) -> Subscription {
        let rx = self
            .topics
            .entry(job_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        Subscription {
            job_id: job_id.clone(),
            rx,
            topics: self.topics.clone(),
        }
    }

    /// Returns the number of subscribers the event reached.
    pub fn publish(&self, event: JobEvent) -> usize {
        let Some(sender) = self.topics.get(&event.job_id).map(|s| s.clone()) else {
            log::debug!("No subscribers for job {}, dropping event {}", event.job_id, event.id);
            return 0;
        };

        match sender.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                self.topics.remove_if(&event.job_id, |_, s| s.receiver_count() == 0);
                0
            }
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// A live subscription to one job's events. Dropping it unsubscribes.
pub struct Subscription {
    job_id: JobId,
    rx: broadcast::Receiver<JobEvent>,
    topics: Arc<DashMap<JobId, broadcast::Sender<JobEvent>>>,
}

impl Subscription {
    /// Next event in delivery order, or `None` once the hub is gone.
    /// Events lost to a slow receiver are skipped with a warning.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscription for job {} lagged, skipped {} events", self.job_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Our receiver still counts here, so the topic is idle at 1.
        self.topics
            .remove_if(&self.job_id, |_, s| s.receiver_count() <= 1);
    }
}
