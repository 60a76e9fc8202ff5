//! In-memory [`QueueAdapter`] for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::adapter::{Job, QueueAdapter, QueueError, SendOptions};

#[derive(Debug, Clone)]
struct Envelope {
    job: Job,
    visible_at: chrono::DateTime<Utc>,
    claimed: bool,
}

/// In-memory [`QueueAdapter`], one `Vec<Envelope>` per queue name
/// protected by a single mutex — adequate for tests, not for
/// throughput.
#[derive(Default)]
pub struct InMemoryQueueAdapter {
    queues: Mutex<HashMap<String, Vec<Envelope>>>,
}

impl InMemoryQueueAdapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueueAdapter {
    async fn create_queue(&self, name: &str) -> Result<(), QueueError> {
        self.queues
            .lock()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn send(
        &self,
        queue_name: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let envelope = Envelope {
            job: Job {
                id: id.clone(),
                queue_name: queue_name.to_string(),
                payload,
                attempt: 0,
            },
            visible_at: options.start_after.unwrap_or_else(Utc::now),
            claimed: false,
        };
        self.queues
            .lock()
            .await
            .entry(queue_name.to_string())
            .or_default()
            .push(envelope);
        Ok(id)
    }

    async fn claim(&self, queue_name: &str, batch_size: usize) -> Result<Vec<Job>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(envelopes) = queues.get_mut(queue_name) else {
            return Ok(vec![]);
        };

        let now = Utc::now();
        let mut claimed = Vec::new();
        for envelope in envelopes.iter_mut() {
            if claimed.len() >= batch_size {
                break;
            }
            if !envelope.claimed && envelope.visible_at <= now {
                envelope.claimed = true;
                envelope.job.attempt += 1;
                claimed.push(envelope.job.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, queue_name: &str, job_id: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        if let Some(envelopes) = queues.get_mut(queue_name) {
            envelopes.retain(|e| e.job.id != job_id);
        }
        Ok(())
    }

    async fn nack(&self, queue_name: &str, job_id: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        if let Some(envelopes) = queues.get_mut(queue_name) {
            if let Some(envelope) = envelopes.iter_mut().find(|e| e.job.id == job_id) {
                envelope.claimed = false;
            }
        }
        Ok(())
    }

    async fn schedule(
        &self,
        queue_name: &str,
        _cron_expression: &str,
        _payload: Value,
        _tz: chrono_tz::Tz,
    ) -> Result<(), QueueError> {
        // Cron fan-out for the in-memory adapter is driven directly by
        // `crate::engine::CronScheduler`'s own tick loop rather than by
        // the queue, so this is a no-op bookkeeping call.
        self.create_queue(queue_name).await
    }

    async fn unschedule(&self, _queue_name: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_then_claim_round_trips_payload() {
        let queue = InMemoryQueueAdapter::new();
        queue.create_queue("q").await.unwrap();
        queue
            .send("q", json!({"n": 1}), SendOptions::default())
            .await
            .unwrap();

        let claimed = queue.claim("q", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, json!({"n": 1}));
        assert_eq!(claimed[0].attempt, 1);
    }

    #[tokio::test]
    async fn claimed_jobs_are_not_claimed_twice_until_nacked() {
        let queue = InMemoryQueueAdapter::new();
        queue.create_queue("q").await.unwrap();
        let id = queue
            .send("q", json!({}), SendOptions::default())
            .await
            .unwrap();

        assert_eq!(queue.claim("q", 10).await.unwrap().len(), 1);
        assert_eq!(queue.claim("q", 10).await.unwrap().len(), 0);

        queue.nack("q", &id).await.unwrap();
        assert_eq!(queue.claim("q", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delayed_jobs_are_invisible_until_start_after() {
        let queue = InMemoryQueueAdapter::new();
        queue.create_queue("q").await.unwrap();
        queue
            .send(
                "q",
                json!({}),
                SendOptions {
                    start_after: Some(Utc::now() + chrono::Duration::hours(1)),
                    expire_in_seconds: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(queue.claim("q", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn ack_removes_the_job() {
        let queue = InMemoryQueueAdapter::new();
        queue.create_queue("q").await.unwrap();
        let id = queue
            .send("q", json!({}), SendOptions::default())
            .await
            .unwrap();
        queue.claim("q", 10).await.unwrap();
        queue.ack("q", &id).await.unwrap();
        queue.nack("q", &id).await.unwrap();
        assert_eq!(queue.claim("q", 10).await.unwrap().len(), 0);
    }
}
