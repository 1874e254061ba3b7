//! Event types for the pipeline event system
//!
//! Job lifecycle and backfill events are broadcast on an [`EventBus`] and
//! can be serialized for SSE transmission. Emission never blocks a producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Pipeline event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A new job row was persisted and handed to the queue
    JobAdmitted {
        job_id: i64,
        artifact_id: String,
        stage: String,
        /// Producer that asked for the job (watcher, backfill, api)
        source: String,
        timestamp: DateTime<Utc>,
    },

    /// A worker claimed the job and invoked its stage
    JobStarted {
        job_id: i64,
        artifact_id: String,
        stage: String,
        timestamp: DateTime<Utc>,
    },

    /// A job reached a terminal status
    JobFinished {
        job_id: i64,
        artifact_id: String,
        stage: String,
        /// Terminal job status (succeeded, failed, cancelled)
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A persisted job could not be placed on the queue
    JobDropped {
        job_id: i64,
        artifact_id: String,
        stage: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// One backfill reconciliation pass finished
    BackfillCompleted {
        total_candidates: usize,
        already_processed: usize,
        unprocessed: usize,
        selected: usize,
        enqueued: usize,
        dropped_full: usize,
        other_errors: usize,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::JobAdmitted { .. } => "JobAdmitted",
            PipelineEvent::JobStarted { .. } => "JobStarted",
            PipelineEvent::JobFinished { .. } => "JobFinished",
            PipelineEvent::JobDropped { .. } => "JobDropped",
            PipelineEvent::BackfillCompleted { .. } => "BackfillCompleted",
        }
    }
}

/// Broadcast bus for [`PipelineEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(job_id: i64) -> PipelineEvent {
        PipelineEvent::JobStarted {
            job_id,
            artifact_id: "call-001.mp3".to_string(),
            stage: "INGEST".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.emit_lossy(started(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit_lossy(started(1));
        bus.emit_lossy(started(2));

        let ids: Vec<i64> = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|event| match event {
                PipelineEvent::JobStarted { job_id, .. } => job_id,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let json = serde_json::to_value(started(7)).unwrap();
        assert_eq!(json["type"], "JobStarted");
        assert_eq!(json["job_id"], 7);
        assert_eq!(started(7).event_type(), "JobStarted");
    }
}
