//! Run lifecycle and progress events.
//!
//! The engine publishes every [`PipelineEvent`] on one broadcast channel.
//! Observers (the CLI progress printer, a protocol adapter, log shippers)
//! subscribe either to the raw receiver or to a lag-tolerant stream.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::progress::ProgressEvent;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Serialized as `{"event": "stage_started", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        operation: String,
        session_id: String,
        stage_count: usize,
    },
    RunCompleted {
        run_id: String,
        operation: String,
        completed_stages: Vec<String>,
        duration_ms: u64,
    },
    RunFailed {
        run_id: String,
        operation: String,
        stage: Option<String>,
        error: String,
    },
    StageStarted {
        run_id: String,
        stage: String,
        tool: String,
    },
    StageCompleted {
        run_id: String,
        stage: String,
        attempts: usize,
        duration_ms: u64,
    },
    StageFailed {
        run_id: String,
        stage: String,
        error: String,
    },
    /// `attempt` is the attempt about to start.
    StageRetrying {
        run_id: String,
        stage: String,
        attempt: usize,
        delay_ms: u64,
    },
    CheckpointCreated {
        run_id: String,
        session_id: String,
        checkpoint_id: String,
    },
    Progress(ProgressEvent),
}

impl PipelineEvent {
    /// The run this event belongs to. Progress events carry it as their trace ID.
    pub fn run_id(&self) -> &str {
        match self {
            PipelineEvent::RunStarted { run_id, .. }
            | PipelineEvent::RunCompleted { run_id, .. }
            | PipelineEvent::RunFailed { run_id, .. }
            | PipelineEvent::StageStarted { run_id, .. }
            | PipelineEvent::StageCompleted { run_id, .. }
            | PipelineEvent::StageFailed { run_id, .. }
            | PipelineEvent::StageRetrying { run_id, .. }
            | PipelineEvent::CheckpointCreated { run_id, .. } => run_id,
            PipelineEvent::Progress(p) => &p.trace_id,
        }
    }

    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::RunCompleted { .. } | PipelineEvent::RunFailed { .. }
        )
    }
}

/// Cheap to clone; every clone publishes on the same channel.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Dropped when nobody listens.
    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Events as a `Stream`. A consumer that falls behind skips the missed
    /// events with a warning and keeps receiving.
    pub fn stream(&self) -> impl tokio_stream::Stream<Item = PipelineEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event subscriber lagged");
                None
            }
        })
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn retrying(attempt: usize) -> PipelineEvent {
        PipelineEvent::StageRetrying {
            run_id: "r1".into(),
            stage: "build".into(),
            attempt,
            delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn subscribers_each_get_a_copy() {
        let emitter = EventEmitter::new(16);
        let mut first = emitter.subscribe();
        let mut second = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        emitter.emit(PipelineEvent::RunStarted {
            run_id: "r1".into(),
            operation: "build".into(),
            session_id: "s1".into(),
            stage_count: 3,
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                PipelineEvent::RunStarted { stage_count, .. } => assert_eq!(stage_count, 3),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let emitter = EventEmitter::default();
        emitter.emit(PipelineEvent::RunFailed {
            run_id: "r1".into(),
            operation: "deploy".into(),
            stage: None,
            error: "cluster unreachable".into(),
        });
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_a_snake_case_tag() {
        let value = serde_json::to_value(PipelineEvent::CheckpointCreated {
            run_id: "r1".into(),
            session_id: "s1".into(),
            checkpoint_id: "c1".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"event": "checkpoint_created", "run_id": "r1", "session_id": "s1", "checkpoint_id": "c1"})
        );

        let back: PipelineEvent = serde_json::from_value(json!({
            "event": "stage_started", "run_id": "r2", "stage": "build", "tool": "build_image"
        }))
        .unwrap();
        assert_eq!(back.run_id(), "r2");
        assert!(!back.is_run_terminal());
    }

    #[tokio::test]
    async fn stream_skips_lagged_events() {
        let emitter = EventEmitter::new(2);
        let mut stream = Box::pin(emitter.stream());

        for attempt in 1..=5 {
            emitter.emit(retrying(attempt));
        }

        // Only the two newest fit in the channel.
        match stream.next().await {
            Some(PipelineEvent::StageRetrying { attempt, .. }) => assert_eq!(attempt, 4),
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next().await {
            Some(PipelineEvent::StageRetrying { attempt, .. }) => assert_eq!(attempt, 5),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
