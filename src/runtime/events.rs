use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::model::ExecState;

/// Engine events. Delivery is at-least-once; every handler must be
/// idempotent (reset and deletion cleanup are safe to run twice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Reset a task's bookkeeping and re-open it for assignment.
    TaskReset {
        instance_id: Uuid,
        task_id: Uuid,
        /// Caller-forced target state; None picks CheckCache/None from the
        /// process definition.
        forced_state: Option<ExecState>,
    },
    /// Reconciliation decided the graph vertex must match the durable record.
    StateCorrection {
        instance_id: Uuid,
        task_id: Uuid,
        target: ExecState,
    },
    /// A task entered CheckCache and awaits the cache collaborator.
    CacheCheckRegistration { instance_id: Uuid, task_id: Uuid },
    /// Tear down an instance's aggregates and queued tasks. The aggregate
    /// ids ride along because the instance record is gone by delivery time.
    Deletion {
        instance_id: Uuid,
        task_graph_id: Uuid,
        retry_state_id: Uuid,
        variable_state_id: Uuid,
    },
    /// Re-evaluate assignment for this instance now, without waiting for
    /// the next tick.
    FindNewTasks { instance_id: Uuid },
}

impl Event {
    pub fn instance_id(&self) -> Uuid {
        match self {
            Event::TaskReset { instance_id, .. }
            | Event::StateCorrection { instance_id, .. }
            | Event::CacheCheckRegistration { instance_id, .. }
            | Event::Deletion { instance_id, .. }
            | Event::FindNewTasks { instance_id } => *instance_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskReset { .. } => "task_reset",
            Event::StateCorrection { .. } => "state_correction",
            Event::CacheCheckRegistration { .. } => "cache_check",
            Event::Deletion { .. } => "deletion",
            Event::FindNewTasks { .. } => "find_new_tasks",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub event: Event,
    pub attempt: u32,
}

/// In-process publish side of the event bus. The engine owns the receiving
/// loop and fans events out to per-instance runners.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Envelope>,
    redelivery_limit: u32,
}

impl EventBus {
    pub fn channel(capacity: usize, redelivery_limit: u32) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, redelivery_limit }, rx)
    }

    pub async fn publish(&self, event: Event) -> Result<()> {
        self.tx
            .send(Envelope { event, attempt: 0 })
            .await
            .map_err(|_| EngineError::QueueClosed)
    }

    /// Publish from inside a handler without risking a deadlock on a full
    /// channel: the send is spawned, mirroring how task fan-out is flushed.
    pub fn publish_detached(&self, event: Event) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tx.send(Envelope { event, attempt: 0 }).await {
                error!("Failed to publish event (bus closed?): {}", e);
            }
        });
    }

    /// Requeue a failed delivery. Gives up (and logs the payload loudly)
    /// past the redelivery limit.
    pub fn redeliver(&self, mut envelope: Envelope) {
        envelope.attempt += 1;
        if envelope.attempt > self.redelivery_limit {
            error!(
                event = envelope.event.kind(),
                instance_id = %envelope.event.instance_id(),
                attempts = envelope.attempt,
                payload = ?envelope.event,
                "Event dropped after exhausting redeliveries"
            );
            return;
        }
        warn!(
            event = envelope.event.kind(),
            instance_id = %envelope.event.instance_id(),
            attempt = envelope.attempt,
            "Redelivering event"
        );
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(envelope).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let (bus, mut rx) = EventBus::channel(8, 3);
        let id = Uuid::new_v4();
        bus.publish(Event::FindNewTasks { instance_id: id }).await.unwrap();
        let env = rx.recv().await.unwrap();
        assert_eq!(env.attempt, 0);
        assert_eq!(env.event.instance_id(), id);
    }

    #[tokio::test]
    async fn redeliver_bumps_attempt_and_stops_at_limit() {
        let (bus, mut rx) = EventBus::channel(8, 1);
        let id = Uuid::new_v4();
        let event = Event::Deletion {
            instance_id: id,
            task_graph_id: Uuid::new_v4(),
            retry_state_id: Uuid::new_v4(),
            variable_state_id: Uuid::new_v4(),
        };

        bus.redeliver(Envelope { event: event.clone(), attempt: 0 });
        let env = rx.recv().await.unwrap();
        assert_eq!(env.attempt, 1);

        // Past the limit: dropped, nothing arrives.
        bus.redeliver(env);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
