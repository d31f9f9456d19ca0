//! Per-task event log with replay and live tailing.
//!
//! Events are appended to an in-memory log and fanned out over a
//! broadcast channel. Subscribers attached late replay the log first,
//! then follow the live feed; sequence numbers keep the two halves from
//! overlapping.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;

use agentflow_models::{TaskEvent, TaskEventEnvelope, now_millis};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct TaskLog {
    events: Vec<TaskEventEnvelope>,
    live: broadcast::Sender<TaskEventEnvelope>,
}

impl TaskLog {
    fn new() -> Self {
        let (live, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events: Vec::new(),
            live,
        }
    }
}

/// Event fan-out for all tasks plus a global audit feed.
pub struct EventBus {
    logs: Mutex<HashMap<String, TaskLog>>,
    audit: broadcast::Sender<TaskEventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (audit, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            logs: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// Append an event to the task's log and fan it out. Events for a
    /// given task are totally ordered by their sequence number.
    pub fn publish(&self, task_id: &str, event: TaskEvent) -> TaskEventEnvelope {
        let mut logs = self.logs.lock();
        let log = logs.entry(task_id.to_string()).or_insert_with(TaskLog::new);

        let envelope = TaskEventEnvelope {
            task_id: task_id.to_string(),
            seq: log.events.len() as u64,
            timestamp: now_millis(),
            event,
        };
        log.events.push(envelope.clone());
        let _ = log.live.send(envelope.clone());
        drop(logs);

        let _ = self.audit.send(envelope.clone());
        envelope
    }

    /// Subscribe to one task's events. Past events are replayed in order
    /// before the live feed; the lock ensures no event falls between the
    /// replay snapshot and the live subscription.
    pub fn subscribe(&self, task_id: &str) -> EventSubscription {
        let mut logs = self.logs.lock();
        let log = logs.entry(task_id.to_string()).or_insert_with(TaskLog::new);

        let replay: VecDeque<TaskEventEnvelope> = log.events.iter().cloned().collect();
        let next_seq = replay.len() as u64;
        let live = log.live.subscribe();

        EventSubscription {
            replay,
            live,
            next_seq,
            finished: false,
        }
    }

    /// Global feed of every task's events, for audit/telemetry consumers.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TaskEventEnvelope> {
        self.audit.subscribe()
    }

    /// The persisted log for a task.
    pub fn log(&self, task_id: &str) -> Vec<TaskEventEnvelope> {
        self.logs
            .lock()
            .get(task_id)
            .map(|l| l.events.clone())
            .unwrap_or_default()
    }

    /// Drop a task's log, e.g. on explicit cleanup.
    pub fn remove(&self, task_id: &str) {
        self.logs.lock().remove(task_id);
    }
}

/// Ordered event stream for one task: replay, then live tail. Ends after
/// a terminal event or when the bus side is dropped.
#[derive(Debug)]
pub struct EventSubscription {
    replay: VecDeque<TaskEventEnvelope>,
    live: broadcast::Receiver<TaskEventEnvelope>,
    next_seq: u64,
    finished: bool,
}

impl EventSubscription {
    /// Next event in order, or None once the stream is complete.
    pub async fn next(&mut self) -> Option<TaskEventEnvelope> {
        if self.finished {
            return None;
        }

        if let Some(envelope) = self.replay.pop_front() {
            if envelope.event.is_terminal() {
                self.finished = true;
            }
            return Some(envelope);
        }

        loop {
            match self.live.recv().await {
                Ok(envelope) => {
                    // Skip anything already delivered via replay.
                    if envelope.seq < self.next_seq {
                        continue;
                    }
                    self.next_seq = envelope.seq + 1;
                    if envelope.event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(envelope);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drain the stream into a vector of events (terminal-bounded).
    pub async fn collect_events(mut self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Some(envelope) = self.next().await {
            events.push(envelope.event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_models::TaskResult;

    #[tokio::test]
    async fn test_publish_orders_events() {
        let bus = EventBus::new();
        bus.publish("t1", TaskEvent::Start);
        bus.publish(
            "t1",
            TaskEvent::Output {
                content: "hi".to_string(),
            },
        );

        let log = bus.log("t1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].seq, 0);
        assert_eq!(log[1].seq, 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays() {
        let bus = EventBus::new();
        bus.publish("t1", TaskEvent::Start);
        bus.publish(
            "t1",
            TaskEvent::Output {
                content: "hi".to_string(),
            },
        );
        bus.publish(
            "t1",
            TaskEvent::Complete {
                result: Some(TaskResult::text("done")),
            },
        );

        let events = bus.subscribe("t1").collect_events().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], TaskEvent::Start);
        assert!(events[2].is_terminal());
    }

    #[tokio::test]
    async fn test_live_tail_after_replay() {
        let bus = EventBus::new();
        bus.publish("t1", TaskEvent::Start);

        let mut subscription = bus.subscribe("t1");
        // Replay part
        let first = subscription.next().await.unwrap();
        assert_eq!(first.event, TaskEvent::Start);

        bus.publish(
            "t1",
            TaskEvent::Complete {
                result: None,
            },
        );
        let second = subscription.next().await.unwrap();
        assert!(second.event.is_terminal());
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_streams_isolated_per_task() {
        let bus = EventBus::new();
        bus.publish("t1", TaskEvent::Start);
        bus.publish("t2", TaskEvent::Start);
        bus.publish("t2", TaskEvent::Interrupt);

        let t2_events = bus.subscribe("t2").collect_events().await;
        assert_eq!(t2_events.len(), 2);
        assert_eq!(bus.log("t1").len(), 1);
    }

    #[tokio::test]
    async fn test_audit_feed_sees_all_tasks() {
        let bus = EventBus::new();
        let mut audit = bus.subscribe_all();

        bus.publish("t1", TaskEvent::Start);
        bus.publish("t2", TaskEvent::Start);

        assert_eq!(audit.recv().await.unwrap().task_id, "t1");
        assert_eq!(audit.recv().await.unwrap().task_id, "t2");
    }
}
