//! Task event stream variants.

use serde::{Deserialize, Serialize};

use crate::task::TaskResult;

/// Events emitted during a task attempt, in order:
/// `Start -> (Output | Progress)* -> (Complete | Error | Interrupt)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Start,
    Output {
        content: String,
    },
    Progress {
        percent: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<TaskResult>,
    },
    Error {
        message: String,
    },
    Interrupt,
}

impl TaskEvent {
    /// Whether this event closes the stream for the attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. } | Self::Interrupt)
    }
}

/// An event stamped with its task, sequence number and time, as persisted
/// in the orchestrator's per-task log and replayed to late subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEventEnvelope {
    pub task_id: String,
    pub seq: u64,
    pub timestamp: i64,
    pub event: TaskEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(TaskEvent::Complete { result: None }.is_terminal());
        assert!(
            TaskEvent::Error {
                message: "boom".to_string()
            }
            .is_terminal()
        );
        assert!(TaskEvent::Interrupt.is_terminal());
        assert!(!TaskEvent::Start.is_terminal());
        assert!(
            !TaskEvent::Output {
                content: "hi".to_string()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_event_tagged_serde() {
        let event = TaskEvent::Progress {
            percent: 42.0,
            message: Some("halfway".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"progress""#));
        let decoded: TaskEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }
}
