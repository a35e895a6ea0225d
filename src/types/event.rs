use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentCreated,
    AgentStatusUpdate,
    AgentError,
    TaskCreated,
    TaskStatusUpdate,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    AgentCommunication,
    SystemAlert,
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::AgentCreated => "agent_created",
            EventType::AgentStatusUpdate => "agent_status_update",
            EventType::AgentError => "agent_error",
            EventType::TaskCreated => "task_created",
            EventType::TaskStatusUpdate => "task_status_update",
            EventType::TaskProgress => "task_progress",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::AgentCommunication => "agent_communication",
            EventType::SystemAlert => "system_alert",
        }
    }
}

/// Monitoring event emitted for every state transition and message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub entity_id: Uuid,
    pub previous_state: Option<String>,
    pub new_state: Option<String>,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: EventType, entity_id: Uuid) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            entity_id,
            previous_state: None,
            new_state: None,
            payload: Value::Null,
        }
    }

    pub fn transition(
        event_type: EventType,
        entity_id: Uuid,
        previous: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        Self {
            previous_state: Some(previous.into()),
            new_state: Some(new.into()),
            ..Self::new(event_type, entity_id)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}
