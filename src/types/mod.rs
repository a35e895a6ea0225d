pub mod agent;
pub mod event;
pub mod message;
pub mod quality;
pub mod session;
pub mod task;

pub use agent::{Agent, AgentConfig, AgentFilter, AgentRole, ResourceLimits};
pub use event::{Event, EventType};
pub use message::{Message, MessagePayload, MessageType};
pub use quality::{
    AcceptanceCriteria, CompletionAssessment, CompletionDecision, Deliverable, Finding,
    FindingSeverity, QualityGateResult,
};
pub use session::{
    CoordinationSession, SessionOutcome, SessionReport, SessionSnapshot, TaskSummary,
};
pub use task::{Task, TaskConfig, TaskDraft, TaskNote};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AgentId = Uuid;
pub type TaskId = Uuid;
pub type SessionId = Uuid;
pub type MessageId = Uuid;
pub type CorrelationId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Idle,
    Busy,
    Paused,
    Error,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
            AgentStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == AgentStatus::Terminated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Structured signal returned by the execution engine alongside the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    Done,
    Working,
    Blocked,
    Unknown,
}

impl CompletionSignal {
    pub fn as_str(&self) -> &str {
        match self {
            CompletionSignal::Done => "done",
            CompletionSignal::Working => "working",
            CompletionSignal::Blocked => "blocked",
            CompletionSignal::Unknown => "unknown",
        }
    }
}
