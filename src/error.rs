use std::time::Duration;
use thiserror::Error;

use crate::types::{AgentId, AgentStatus, SessionId, TaskId, TaskStatus};

/// Failures reported by the execution engine. The coordinator treats every
/// variant as a communication failure.
#[derive(Debug, Clone, Error)]
pub enum ExecutionFailure {
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("execution error: {0}")]
    ExecutionError(String),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
}

impl ExecutionFailure {
    pub fn from_message(msg: &str) -> Self {
        if msg.contains("429") || msg.to_lowercase().contains("rate limit") {
            return Self::RateLimited {
                retry_after_secs: None,
            };
        }
        Self::ExecutionError(msg.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("maximum number of agents reached ({0})")]
    MaxAgentsReached(usize),

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("invalid transition for {entity} from {from} to {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("task dependencies form a cycle: {}", format_cycle(.0))]
    TaskDependencyCycle(Vec<TaskId>),

    #[error("no eligible idle agent for task {0}")]
    TaskAssignmentFailed(TaskId),

    #[error("agent {agent_id} did not respond within {timeout:?}")]
    CommunicationTimeout { agent_id: AgentId, timeout: Duration },

    #[error("task {task_id} exhausted its retries: {reason}")]
    QualityGateExhausted { task_id: TaskId, reason: String },

    #[error("task {0} exceeded its execution timeout")]
    TaskExecutionTimeout(TaskId),

    #[error("system overloaded: {0}")]
    SystemOverload(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CoordinationError {
    pub fn agent_transition(id: AgentId, from: AgentStatus, to: AgentStatus) -> Self {
        Self::InvalidTransition {
            entity: format!("agent {}", id),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    pub fn task_transition(id: TaskId, from: TaskStatus, to: TaskStatus) -> Self {
        Self::InvalidTransition {
            entity: format!("task {}", id),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AgentNotFound(_) | Self::TaskNotFound(_) | Self::SessionNotFound(_)
        )
    }

    pub fn is_communication_failure(&self) -> bool {
        matches!(self, Self::CommunicationTimeout { .. } | Self::Execution(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MaxAgentsReached(_) => "MaxAgentsReached",
            Self::AgentNotFound(_) => "AgentNotFound",
            Self::TaskNotFound(_) => "TaskNotFound",
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::TaskDependencyCycle(_) => "TaskDependencyCycle",
            Self::TaskAssignmentFailed(_) => "TaskAssignmentFailed",
            Self::CommunicationTimeout { .. } => "CommunicationTimeout",
            Self::QualityGateExhausted { .. } => "QualityGateExhausted",
            Self::TaskExecutionTimeout(_) => "TaskExecutionTimeout",
            Self::SystemOverload(_) => "SystemOverload",
            Self::Validation(_) => "Validation",
            Self::Execution(_) => "ExecutionFailure",
            Self::Storage(_) => "Storage",
        }
    }
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;
