use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{AgentId, AgentStatus, Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Manager,
    Worker,
    Custom(String),
}

impl AgentRole {
    pub fn as_str(&self) -> &str {
        match self {
            AgentRole::Manager => "manager",
            AgentRole::Worker => "worker",
            AgentRole::Custom(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub timeout_secs: u64,
    pub max_concurrent_tasks: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            timeout_secs: 3600,
            max_concurrent_tasks: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub specializations: BTreeSet<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl AgentConfig {
    pub fn worker(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: AgentRole::Worker,
            model: None,
            specializations: BTreeSet::new(),
            limits: ResourceLimits::default(),
        }
    }

    pub fn manager(name: impl Into<String>) -> Self {
        Self {
            role: AgentRole::Manager,
            ..Self::worker(name)
        }
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_specialization(mut self, tag: impl Into<String>) -> Self {
        self.specializations.insert(tag.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub model: Option<String>,
    pub specializations: BTreeSet<String>,
    pub limits: ResourceLimits,
    pub active_tasks: Vec<TaskId>,
    pub consecutive_timeouts: u32,
    pub completed_tasks: u32,
    /// Monotonic registration order, used as the final assignment tie-break.
    pub registration_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(config: AgentConfig, registration_seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new_v4(),
            name: config.name,
            role: config.role,
            status: AgentStatus::Starting,
            model: config.model,
            specializations: config.specializations,
            limits: config.limits,
            active_tasks: Vec::new(),
            consecutive_timeouts: 0,
            completed_tasks: 0,
            registration_seq,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_manager(&self) -> bool {
        self.role == AgentRole::Manager
    }

    pub fn assigned_work(&self) -> usize {
        self.active_tasks.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.assigned_work() < self.limits.max_concurrent_tasks.max(1)
    }

    pub fn specialization_overlap(&self, task: &Task) -> usize {
        task.required_specializations
            .intersection(&self.specializations)
            .count()
    }

    /// Managers never execute worker tasks. Custom agents are specialists and
    /// only take tasks sharing at least one specialization tag.
    pub fn can_handle(&self, task: &Task) -> bool {
        match &self.role {
            AgentRole::Manager => false,
            AgentRole::Worker => true,
            AgentRole::Custom(_) => self.specialization_overlap(task) > 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    pub role: Option<AgentRole>,
    pub status: Option<AgentStatus>,
    pub model: Option<String>,
}

impl AgentFilter {
    pub fn role(role: AgentRole) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.role.as_ref().map_or(true, |r| &agent.role == r)
            && self.status.map_or(true, |s| agent.status == s)
            && self
                .model
                .as_ref()
                .map_or(true, |m| agent.model.as_deref() == Some(m.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskDraft;

    fn task_requiring(tags: &[&str]) -> Task {
        let mut draft = TaskDraft::new("t", "d");
        for tag in tags {
            draft = draft.requires(*tag);
        }
        Task::from_draft(draft, 0, Default::default())
    }

    #[test]
    fn test_manager_never_handles_tasks() {
        let agent = Agent::new(AgentConfig::manager("lead"), 0);
        assert!(!agent.can_handle(&task_requiring(&[])));
    }

    #[test]
    fn test_custom_agent_needs_overlap() {
        let agent = Agent::new(
            AgentConfig::worker("sec")
                .with_role(AgentRole::Custom("auditor".to_string()))
                .with_specialization("auth"),
            0,
        );
        assert!(agent.can_handle(&task_requiring(&["auth"])));
        assert!(!agent.can_handle(&task_requiring(&["ui"])));
    }

    #[test]
    fn test_filter_by_model() {
        let agent = Agent::new(AgentConfig::worker("w").with_model("sonnet"), 0);
        let filter = AgentFilter {
            model: Some("sonnet".to_string()),
            ..AgentFilter::default()
        };
        assert!(filter.matches(&agent));
        assert!(!AgentFilter::status(AgentStatus::Idle).matches(&agent));
    }
}
