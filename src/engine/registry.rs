use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};

use crate::error::{CoordinationError, CoordinationResult};
use crate::lifecycle::AgentStateMachine;
use crate::notification::EventBus;
use crate::types::{
    Agent, AgentConfig, AgentFilter, AgentId, AgentStatus, Event, EventType, ResourceLimits, Task,
    TaskId,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub status: Option<AgentStatus>,
    pub specializations: Option<BTreeSet<String>>,
    pub limits: Option<ResourceLimits>,
    pub model: Option<String>,
}

pub struct AgentRegistry {
    agents: HashMap<AgentId, Agent>,
    order: Vec<AgentId>,
    max_agents: usize,
    events: EventBus,
}

impl AgentRegistry {
    pub fn new(max_agents: usize, events: EventBus) -> Self {
        Self {
            agents: HashMap::new(),
            order: Vec::new(),
            max_agents,
            events,
        }
    }

    pub fn create(&mut self, config: AgentConfig) -> CoordinationResult<Agent> {
        if config.name.trim().is_empty() {
            return Err(CoordinationError::Validation(
                "agent name must not be empty".to_string(),
            ));
        }
        if self.live_count() >= self.max_agents {
            return Err(CoordinationError::MaxAgentsReached(self.max_agents));
        }

        let agent = Agent::new(config, self.order.len() as u64);
        log::info!(
            "registered {} agent '{}' ({})",
            agent.role.as_str(),
            agent.name,
            agent.id
        );
        self.events.publish(
            Event::new(EventType::AgentCreated, agent.id).with_payload(json!({
                "name": agent.name,
                "role": agent.role.as_str(),
                "status": agent.status.as_str(),
            })),
        );

        self.order.push(agent.id);
        self.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    pub fn transition(
        &mut self,
        agent_id: &AgentId,
        status: AgentStatus,
    ) -> CoordinationResult<AgentStatus> {
        let agent = self.get_mut(agent_id)?;
        let previous = AgentStateMachine::transition(agent, status)?;

        log::debug!(
            "agent {} {} -> {}",
            agent_id,
            previous.as_str(),
            status.as_str()
        );
        let event_type = if status == AgentStatus::Error {
            EventType::AgentError
        } else {
            EventType::AgentStatusUpdate
        };
        self.events.publish(Event::transition(
            event_type,
            *agent_id,
            previous.as_str(),
            status.as_str(),
        ));
        Ok(previous)
    }

    pub fn update(&mut self, agent_id: &AgentId, update: AgentUpdate) -> CoordinationResult<Agent> {
        if self.get(agent_id)?.status.is_terminal() {
            return Err(CoordinationError::Validation(format!(
                "agent {} is terminated",
                agent_id
            )));
        }

        {
            let agent = self.get_mut(agent_id)?;
            if let Some(specializations) = update.specializations {
                agent.specializations = specializations;
            }
            if let Some(limits) = update.limits {
                agent.limits = limits;
            }
            if let Some(model) = update.model {
                agent.model = Some(model);
            }
            agent.updated_at = chrono::Utc::now();
        }

        if let Some(status) = update.status {
            if self.get(agent_id)?.status != status {
                self.transition(agent_id, status)?;
            }
        }
        self.get(agent_id)
    }

    pub fn find(&self, filter: &AgentFilter) -> Vec<Agent> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Agent> {
        self.find(&AgentFilter::default())
    }

    pub fn get(&self, agent_id: &AgentId) -> CoordinationResult<Agent> {
        self.agents
            .get(agent_id)
            .cloned()
            .ok_or(CoordinationError::AgentNotFound(*agent_id))
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Best idle agent for `task`: most specialization overlap, then least load,
    /// then earliest registration.
    pub fn select_for(&self, task: &Task, strict_specialization: bool) -> Option<AgentId> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .filter(|a| a.status == AgentStatus::Idle && a.has_capacity() && a.can_handle(task))
            .filter(|a| {
                !strict_specialization
                    || task.required_specializations.is_empty()
                    || a.specialization_overlap(task) > 0
            })
            .min_by_key(|a| {
                (
                    std::cmp::Reverse(a.specialization_overlap(task)),
                    a.assigned_work(),
                    a.registration_seq,
                )
            })
            .map(|a| a.id)
    }

    pub fn assign_work(&mut self, agent_id: &AgentId, task_id: TaskId) -> CoordinationResult<()> {
        let agent = self.get_mut(agent_id)?;
        if agent.status != AgentStatus::Idle || !agent.has_capacity() {
            return Err(CoordinationError::agent_transition(
                *agent_id,
                agent.status,
                AgentStatus::Busy,
            ));
        }
        agent.active_tasks.push(task_id);
        if !agent.has_capacity() {
            self.transition(agent_id, AgentStatus::Busy)?;
        }
        Ok(())
    }

    pub fn release_work(&mut self, agent_id: &AgentId, task_id: &TaskId) -> CoordinationResult<()> {
        let agent = self.get_mut(agent_id)?;
        agent.active_tasks.retain(|t| t != task_id);
        if agent.status == AgentStatus::Busy && agent.has_capacity() {
            self.transition(agent_id, AgentStatus::Idle)?;
        }
        Ok(())
    }

    pub fn record_completion(&mut self, agent_id: &AgentId) -> CoordinationResult<()> {
        let agent = self.get_mut(agent_id)?;
        agent.completed_tasks += 1;
        agent.consecutive_timeouts = 0;
        Ok(())
    }

    pub fn record_timeout(&mut self, agent_id: &AgentId) -> CoordinationResult<u32> {
        let agent = self.get_mut(agent_id)?;
        agent.consecutive_timeouts += 1;
        Ok(agent.consecutive_timeouts)
    }

    pub fn reset_timeouts(&mut self, agent_id: &AgentId) -> CoordinationResult<()> {
        self.get_mut(agent_id)?.consecutive_timeouts = 0;
        Ok(())
    }

    pub fn first_manager(&self) -> Option<Agent> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .find(|a| a.is_manager() && !a.status.is_terminal())
            .cloned()
    }

    fn live_count(&self) -> usize {
        self.agents
            .values()
            .filter(|a| !a.status.is_terminal())
            .count()
    }

    fn get_mut(&mut self, agent_id: &AgentId) -> CoordinationResult<&mut Agent> {
        self.agents
            .get_mut(agent_id)
            .ok_or(CoordinationError::AgentNotFound(*agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentRole, TaskConfig, TaskDraft};

    fn create_test_registry(max_agents: usize) -> AgentRegistry {
        AgentRegistry::new(max_agents, EventBus::new())
    }

    fn ready(registry: &mut AgentRegistry, config: AgentConfig) -> AgentId {
        let agent = registry.create(config).unwrap();
        registry.transition(&agent.id, AgentStatus::Idle).unwrap();
        agent.id
    }

    fn task_requiring(tags: &[&str]) -> Task {
        let mut draft = TaskDraft::new("t", "d");
        for tag in tags {
            draft = draft.requires(*tag);
        }
        Task::from_draft(draft, 0, TaskConfig::default())
    }

    #[test]
    fn test_create_respects_cap() {
        let mut registry = create_test_registry(2);
        registry.create(AgentConfig::worker("a")).unwrap();
        registry.create(AgentConfig::worker("b")).unwrap();

        let result = registry.create(AgentConfig::worker("c"));
        assert!(matches!(result, Err(CoordinationError::MaxAgentsReached(2))));
    }

    #[test]
    fn test_terminated_agents_free_capacity() {
        let mut registry = create_test_registry(1);
        let id = ready(&mut registry, AgentConfig::worker("a"));
        registry.transition(&id, AgentStatus::Terminated).unwrap();

        assert!(registry.create(AgentConfig::worker("b")).is_ok());
    }

    #[test]
    fn test_transition_emits_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut registry = AgentRegistry::new(5, bus);
        let agent = registry.create(AgentConfig::worker("a")).unwrap();
        registry.transition(&agent.id, AgentStatus::Idle).unwrap();

        let created = rx.try_recv().unwrap();
        assert_eq!(created.event_type, EventType::AgentCreated);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.event_type, EventType::AgentStatusUpdate);
        assert_eq!(update.previous_state.as_deref(), Some("starting"));
        assert_eq!(update.new_state.as_deref(), Some("idle"));
    }

    #[test]
    fn test_find_by_role_and_status() {
        let mut registry = create_test_registry(5);
        ready(&mut registry, AgentConfig::manager("lead"));
        ready(&mut registry, AgentConfig::worker("w1"));
        registry.create(AgentConfig::worker("w2")).unwrap();

        let workers = registry.find(&AgentFilter::role(AgentRole::Worker));
        assert_eq!(workers.len(), 2);
        let idle = registry.find(&AgentFilter {
            role: Some(AgentRole::Worker),
            status: Some(AgentStatus::Idle),
            model: None,
        });
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].name, "w1");
    }

    #[test]
    fn test_select_prefers_specialization_over_load_and_order() {
        let mut registry = create_test_registry(5);
        let generalist = ready(&mut registry, AgentConfig::worker("general"));
        let specialist = ready(
            &mut registry,
            AgentConfig::worker("auth-expert")
                .with_specialization("auth")
                .with_limits(ResourceLimits {
                    max_concurrent_tasks: 2,
                    ..ResourceLimits::default()
                }),
        );
        registry.assign_work(&specialist, TaskId::new_v4()).unwrap();

        let chosen = registry.select_for(&task_requiring(&["auth"]), false);
        assert_eq!(chosen, Some(specialist));

        let chosen = registry.select_for(&task_requiring(&[]), false);
        assert_eq!(chosen, Some(generalist));
    }

    #[test]
    fn test_select_ties_break_on_registration_order() {
        let mut registry = create_test_registry(5);
        let first = ready(&mut registry, AgentConfig::worker("first"));
        ready(&mut registry, AgentConfig::worker("second"));

        assert_eq!(registry.select_for(&task_requiring(&[]), false), Some(first));
    }

    #[test]
    fn test_strict_specialization_excludes_generalists() {
        let mut registry = create_test_registry(5);
        ready(&mut registry, AgentConfig::worker("general"));

        assert!(registry.select_for(&task_requiring(&["auth"]), true).is_none());
        assert!(registry.select_for(&task_requiring(&["auth"]), false).is_some());
    }

    #[test]
    fn test_assign_and_release_work() {
        let mut registry = create_test_registry(5);
        let id = ready(&mut registry, AgentConfig::worker("w"));
        let task_id = TaskId::new_v4();

        registry.assign_work(&id, task_id).unwrap();
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Busy);
        assert!(registry.assign_work(&id, TaskId::new_v4()).is_err());

        registry.release_work(&id, &task_id).unwrap();
        let agent = registry.get(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.assigned_work(), 0);
    }

    #[test]
    fn test_update_applies_status_and_limits() {
        let mut registry = create_test_registry(5);
        let id = ready(&mut registry, AgentConfig::worker("w"));

        let updated = registry
            .update(
                &id,
                AgentUpdate {
                    status: Some(AgentStatus::Paused),
                    specializations: Some(BTreeSet::from(["db".to_string()])),
                    ..AgentUpdate::default()
                },
            )
            .unwrap();

        assert_eq!(updated.status, AgentStatus::Paused);
        assert!(updated.specializations.contains("db"));
    }

    #[test]
    fn test_unknown_agent() {
        let registry = create_test_registry(5);
        assert!(matches!(
            registry.get(&AgentId::new_v4()),
            Err(CoordinationError::AgentNotFound(_))
        ));
    }
}
