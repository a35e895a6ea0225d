use chrono::Utc;

use crate::error::{CoordinationError, CoordinationResult};
use crate::types::{Agent, AgentStatus, Task, TaskStatus};

pub struct AgentStateMachine;

impl AgentStateMachine {
    pub fn is_allowed(from: AgentStatus, to: AgentStatus) -> bool {
        use AgentStatus::*;

        match (from, to) {
            (Terminated, _) => false,
            (Starting, Idle) => true,
            (Idle, Busy) | (Busy, Idle) => true,
            (Idle | Busy, Paused) => true,
            (Paused, Idle) => true,
            (Starting | Idle | Busy | Paused, Error) => true,
            (Error, Idle) | (Error, Terminated) => true,
            (Idle | Paused, Terminated) => true,
            _ => false,
        }
    }

    pub fn transition(agent: &mut Agent, to: AgentStatus) -> CoordinationResult<AgentStatus> {
        let from = agent.status;
        if !Self::is_allowed(from, to) {
            return Err(CoordinationError::agent_transition(agent.id, from, to));
        }

        agent.status = to;
        agent.updated_at = Utc::now();
        Ok(from)
    }
}

pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;

        match (from, to) {
            (Completed | Failed | Cancelled, _) => false,
            (_, Cancelled) => true,
            (Pending, Blocked) | (Blocked, Pending) => true,
            (Pending | Blocked, Assigned) => true,
            (Assigned, InProgress) => true,
            (Assigned | InProgress, Pending) => true,
            (InProgress, Completed) => true,
            (Pending | Assigned | InProgress, Failed) => true,
            _ => false,
        }
    }

    pub fn transition(task: &mut Task, to: TaskStatus) -> CoordinationResult<TaskStatus> {
        let from = task.status;
        if !Self::is_allowed(from, to) {
            return Err(CoordinationError::task_transition(task.id, from, to));
        }

        task.status = to;
        task.touch();
        if to.is_terminal() {
            task.finished_at = Some(Utc::now());
        }
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentConfig, TaskConfig, TaskDraft};

    fn create_test_agent(status: AgentStatus) -> Agent {
        let mut agent = Agent::new(AgentConfig::worker("test"), 0);
        agent.status = status;
        agent
    }

    fn create_test_task(status: TaskStatus) -> Task {
        let mut task = Task::from_draft(TaskDraft::new("t", "d"), 0, TaskConfig::default());
        task.status = status;
        task
    }

    #[test]
    fn test_starting_to_idle() {
        let mut agent = create_test_agent(AgentStatus::Starting);
        let previous = AgentStateMachine::transition(&mut agent, AgentStatus::Idle).unwrap();
        assert_eq!(previous, AgentStatus::Starting);
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[test]
    fn test_idle_busy_round_trip() {
        let mut agent = create_test_agent(AgentStatus::Idle);
        AgentStateMachine::transition(&mut agent, AgentStatus::Busy).unwrap();
        AgentStateMachine::transition(&mut agent, AgentStatus::Idle).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[test]
    fn test_busy_cannot_terminate_directly() {
        let mut agent = create_test_agent(AgentStatus::Busy);
        assert!(AgentStateMachine::transition(&mut agent, AgentStatus::Terminated).is_err());
        assert_eq!(agent.status, AgentStatus::Busy);
    }

    #[test]
    fn test_error_recovery_and_termination() {
        let mut agent = create_test_agent(AgentStatus::Busy);
        AgentStateMachine::transition(&mut agent, AgentStatus::Error).unwrap();
        AgentStateMachine::transition(&mut agent, AgentStatus::Idle).unwrap();
        AgentStateMachine::transition(&mut agent, AgentStatus::Error).unwrap();
        AgentStateMachine::transition(&mut agent, AgentStatus::Terminated).unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
    }

    #[test]
    fn test_terminated_is_terminal() {
        use AgentStatus::*;
        for target in [Starting, Idle, Busy, Paused, Error, Terminated] {
            let mut agent = create_test_agent(Terminated);
            let result = AgentStateMachine::transition(&mut agent, target);
            assert!(matches!(
                result,
                Err(CoordinationError::InvalidTransition { .. })
            ));
            assert_eq!(agent.status, Terminated);
        }
    }

    #[test]
    fn test_task_cancel_from_any_non_terminal() {
        use TaskStatus::*;
        for from in [Pending, Assigned, InProgress, Blocked] {
            let mut task = create_test_task(from);
            TaskStateMachine::transition(&mut task, Cancelled).unwrap();
            assert!(task.finished_at.is_some());
        }
    }

    #[test]
    fn test_task_terminal_states_are_final() {
        let mut task = create_test_task(TaskStatus::Completed);
        assert!(TaskStateMachine::transition(&mut task, TaskStatus::Pending).is_err());
        assert!(TaskStateMachine::transition(&mut task, TaskStatus::Cancelled).is_err());
    }

    #[test]
    fn test_task_must_be_started_before_completion() {
        let mut task = create_test_task(TaskStatus::Assigned);
        assert!(TaskStateMachine::transition(&mut task, TaskStatus::Completed).is_err());
    }
}
