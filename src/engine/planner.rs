use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::engine::coordination::Coordinator;
use crate::error::{CoordinationError, CoordinationResult};
use crate::types::{
    AcceptanceCriteria, AgentConfig, AgentRole, MessageType, ResourceLimits, Task, TaskConfig,
    TaskDraft, TaskId,
};

pub const PLAN_REQUEST_PREFIX: &str = "Decompose the following goal into tasks.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    /// Indices of earlier entries this task waits for.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub expected_files: Vec<String>,
}

/// Turns a goal into tasks by asking the session's manager agent.
pub struct Planner {
    coordinator: Arc<Coordinator>,
}

impl Planner {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn decompose(&self, goal: &str) -> CoordinationResult<Vec<PlannedTask>> {
        let exchange = self
            .coordinator
            .consult_manager(MessageType::TaskAssignment, None, None, plan_prompt(goal))
            .await?
            .ok_or_else(|| {
                CoordinationError::Validation(
                    "no manager agent available to decompose the goal".to_string(),
                )
            })?;
        parse_plan(&exchange.response.text)
    }

    pub async fn plan(&self, goal: &str) -> CoordinationResult<Vec<Task>> {
        let planned = self.decompose(goal).await?;
        log::info!("manager split the goal into {} task(s)", planned.len());

        let mut created: Vec<Task> = Vec::with_capacity(planned.len());
        for entry in planned {
            let mut draft = TaskDraft::new(entry.title, entry.description).with_priority(entry.priority);
            for index in entry.depends_on {
                draft = draft.depends_on(created[index].id);
            }
            for tag in entry.specializations {
                draft = draft.requires(tag);
            }
            draft.acceptance = AcceptanceCriteria {
                requirements: entry.requirements,
                expected_files: entry.expected_files,
            };
            created.push(self.coordinator.create_task(draft).await?);
        }
        Ok(created)
    }
}

fn plan_prompt(goal: &str) -> String {
    format!(
        "{}\nGoal: {}\n\n\
Respond with only a JSON array. Each element is an object with `title`, `description`, \
`priority` (lower runs first), `depends_on` (indices of earlier elements), `specializations`, \
`requirements` and `expected_files`.",
        PLAN_REQUEST_PREFIX, goal
    )
}

/// Parses the manager's task list, accepting an optional ``` fence around it.
pub fn parse_plan(text: &str) -> CoordinationResult<Vec<PlannedTask>> {
    let start = text.find('[');
    let end = text.rfind(']');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(CoordinationError::Validation(
                "manager reply does not contain a JSON task list".to_string(),
            ))
        }
    };

    let planned: Vec<PlannedTask> = serde_json::from_str(body)
        .map_err(|e| CoordinationError::Validation(format!("malformed task list: {}", e)))?;
    if planned.is_empty() {
        return Err(CoordinationError::Validation("manager returned no tasks".to_string()));
    }
    for (index, entry) in planned.iter().enumerate() {
        if entry.title.trim().is_empty() {
            return Err(CoordinationError::Validation(format!("task {} has no title", index)));
        }
        if let Some(dep) = entry.depends_on.iter().find(|d| **d >= index) {
            return Err(CoordinationError::Validation(format!(
                "task {} depends on {}, which is not an earlier task",
                index, dep
            )));
        }
    }
    Ok(planned)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAgent {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: AgentRole,
    #[serde(default)]
    pub specializations: BTreeSet<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
}

fn default_role() -> AgentRole {
    AgentRole::Worker
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub requires: BTreeSet<String>,
    #[serde(default)]
    pub acceptance: AcceptanceCriteria,
    pub retry_count: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub quality_threshold: Option<f32>,
}

/// A session described up front: its agents and tasks, keyed so tasks can
/// name their dependencies.
///
/// ```yaml
/// goal: Ship the login flow
/// agents:
///   - name: lead
///     role: manager
///   - name: backend
///     specializations: [rust]
/// tasks:
///   - key: schema
///     title: Add users table
///   - key: api
///     title: Add login endpoint
///     depends_on: [schema]
///     requires: [rust]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub goal: String,
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub agents: Vec<PlanAgent>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let plan: PlanFile = serde_yaml::from_str(content).context("invalid plan file")?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.goal.trim().is_empty() {
            bail!("plan goal must not be empty");
        }
        let mut keys = BTreeSet::new();
        for task in &self.tasks {
            if !keys.insert(task.key.as_str()) {
                bail!("duplicate task key '{}'", task.key);
            }
        }
        for task in &self.tasks {
            if let Some(missing) = task.depends_on.iter().find(|d| !keys.contains(d.as_str())) {
                bail!("task '{}' depends on unknown task '{}'", task.key, missing);
            }
        }
        Ok(())
    }

    /// Registers the plan's agents and tasks on `coordinator`. Dependencies are
    /// wired after every task exists, so cycles surface as `TaskDependencyCycle`.
    pub async fn apply(&self, coordinator: &Coordinator, config: &Config) -> CoordinationResult<Vec<Task>> {
        for agent in &self.agents {
            let mut agent_config = AgentConfig::worker(agent.name.clone()).with_role(agent.role.clone());
            agent_config.specializations = agent.specializations.clone();
            agent_config.model = agent.model.clone();
            if let Some(max) = agent.max_concurrent_tasks {
                agent_config.limits = ResourceLimits {
                    max_concurrent_tasks: max,
                    ..ResourceLimits::default()
                };
            }
            coordinator.create_agent(agent_config).await?;
        }

        let defaults = config
            .tasks
            .task_config(config.quality_gate.default_threshold);
        let mut ids: HashMap<&str, TaskId> = HashMap::new();
        for task in &self.tasks {
            let mut draft = TaskDraft::new(task.title.clone(), task.description.clone())
                .with_priority(task.priority)
                .with_config(TaskConfig {
                    retry_count: task.retry_count.unwrap_or(defaults.retry_count),
                    timeout_seconds: task.timeout_secs.unwrap_or(defaults.timeout_seconds),
                    quality_threshold: task.quality_threshold.unwrap_or(defaults.quality_threshold),
                });
            draft.required_specializations = task.requires.clone();
            draft.acceptance = task.acceptance.clone();
            let created = coordinator.create_task(draft).await?;
            ids.insert(task.key.as_str(), created.id);
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if let (Some(task_id), Some(dep_id)) = (ids.get(task.key.as_str()), ids.get(dep.as_str())) {
                    coordinator.add_dependency(task_id, dep_id).await?;
                }
            }
        }
        Ok(coordinator.list_tasks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::execution::SimulatedEngine;
    use crate::storage::InMemoryStore;
    use crate::types::{CoordinationSession, TaskStatus};
    use crate::validation::QualityGateEvaluator;

    fn coordinator() -> Arc<Coordinator> {
        let config = Config::default();
        Arc::new(Coordinator::new(
            CoordinationSession::new("plan", 10),
            &config,
            Arc::new(SimulatedEngine),
            Arc::new(InMemoryStore::new()),
            QualityGateEvaluator::heuristic(config.quality_gate.clone()),
        ))
    }

    #[test]
    fn test_parse_plan_accepts_fenced_json() {
        let text = "Here is the plan:\n```json\n[{\"title\": \"Schema\"}, {\"title\": \"API\", \"depends_on\": [0], \"priority\": 1}]\n```";
        let planned = parse_plan(text).unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[1].depends_on, vec![0]);
    }

    #[test]
    fn test_parse_plan_rejects_forward_dependency() {
        let text = r#"[{"title": "A", "depends_on": [1]}, {"title": "B"}]"#;
        assert!(matches!(parse_plan(text), Err(CoordinationError::Validation(_))));
        assert!(matches!(parse_plan("no json here"), Err(CoordinationError::Validation(_))));
        assert!(matches!(parse_plan("[]"), Err(CoordinationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_plan_requires_manager() {
        let planner = Planner::new(coordinator());
        let err = planner.plan("build it").await.unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_plan_with_simulated_manager() {
        let coordinator = coordinator();
        coordinator.create_agent(AgentConfig::manager("lead")).await.unwrap();
        let tasks = Planner::new(coordinator.clone()).plan("Write the changelog").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Write the changelog");
    }

    #[test]
    fn test_plan_file_rejects_unknown_dependency() {
        let yaml = "goal: g\ntasks:\n  - key: a\n    title: A\n    depends_on: [b]\n";
        assert!(PlanFile::parse(yaml).is_err());
    }

    #[tokio::test]
    async fn test_plan_file_apply_wires_dependencies() {
        let yaml = r#"
goal: Ship the login flow
agents:
  - name: lead
    role: manager
  - name: backend
    specializations: [rust]
tasks:
  - key: api
    title: Add login endpoint
    depends_on: [schema]
    requires: [rust]
    retry_count: 1
  - key: schema
    title: Add users table
"#;
        let plan = PlanFile::parse(yaml).unwrap();
        let coordinator = coordinator();
        let tasks = plan.apply(&coordinator, &Config::default()).await.unwrap();

        assert_eq!(coordinator.snapshot().agents.len(), 2);
        let api = tasks.iter().find(|t| t.title == "Add login endpoint").unwrap();
        let schema = tasks.iter().find(|t| t.title == "Add users table").unwrap();
        assert!(api.dependencies.contains(&schema.id));
        assert_eq!(api.status, TaskStatus::Blocked);
        assert_eq!(api.config.retry_count, 1);
    }
}
