#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use overseer::config::Config;
use overseer::engine::Coordinator;
use overseer::error::ExecutionFailure;
use overseer::providers::{ExecutionEngine, ExecutionRequest, ExecutionResponse};
use overseer::storage::InMemoryStore;
use overseer::types::{
    Agent, CompletionSignal, CoordinationSession, Deliverable, MessageType, TaskId,
};
use overseer::validation::QualityGateEvaluator;

pub enum Step {
    Reply(ExecutionResponse),
    Fail(ExecutionFailure),
    /// Never answers; the coordinator's communication timeout fires.
    Hang,
}

type Script = dyn Fn(&ExecutionRequest, usize) -> Step + Send + Sync;

/// Execution engine driven by a closure. The closure receives the request and
/// how many earlier requests were made for the same task.
pub struct ScriptedEngine {
    script: Box<Script>,
    requests: Mutex<Vec<ExecutionRequest>>,
    per_task: Mutex<HashMap<Option<TaskId>, usize>>,
}

impl ScriptedEngine {
    pub fn new(script: impl Fn(&ExecutionRequest, usize) -> Step + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
            per_task: Mutex::new(HashMap::new()),
        })
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn prompts_for(&self, task_id: TaskId) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.task_id == Some(task_id) && r.message_type == MessageType::TaskAssignment)
            .map(|r| r.prompt)
            .collect()
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn prepare(&self, agent: &Agent) -> Result<(), ExecutionFailure> {
        if agent.name.starts_with("broken") {
            return Err(ExecutionFailure::ExecutionError("model unavailable".into()));
        }
        Ok(())
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResponse, ExecutionFailure> {
        let attempt = {
            let mut per_task = self.per_task.lock().unwrap();
            let count = per_task.entry(request.task_id).or_insert(0);
            let attempt = *count;
            *count += 1;
            attempt
        };
        self.requests.lock().unwrap().push(request.clone());

        match (self.script)(&request, attempt) {
            Step::Reply(response) => Ok(response),
            Step::Fail(failure) => Err(failure),
            Step::Hang => std::future::pending().await,
        }
    }
}

pub fn done(summary: &str) -> Step {
    Step::Reply(
        ExecutionResponse::new(
            format!("Task complete: {}\nSTATUS: DONE", summary),
            CompletionSignal::Done,
        )
        .with_deliverable(
            Deliverable::new(format!("{}. All tests pass.", summary))
                .with_files(vec!["src/lib.rs".to_string()])
                .with_confidence(0.9),
        ),
    )
}

pub fn working(progress: usize) -> Step {
    Step::Reply(ExecutionResponse::new(
        format!("Still implementing. progress: {}%\nSTATUS: WORKING", progress),
        CompletionSignal::Working,
    ))
}

pub fn coordinator(config: &Config, engine: Arc<dyn ExecutionEngine>) -> (Arc<Coordinator>, InMemoryStore) {
    let store = InMemoryStore::new();
    let coordinator = Arc::new(Coordinator::new(
        CoordinationSession::new("integration", config.autopilot.max_iterations),
        config,
        engine,
        Arc::new(store.clone()),
        QualityGateEvaluator::heuristic(config.quality_gate.clone()),
    ));
    (coordinator, store)
}
