use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::engine::planner::PLAN_REQUEST_PREFIX;
use crate::error::ExecutionFailure;
use crate::providers::llm::{ChatMessage, LLMProvider};
use crate::types::{
    Agent, AgentId, CompletionSignal, Deliverable, MessageType, SessionId, TaskId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub task_id: Option<TaskId>,
    pub message_type: MessageType,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub text: String,
    pub signal: CompletionSignal,
    #[serde(default)]
    pub deliverable: Option<Deliverable>,
}

impl ExecutionResponse {
    pub fn new(text: impl Into<String>, signal: CompletionSignal) -> Self {
        Self {
            text: text.into(),
            signal,
            deliverable: None,
        }
    }

    pub fn with_deliverable(mut self, deliverable: Deliverable) -> Self {
        self.deliverable = Some(deliverable);
        self
    }

    pub fn deliverable_or_summary(&self) -> Deliverable {
        if let Some(deliverable) = &self.deliverable {
            return deliverable.clone();
        }
        let confidence = match self.signal {
            CompletionSignal::Done => 0.8,
            CompletionSignal::Working | CompletionSignal::Unknown => 0.5,
            CompletionSignal::Blocked => 0.0,
        };
        let mut deliverable = Deliverable::new(self.text.trim())
            .with_files(extract_file_paths(&self.text))
            .with_confidence(confidence);
        deliverable.failed = self.signal == CompletionSignal::Blocked;
        deliverable
    }
}

/// The model runtime that actually produces agent responses.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Brings a freshly registered agent up. Failure leaves the agent in `error`.
    async fn prepare(&self, _agent: &Agent) -> Result<(), ExecutionFailure> {
        Ok(())
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResponse, ExecutionFailure>;
}

/// Reports every request as done without calling a model. Used for dry runs.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngine;

#[async_trait]
impl ExecutionEngine for SimulatedEngine {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResponse, ExecutionFailure> {
        let headline = request.prompt.lines().next().unwrap_or("task").trim().to_string();
        if request.prompt.starts_with(PLAN_REQUEST_PREFIX) {
            let goal = request
                .prompt
                .lines()
                .find_map(|l| l.strip_prefix("Goal:"))
                .unwrap_or(headline.as_str())
                .trim();
            let plan = serde_json::json!([{ "title": goal, "description": goal }]);
            return Ok(ExecutionResponse::new(plan.to_string(), CompletionSignal::Done));
        }
        let text = match request.message_type {
            MessageType::Intervention => "Proceed with the most conservative option.".to_string(),
            _ => format!("STATUS: DONE\nTask complete: {}", headline),
        };
        Ok(ExecutionResponse::new(text, CompletionSignal::Done).with_deliverable(
            Deliverable::new(format!("Simulated result for {}", headline)).with_confidence(0.9),
        ))
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a software engineering agent. Work on the task you are given. \
End every reply with a line `STATUS: DONE`, `STATUS: WORKING` or `STATUS: BLOCKED`.";

/// Execution engine backed by a chat-completion provider, keeping one
/// conversation per agent.
pub struct LlmExecutionEngine {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    max_history: usize,
    history: Mutex<HashMap<AgentId, Vec<ChatMessage>>>,
}

impl LlmExecutionEngine {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_history: 20,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }
}

#[async_trait]
impl ExecutionEngine for LlmExecutionEngine {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResponse, ExecutionFailure> {
        let prior = {
            let history = self.history.lock().await;
            history.get(&request.agent_id).cloned().unwrap_or_default()
        };

        let mut messages = Vec::with_capacity(prior.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(prior);
        messages.push(ChatMessage::user(request.prompt.clone()));

        let text = self
            .provider
            .complete(messages)
            .await
            .map_err(|e| ExecutionFailure::from_message(&e.to_string()))?;

        {
            let mut history = self.history.lock().await;
            let turns = history.entry(request.agent_id).or_default();
            turns.push(ChatMessage::user(request.prompt));
            turns.push(ChatMessage::assistant(text.clone()));
            if turns.len() > self.max_history {
                let excess = turns.len() - self.max_history;
                turns.drain(0..excess);
            }
        }

        let signal = parse_status_line(&text);
        let mut response = ExecutionResponse::new(text, signal);
        response.deliverable = parse_deliverable_block(&response.text);
        Ok(response)
    }
}

fn status_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*status:\s*(done|complete|completed|working|in[_ ]progress|blocked)\b")
            .expect("status pattern is valid")
    })
}

pub fn parse_status_line(text: &str) -> CompletionSignal {
    let last = status_regex()
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase());

    match last.as_deref() {
        Some("done" | "complete" | "completed") => CompletionSignal::Done,
        Some("blocked") => CompletionSignal::Blocked,
        Some(_) => CompletionSignal::Working,
        None => CompletionSignal::Unknown,
    }
}

/// Parses a fenced ```json block holding a deliverable, if present.
pub fn parse_deliverable_block(text: &str) -> Option<Deliverable> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    serde_json::from_str::<Deliverable>(rest[..end].trim()).ok()
}

fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[\s`(])((?:[\w.-]+/)*[\w-]+\.(?:rs|toml|py|ts|tsx|js|go|md|json|yaml|yml|sql))\b")
            .expect("path pattern is valid")
    })
}

fn extract_file_paths(text: &str) -> Vec<String> {
    let mut files: Vec<String> = path_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    files.sort();
    files.dedup();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::llm::MockLLMProvider;

    fn request(agent_id: AgentId, prompt: &str) -> ExecutionRequest {
        ExecutionRequest {
            session_id: SessionId::new_v4(),
            agent_id,
            task_id: None,
            message_type: MessageType::TaskAssignment,
            prompt: prompt.to_string(),
        }
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("work\nSTATUS: DONE"), CompletionSignal::Done);
        assert_eq!(parse_status_line("status: blocked"), CompletionSignal::Blocked);
        assert_eq!(
            parse_status_line("STATUS: WORKING\n...\nStatus: in progress"),
            CompletionSignal::Working
        );
        assert_eq!(parse_status_line("no marker"), CompletionSignal::Unknown);
    }

    #[test]
    fn test_parse_deliverable_block() {
        let text = "Done.\n```json\n{\"summary\": \"added login\", \"files_touched\": [\"src/auth.rs\"], \"self_confidence\": 0.9}\n```";
        let deliverable = parse_deliverable_block(text).unwrap();
        assert_eq!(deliverable.files_touched, vec!["src/auth.rs"]);
        assert!(parse_deliverable_block("no block").is_none());
    }

    #[test]
    fn test_deliverable_from_text() {
        let response = ExecutionResponse::new(
            "Updated src/lib.rs and Cargo.toml.\nSTATUS: DONE",
            CompletionSignal::Done,
        );
        let deliverable = response.deliverable_or_summary();
        assert_eq!(deliverable.files_touched, vec!["Cargo.toml", "src/lib.rs"]);
        assert!(!deliverable.failed);
    }

    #[tokio::test]
    async fn test_llm_engine_keeps_history_per_agent() {
        let provider = Arc::new(MockLLMProvider::with_response("ok\nSTATUS: WORKING".into()));
        let engine = LlmExecutionEngine::new(provider).with_max_history(2);
        let agent = AgentId::new_v4();

        let first = engine.execute(request(agent, "step 1")).await.unwrap();
        assert_eq!(first.signal, CompletionSignal::Working);
        engine.execute(request(agent, "step 2")).await.unwrap();

        let history = engine.history.lock().await;
        let turns = &history[&agent];
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "step 2");
    }

    #[tokio::test]
    async fn test_simulated_engine_reports_done() {
        let response = SimulatedEngine
            .execute(request(AgentId::new_v4(), "Build the parser\nmore"))
            .await
            .unwrap();
        assert_eq!(response.signal, CompletionSignal::Done);
        assert!(response.text.contains("Build the parser"));
    }
}
