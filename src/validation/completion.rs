use regex::Regex;
use std::sync::OnceLock;

use crate::types::{
    CompletionAssessment, CompletionDecision, CompletionSignal, Message, MessageType,
    QualityGateResult,
};

/// Everything the analyzer looks at for one decision. The analyzer keeps no
/// state between calls.
#[derive(Debug, Clone, Copy)]
pub struct CompletionInput<'a> {
    pub history: &'a [Message],
    pub response: &'a str,
    pub signal: CompletionSignal,
    pub gate: Option<&'a QualityGateResult>,
}

impl<'a> CompletionInput<'a> {
    pub fn new(history: &'a [Message], response: &'a str, signal: CompletionSignal) -> Self {
        Self {
            history,
            response,
            signal,
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: &'a QualityGateResult) -> Self {
        self.gate = Some(gate);
        self
    }
}

struct Patterns {
    error: Regex,
    completion: Regex,
    question: Regex,
    progress: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        error: Regex::new(
            r"(?im)(^\s*status:\s*blocked\b|\bunrecoverable\b|\bcannot proceed\b|\bunable to (continue|proceed)\b|\bfatal error\b|\bgiving up\b)",
        )
        .expect("error pattern is valid"),
        completion: Regex::new(
            r"(?im)(^\s*status:\s*(done|complete|completed)\b|\btask (is )?(complete|completed|done|finished)\b|\ball done\b|\bimplementation (is )?complete\b|\bfinished the task\b)",
        )
        .expect("completion pattern is valid"),
        question: Regex::new(
            r"(?im)(\?\s*$|\bshould i\b|\bplease (confirm|clarify|advise)\b|\bneed (clarification|your input|guidance)\b|\bwhich (option|approach)\b)",
        )
        .expect("question pattern is valid"),
        progress: Regex::new(r"(?i)\bprogress\s*[:=]\s*(\d{1,3})\s*%").expect("progress pattern is valid"),
    })
}

/// Classifies an agent response as CONTINUE, COMPLETE, NEEDS_INPUT or ERROR.
#[derive(Debug, Clone, Default)]
pub struct TaskCompletionAnalyzer;

impl TaskCompletionAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Whether the response claims the task is finished. Callers run the
    /// quality gate only for such responses.
    pub fn claims_completion(&self, response: &str, signal: CompletionSignal) -> bool {
        signal == CompletionSignal::Done || patterns().completion.is_match(response)
    }

    pub fn has_open_question(&self, response: &str) -> bool {
        patterns().question.is_match(response)
    }

    pub fn extract_progress(&self, response: &str) -> Option<f32> {
        patterns()
            .progress
            .captures_iter(response)
            .last()
            .and_then(|c| c[1].parse::<f32>().ok())
            .map(|pct| (pct / 100.0).clamp(0.0, 1.0))
    }

    fn repeat_count(&self, history: &[Message], response: &str) -> usize {
        let current = normalize(response);
        if current.is_empty() {
            return 0;
        }
        history
            .iter()
            .rev()
            .filter(|m| is_agent_response(m.message_type))
            .take_while(|m| normalize(m.content()) == current)
            .count()
    }

    pub fn assess(&self, input: CompletionInput<'_>) -> CompletionAssessment {
        let progress = self.extract_progress(input.response);
        let mut assessment = self.decide(&input);
        assessment.progress = progress;

        let repeats = self.repeat_count(input.history, input.response);
        if repeats > 0 && assessment.decision != CompletionDecision::Error {
            let penalty = 0.5f32.powi(repeats as i32);
            assessment.confidence = (assessment.confidence * penalty).clamp(0.0, 1.0);
            assessment.rationale = format!(
                "{}; response repeated {} time(s)",
                assessment.rationale, repeats
            );
        }
        assessment
    }

    fn decide(&self, input: &CompletionInput<'_>) -> CompletionAssessment {
        let p = patterns();
        let text_error = p.error.is_match(input.response);
        let signal_error = input.signal == CompletionSignal::Blocked;
        if text_error || signal_error {
            let confidence = if text_error && signal_error { 0.95 } else { 0.8 };
            return CompletionAssessment::new(
                CompletionDecision::Error,
                confidence,
                "agent reported an unrecoverable blocker",
            );
        }

        let text_done = p.completion.is_match(input.response);
        let signal_done = input.signal == CompletionSignal::Done;
        let open_question = self.has_open_question(input.response);

        if (text_done || signal_done) && !open_question {
            match input.gate {
                Some(gate) if gate.passed => {
                    let confidence = if text_done && signal_done { 0.95 } else { 0.85 };
                    return CompletionAssessment::new(
                        CompletionDecision::Complete,
                        confidence,
                        format!("completion stated and quality gate passed ({:.2})", gate.score),
                    );
                }
                Some(gate) => {
                    return CompletionAssessment::new(
                        CompletionDecision::Continue,
                        0.8,
                        format!(
                            "completion stated but quality gate rejected ({:.2} < {:.2})",
                            gate.score, gate.threshold
                        ),
                    );
                }
                None => {
                    return CompletionAssessment::new(
                        CompletionDecision::Continue,
                        0.7,
                        "completion stated but not yet verified by the quality gate",
                    );
                }
            }
        }

        if open_question {
            let questions = p.question.find_iter(input.response).count();
            let confidence = if questions > 1 { 0.9 } else { 0.8 };
            return CompletionAssessment::new(
                CompletionDecision::NeedsInput,
                confidence,
                "agent asked for input",
            );
        }

        let mut confidence: f32 = match input.signal {
            CompletionSignal::Working => 0.8,
            _ => 0.65,
        };
        if p.progress.is_match(input.response) {
            confidence += 0.1;
        }
        CompletionAssessment::new(CompletionDecision::Continue, confidence, "work in progress")
    }
}

fn is_agent_response(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::ProgressReport | MessageType::CompletionReport | MessageType::ErrorReport
    )
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
