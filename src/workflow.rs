//! Workflow Orchestrator
//!
//! One query runs through a strictly sequential state machine:
//!
//! ```text
//! Classify -> Greeting -> Done
//! Classify -> Rephrase -> Plan -> GenerateCode -> Execute -> Report -> Done
//! ```
//!
//! Every LLM call goes through [`AnalysisWorkflow::call_stage`], which trims
//! the conversation to the context budget first. A failed LLM call aborts the
//! query with the stage that failed; a failed execution does not, it becomes
//! input for the report.

use crate::context::{
    estimate_tokens, trim, ContextBudget, ConversationTurn, Role, TrimmedHistory, TurnPayload,
    CHARS_PER_TOKEN, MESSAGE_OVERHEAD_TOKENS,
};
use crate::domain::Domain;
use crate::error::{AnalystError, Result};
use crate::executor::{CodeRunner, ExecutionErrorKind, ExecutionResult};
use crate::llm::{ChatMessage, CompletionProvider, CompletionRequest};
use crate::plan::{extract_code, AnalysisPlan};
use crate::prompts;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tokens held back for the eviction note added to a system prompt.
const EVICTION_NOTE_RESERVE: usize = 32;

/// Tokens allowed for the text wrapped around the question in stage inputs.
const INPUT_FRAMING_TOKENS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Classify,
    Greeting,
    Rephrase,
    Plan,
    GenerateCode,
    Execute,
    Report,
    Done,
}

impl Stage {
    /// Completion limits per stage: (max tokens, temperature).
    pub fn generation(&self) -> (u32, f32) {
        match self {
            Stage::Classify => (10, 0.0),
            Stage::Greeting => (100, 0.7),
            Stage::Rephrase => (200, 0.0),
            Stage::Plan => (1500, 0.0),
            Stage::GenerateCode => (4000, 0.0),
            Stage::Report => (1200, 0.3),
            Stage::Execute | Stage::Done => (0, 0.0),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Classify => "classification",
            Stage::Greeting => "greeting",
            Stage::Rephrase => "question rephrasing",
            Stage::Plan => "analysis planning",
            Stage::GenerateCode => "code generation",
            Stage::Execute => "code execution",
            Stage::Report => "report writing",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Greeting,
    Analysis,
}

impl MessageKind {
    pub fn parse(reply: &str) -> Self {
        if reply.trim().to_lowercase().contains("greeting") {
            MessageKind::Greeting
        } else {
            MessageKind::Analysis
        }
    }
}

/// Per-query request state handed from stage to stage.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub question: String,
    pub rephrased: String,
    pub schema_text: String,
    pub history: TrimmedHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportBasis {
    /// The code ran successfully; the report describes its output.
    Verified,
    /// The code failed; the report explains the failure.
    ExecutionFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub text: String,
    pub basis: ReportBasis,
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub request: AnalysisRequest,
    pub plan: AnalysisPlan,
    /// The analysis body as generated.
    pub analysis_code: String,
    /// Loading snippet + body + chart epilogue, as executed.
    pub script: String,
    pub execution: ExecutionResult,
    pub report: Report,
}

#[derive(Debug, Clone)]
pub enum OutcomeKind {
    Greeting { reply: String },
    Analysis(Box<AnalysisOutcome>),
}

/// Result of one query.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub question: String,
    pub kind: OutcomeKind,
    /// Input history plus this exchange. The input is never modified.
    pub history: Vec<ConversationTurn>,
    /// True when any stage had to drop older turns.
    pub context_evicted: bool,
    /// True when a stage input (plan or execution output) was cut to fit.
    pub context_clipped: bool,
    /// States visited, ending in `Done`.
    pub stages: Vec<Stage>,
}

impl QueryOutcome {
    pub fn answer(&self) -> &str {
        match &self.kind {
            OutcomeKind::Greeting { reply } => reply,
            OutcomeKind::Analysis(outcome) => &outcome.report.text,
        }
    }

    pub fn charts(&self) -> &[PathBuf] {
        match &self.kind {
            OutcomeKind::Greeting { .. } => &[],
            OutcomeKind::Analysis(outcome) => &outcome.execution.charts,
        }
    }

    pub fn analysis(&self) -> Option<&AnalysisOutcome> {
        match &self.kind {
            OutcomeKind::Analysis(outcome) => Some(outcome),
            OutcomeKind::Greeting { .. } => None,
        }
    }

    pub fn final_stage(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Classify)
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub budget: ContextBudget,
    pub exec_timeout: Duration,
    /// Date quoted in the code prompt; today when unset.
    pub today: Option<NaiveDate>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            budget: ContextBudget::default(),
            exec_timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
            today: None,
        }
    }
}

struct StageReply {
    text: String,
    history: TrimmedHistory,
}

/// Tracks what one query has done so far.
struct Progress {
    stages: Vec<Stage>,
    evicted: bool,
    clipped: bool,
}

impl Progress {
    fn enter(&mut self, stage: Stage) {
        info!("Workflow stage: {}", stage);
        self.stages.push(stage);
    }
}

pub struct AnalysisWorkflow {
    provider: Arc<dyn CompletionProvider>,
    settings: WorkflowSettings,
}

impl AnalysisWorkflow {
    pub fn new(provider: Arc<dyn CompletionProvider>, settings: WorkflowSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Check that every stage prompt of `domain`, plus the largest accepted
    /// question, fits the budget. Fails with `ContextBudgetExceeded` when the
    /// budget is too small for this domain's schema.
    pub fn check_budget(&self, domain: &Domain) -> Result<()> {
        let budget = self.settings.budget.tokens();
        let question_cost = self.settings.budget.max_question_tokens()
            + estimate_tokens(Role::User.as_str())
            + MESSAGE_OVERHEAD_TOKENS
            + INPUT_FRAMING_TOKENS;
        for (stage, prompt) in self.stage_prompts(domain) {
            let needed = prompt_cost(&prompt) + question_cost;
            if needed > budget {
                return Err(AnalystError::ContextBudgetExceeded(format!(
                    "{} for domain '{}' needs ~{} tokens with a full-length question, budget is {}",
                    stage, domain.name, needed, budget
                )));
            }
        }
        Ok(())
    }

    fn stage_prompts(&self, domain: &Domain) -> Vec<(Stage, String)> {
        vec![
            (Stage::Classify, prompts::classify_prompt(domain)),
            (Stage::Greeting, prompts::greeting_prompt(domain)),
            (Stage::Rephrase, prompts::rephrase_prompt(domain)),
            (Stage::Plan, prompts::plan_prompt(domain)),
            (Stage::GenerateCode, prompts::code_prompt(domain, self.today())),
            (Stage::Report, prompts::report_prompt(domain)),
        ]
    }

    fn today(&self) -> NaiveDate {
        self.settings.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Tokens left for history plus the stage input once `system_prompt` is sent.
    fn history_allowance(&self, system_prompt: &str) -> usize {
        self.settings.budget.history_allowance(prompt_cost(system_prompt))
    }

    /// Run one question through the workflow.
    ///
    /// `history` is read only; the returned outcome carries the extended copy.
    pub async fn process_query(
        &self,
        question: &str,
        domain: &Domain,
        history: &[ConversationTurn],
        runner: &dyn CodeRunner,
    ) -> Result<QueryOutcome> {
        let question = question.trim();
        let question_tokens = estimate_tokens(question);
        let allowed = self.settings.budget.max_question_tokens();
        if question_tokens > allowed {
            return Err(AnalystError::QuestionTooLong {
                tokens: question_tokens,
                allowed,
            });
        }

        let mut progress = Progress {
            stages: Vec::new(),
            evicted: false,
            clipped: false,
        };

        progress.enter(Stage::Classify);
        let classification = self
            .call_stage(
                Stage::Classify,
                prompts::classify_prompt(domain),
                history,
                question.to_string(),
                &mut progress,
            )
            .await?;

        let kind = match MessageKind::parse(&classification.text) {
            MessageKind::Greeting => {
                progress.enter(Stage::Greeting);
                let reply = self.greet(question, domain, history, &mut progress).await;
                OutcomeKind::Greeting { reply }
            }
            MessageKind::Analysis => {
                let outcome = self
                    .analyze(question, domain, history, runner, &mut progress)
                    .await?;
                OutcomeKind::Analysis(Box::new(outcome))
            }
        };
        progress.enter(Stage::Done);

        let mut updated = history.to_vec();
        updated.push(ConversationTurn::user(question));
        let assistant = match &kind {
            OutcomeKind::Greeting { reply } => ConversationTurn::assistant(reply.clone()),
            OutcomeKind::Analysis(outcome) => ConversationTurn::assistant(outcome.report.text.clone())
                .with_payload(TurnPayload {
                    code: Some(outcome.analysis_code.clone()),
                    charts: outcome.execution.charts.clone(),
                }),
        };
        updated.push(assistant);

        Ok(QueryOutcome {
            question: question.to_string(),
            kind,
            history: updated,
            context_evicted: progress.evicted,
            context_clipped: progress.clipped,
            stages: progress.stages,
        })
    }

    async fn greet(
        &self,
        question: &str,
        domain: &Domain,
        history: &[ConversationTurn],
        progress: &mut Progress,
    ) -> String {
        match self
            .call_stage(
                Stage::Greeting,
                prompts::greeting_prompt(domain),
                history,
                question.to_string(),
                progress,
            )
            .await
        {
            Ok(reply) => reply.text,
            Err(e) => {
                warn!("Greeting call failed, using canned reply: {}", e);
                prompts::canned_greeting(domain)
            }
        }
    }

    async fn analyze(
        &self,
        question: &str,
        domain: &Domain,
        history: &[ConversationTurn],
        runner: &dyn CodeRunner,
        progress: &mut Progress,
    ) -> Result<AnalysisOutcome> {
        progress.enter(Stage::Rephrase);
        let rephrase = self
            .call_stage(
                Stage::Rephrase,
                prompts::rephrase_prompt(domain),
                history,
                prompts::rephrase_input(question),
                progress,
            )
            .await?;
        let rephrased = rephrase.text.trim().to_string();
        info!("Rephrased question: {}", rephrased);

        let request = AnalysisRequest {
            question: question.to_string(),
            rephrased,
            schema_text: domain.schema_text.clone(),
            history: rephrase.history,
        };

        progress.enter(Stage::Plan);
        let plan_reply = self
            .call_stage(
                Stage::Plan,
                prompts::plan_prompt(domain),
                history,
                prompts::plan_input(&request.rephrased),
                progress,
            )
            .await?;
        let plan = AnalysisPlan::parse(&plan_reply.text);
        info!("Analysis plan has {} steps", plan.len());

        progress.enter(Stage::GenerateCode);
        let code_reply = self
            .call_stage(
                Stage::GenerateCode,
                prompts::code_prompt(domain, self.today()),
                history,
                prompts::code_input(&plan),
                progress,
            )
            .await?;
        let analysis_code = extract_code(&code_reply.text);
        let script = domain.compose_script(&analysis_code);

        progress.enter(Stage::Execute);
        let execution = self.execute(domain, &analysis_code, &script, runner).await;
        if let Some(error) = execution.error_text() {
            warn!("Execution failed, passing to report: {}", error);
        }

        progress.enter(Stage::Report);
        let report_prompt = prompts::report_prompt(domain);
        let max_chars = input_allowance(self.history_allowance(&report_prompt)) * CHARS_PER_TOKEN;
        let (report_input, output_cut) = prompts::report_input(&request.rephrased, &execution, max_chars);
        if output_cut {
            progress.clipped = true;
            info!("Execution output cut to fit the report prompt");
        }
        let report_reply = self
            .call_stage(Stage::Report, report_prompt, history, report_input, progress)
            .await?;
        let basis = if execution.success {
            ReportBasis::Verified
        } else {
            ReportBasis::ExecutionFailed
        };

        Ok(AnalysisOutcome {
            request,
            plan,
            analysis_code,
            script,
            execution,
            report: Report {
                text: report_reply.text,
                basis,
            },
        })
    }

    /// Validate the binding contract, then run. Violations are reported as a
    /// failed execution without starting a process.
    async fn execute(
        &self,
        domain: &Domain,
        analysis_code: &str,
        script: &str,
        runner: &dyn CodeRunner,
    ) -> ExecutionResult {
        if analysis_code.trim().is_empty() {
            return ExecutionResult::failed(
                ExecutionErrorKind::ContractViolation,
                "no analysis code was generated",
            );
        }
        match domain.bindings.check(analysis_code) {
            Ok(tables) => {
                info!("Generated code uses tables: {}", tables.join(", "));
                runner.execute(script, self.settings.exec_timeout).await
            }
            Err(violation) => {
                warn!("Generated code rejected: {}", violation);
                ExecutionResult::failed(ExecutionErrorKind::ContractViolation, violation)
            }
        }
    }

    /// One LLM call. The conversation plus this stage's input is trimmed to
    /// whatever the budget leaves after the system prompt. An input that alone
    /// exceeds that is cut, so no request goes out over budget.
    async fn call_stage(
        &self,
        stage: Stage,
        system_prompt: String,
        history: &[ConversationTurn],
        input: String,
        progress: &mut Progress,
    ) -> Result<StageReply> {
        let allowance = self.history_allowance(&system_prompt);
        let max_input = input_allowance(allowance);
        if max_input == 0 {
            return Err(AnalystError::ContextBudgetExceeded(format!(
                "{} prompt alone needs ~{} tokens, budget is {}",
                stage,
                prompt_cost(&system_prompt),
                self.settings.budget.tokens()
            )));
        }

        let input = if estimate_tokens(&input) > max_input {
            progress.clipped = true;
            warn!(
                "{}: input of ~{} tokens cut to {}",
                stage,
                estimate_tokens(&input),
                max_input
            );
            clip_to_tokens(&input, max_input)
        } else {
            input
        };

        let mut turns = history.to_vec();
        turns.push(ConversationTurn::user(input));
        let trimmed = trim(&turns, allowance);

        let mut system_prompt = system_prompt;
        if trimmed.was_evicted() {
            progress.evicted = true;
            warn!(
                "{}: dropped {} of {} turns to fit ~{} tokens",
                stage,
                trimmed.dropped(),
                turns.len(),
                allowance
            );
            system_prompt.push_str(&prompts::eviction_note(trimmed.dropped()));
        }
        if trimmed.is_over_budget() {
            progress.clipped = true;
            warn!("{}: request still exceeds ~{} tokens", stage, allowance);
        }

        let (max_tokens, temperature) = stage.generation();
        let request = CompletionRequest {
            system_prompt,
            messages: trimmed.turns().iter().map(ChatMessage::from).collect(),
            max_tokens,
            temperature,
        };

        let text = self
            .provider
            .complete(&request)
            .await
            .map_err(|e| AnalystError::LlmCall {
                stage,
                message: match e {
                    AnalystError::Llm(message) => message,
                    other => other.to_string(),
                },
            })?;

        // The last turn is this stage's input, not conversation history.
        let history = match trimmed {
            TrimmedHistory::Intact(mut turns) => {
                turns.pop();
                TrimmedHistory::Intact(turns)
            }
            TrimmedHistory::OverBudget(mut turns) => {
                turns.pop();
                TrimmedHistory::OverBudget(turns)
            }
            TrimmedHistory::Evicted {
                mut turns,
                dropped,
                over_budget,
            } => {
                turns.pop();
                TrimmedHistory::Evicted {
                    turns,
                    dropped,
                    over_budget,
                }
            }
        };

        Ok(StageReply { text, history })
    }
}

/// Tokens a system prompt takes, including the reserve for an eviction note.
fn prompt_cost(system_prompt: &str) -> usize {
    estimate_tokens("system") + estimate_tokens(system_prompt) + MESSAGE_OVERHEAD_TOKENS + EVICTION_NOTE_RESERVE
}

/// Content tokens a single user turn may take within `allowance`.
fn input_allowance(allowance: usize) -> usize {
    allowance.saturating_sub(estimate_tokens(Role::User.as_str()) + MESSAGE_OVERHEAD_TOKENS)
}

/// Keep the head of `text` within `max_tokens`.
fn clip_to_tokens(text: &str, max_tokens: usize) -> String {
    text.chars().take(max_tokens * CHARS_PER_TOKEN).collect()
}
