use crate::workflow::Stage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalystError {
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("Schema load error: {0}")]
    SchemaLoad(String),

    #[error("Data load error: {0}")]
    DataLoad(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Context budget exceeded: {0}")]
    ContextBudgetExceeded(String),

    #[error("No domain selected")]
    NoDomainSelected,

    #[error("Question too long: ~{tokens} tokens, at most {allowed} allowed")]
    QuestionTooLong { tokens: usize, allowed: usize },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM call failed during {stage}: {message}")]
    LlmCall { stage: Stage, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for AnalystError {
    fn from(err: polars::error::PolarsError) -> Self {
        AnalystError::Polars(err.to_string())
    }
}

impl AnalystError {
    /// Setup errors end the session; everything else only ends the current query.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AnalystError::DomainNotFound(_)
                | AnalystError::SchemaLoad(_)
                | AnalystError::DataLoad(_)
                | AnalystError::Config(_)
                | AnalystError::ContextBudgetExceeded(_)
        )
    }

    /// Short user-facing hint shown next to the error.
    pub fn remediation(&self) -> &'static str {
        match self {
            AnalystError::DomainNotFound(_) => {
                "Pick one of the available domains (run `domains` to list them)."
            }
            AnalystError::SchemaLoad(_) => "Check the domain's _schema.json metadata file.",
            AnalystError::DataLoad(_) | AnalystError::Polars(_) => {
                "Check the data files: every table in the schema needs a readable CSV."
            }
            AnalystError::Config(_) => "Check the API key and environment settings.",
            AnalystError::ContextBudgetExceeded(_) => {
                "Raise ANALYST_CONTEXT_BUDGET; it must hold at least one full turn."
            }
            AnalystError::NoDomainSelected => "Select a domain before asking questions.",
            AnalystError::QuestionTooLong { .. } => "Shorten the question and try again.",
            AnalystError::Llm(_) | AnalystError::LlmCall { .. } => {
                "The AI service did not respond. Please try your question again."
            }
            AnalystError::Io(_) | AnalystError::Json(_) => "Please try again.",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalystError>;
