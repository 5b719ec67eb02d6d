//! Chat session
//!
//! Holds what one user works with: the selected domain, the conversation so
//! far, and a code runner bound to this session's artifact namespace.
//! Switching domain or starting over wipes history and artifacts together, so
//! nothing carries across domains.

use crate::artifacts::ArtifactStore;
use crate::config::AppConfig;
use crate::context::ConversationTurn;
use crate::domain::{Domain, DomainLoader};
use crate::error::{AnalystError, Result};
use crate::executor::{CodeExecutor, CodeRunner};
use crate::llm::CompletionProvider;
use crate::workflow::{AnalysisWorkflow, QueryOutcome, WorkflowSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct Session {
    id: String,
    loader: DomainLoader,
    workflow: AnalysisWorkflow,
    runner: Arc<dyn CodeRunner>,
    domain: Option<Domain>,
    history: Vec<ConversationTurn>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        loader: DomainLoader,
        workflow: AnalysisWorkflow,
        runner: Arc<dyn CodeRunner>,
    ) -> Self {
        Self {
            id: id.into(),
            loader,
            workflow,
            runner,
            domain: None,
            history: Vec::new(),
        }
    }

    /// Build a session from configuration with a fresh id and its own
    /// artifact directory under the output root.
    pub fn open(config: &AppConfig, provider: Arc<dyn CompletionProvider>) -> Result<Self> {
        let budget = config.validate()?;
        let id = Uuid::new_v4().to_string();
        let store = ArtifactStore::for_session(&config.output_root, &id)?;
        let runner: Arc<dyn CodeRunner> = Arc::new(CodeExecutor::new(config.python.clone(), store));
        let workflow = AnalysisWorkflow::new(
            provider,
            WorkflowSettings {
                budget,
                exec_timeout: config.exec_timeout,
                today: None,
            },
        );
        let loader = DomainLoader::new(&config.metadata_dir, &config.data_dir);
        info!("Opened session {}", id);
        Ok(Self::new(id, loader, workflow, runner))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn loader(&self) -> &DomainLoader {
        &self.loader
    }

    pub fn artifacts(&self) -> Result<Vec<PathBuf>> {
        self.runner.artifacts()
    }

    /// Load and switch to a domain. On failure the current state is kept,
    /// including when the domain's prompts cannot fit the context budget.
    pub fn select_domain(&mut self, name: &str) -> Result<&Domain> {
        let domain = self.loader.load(name)?;
        self.workflow.check_budget(&domain)?;
        self.runner.clear_artifacts()?;
        self.history.clear();
        info!("Session {} switched to domain '{}'", self.id, domain.name);
        Ok(self.domain.insert(domain))
    }

    pub fn new_conversation(&mut self) -> Result<()> {
        self.runner.clear_artifacts()?;
        self.history.clear();
        info!("Session {} started a new conversation", self.id);
        Ok(())
    }

    /// Remove all charts but keep the conversation.
    pub fn clear_charts(&mut self) -> Result<()> {
        self.runner.clear_artifacts()?;
        info!("Session {} cleared its charts", self.id);
        Ok(())
    }

    /// Ask a question in the current domain. History is only replaced when
    /// the workflow completes.
    pub async fn ask(&mut self, question: &str) -> Result<QueryOutcome> {
        let domain = self.domain.as_ref().ok_or(AnalystError::NoDomainSelected)?;
        let outcome = self
            .workflow
            .process_query(question, domain, &self.history, self.runner.as_ref())
            .await?;
        self.history = outcome.history.clone();
        Ok(outcome)
    }
}
