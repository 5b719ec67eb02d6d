//! Application configuration
//!
//! Values come from the process environment (a `.env` file is loaded by the
//! binary first) and can be overridden by command-line arguments.

use crate::context::{ContextBudget, DEFAULT_BUDGET_TOKENS};
use crate::error::{AnalystError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const PLACEHOLDER_KEYS: &[&str] = &[
    "your_openai_api_key_here",
    "your_actual_openai_api_key_here",
    "your_key_here",
];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub data_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub output_root: PathBuf,
    pub python: String,
    pub exec_timeout: Duration,
    pub context_budget_tokens: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            data_dir: PathBuf::from("data"),
            metadata_dir: PathBuf::from("metadata"),
            output_root: PathBuf::from("output"),
            python: "python3".to_string(),
            exec_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            context_budget_tokens: DEFAULT_BUDGET_TOKENS,
        }
    }
}

impl AppConfig {
    /// Read configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let exec_timeout = match get("ANALYST_EXEC_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_number(&raw, "ANALYST_EXEC_TIMEOUT_SECS")?),
            None => defaults.exec_timeout,
        };
        let context_budget_tokens = match get("ANALYST_CONTEXT_BUDGET") {
            Some(raw) => parse_number(&raw, "ANALYST_CONTEXT_BUDGET")? as usize,
            None => defaults.context_budget_tokens,
        };

        Ok(Self {
            api_key: get("OPENAI_API_KEY").filter(|k| !is_placeholder_key(k)),
            model: get("OPENAI_MODEL").unwrap_or(defaults.model),
            base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            data_dir: get("ANALYST_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            metadata_dir: get("ANALYST_METADATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.metadata_dir),
            output_root: get("ANALYST_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_root),
            python: get("ANALYST_PYTHON").unwrap_or(defaults.python),
            exec_timeout,
            context_budget_tokens,
        })
    }

    /// Startup checks. A budget that cannot hold a single turn is fatal here,
    /// never a per-query condition.
    pub fn validate(&self) -> Result<ContextBudget> {
        if self.exec_timeout.is_zero() {
            return Err(AnalystError::Config(
                "execution timeout must be at least one second".to_string(),
            ));
        }
        if self.python.trim().is_empty() {
            return Err(AnalystError::Config("interpreter command is empty".to_string()));
        }
        ContextBudget::new(self.context_budget_tokens)
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            AnalystError::Config("OPENAI_API_KEY is not set (or is still a placeholder)".to_string())
        })
    }
}

fn parse_number(raw: &str, key: &str) -> Result<u64> {
    raw.parse::<u64>()
        .map_err(|_| AnalystError::Config(format!("{} must be a whole number, got '{}'", key, raw)))
}

pub fn is_placeholder_key(key: &str) -> bool {
    PLACEHOLDER_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.exec_timeout, Duration::from_secs(120));
        assert_eq!(config.context_budget_tokens, DEFAULT_BUDGET_TOKENS);
        assert!(config.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_placeholder_key_counts_as_missing() {
        let config =
            AppConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "your_openai_api_key_here")])).unwrap();
        assert!(config.require_api_key().is_err());

        let config = AppConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-live")])).unwrap();
        assert_eq!(config.require_api_key().unwrap(), "sk-live");
    }

    #[test]
    fn test_tiny_budget_is_fatal_at_startup() {
        let config = AppConfig::from_lookup(lookup(&[("ANALYST_CONTEXT_BUDGET", "10")])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(AnalystError::ContextBudgetExceeded(_))
        ));
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let err = AppConfig::from_lookup(lookup(&[("ANALYST_EXEC_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, AnalystError::Config(_)));
    }
}
