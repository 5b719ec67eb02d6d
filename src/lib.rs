pub mod artifacts;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod executor;
pub mod llm;
pub mod plan;
pub mod prompts;
pub mod session;
pub mod workflow;

pub use error::{AnalystError, Result};
