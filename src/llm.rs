use crate::context::{estimate_tokens, ConversationTurn, Role, MESSAGE_OVERHEAD_TOKENS};
use crate::error::{AnalystError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A single chat message sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for ChatMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// Everything needed for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    /// Estimated prompt size, counted the same way as conversation turns.
    pub fn estimated_tokens(&self) -> usize {
        let system = estimate_tokens("system") + estimate_tokens(&self.system_prompt) + MESSAGE_OVERHEAD_TOKENS;
        let messages: usize = self
            .messages
            .iter()
            .map(|m| estimate_tokens(m.role.as_str()) + estimate_tokens(&m.content) + MESSAGE_OVERHEAD_TOKENS)
            .sum();
        system + messages
    }
}

/// Text-completion capability the workflow depends on. Any provider works.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Client for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        messages.extend(request.messages.iter().map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        }));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
        });

        // Newer model families only accept max_completion_tokens; reasoning
        // models also spend tokens before the visible answer.
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(request.max_tokens.max(2000));
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(request.max_tokens);
        } else {
            body["max_tokens"] = serde_json::json!(request.max_tokens);
        }
        body
    }
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = self.build_body(request);
        debug!(
            "Calling {} with {} messages (max_tokens={})",
            self.model,
            request.messages.len() + 1,
            request.max_tokens
        );

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalystError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AnalystError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalystError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        extract_content(&response_json)
    }
}

/// Pull the assistant text out of a chat completion response.
pub fn extract_content(response_json: &serde_json::Value) -> Result<String> {
    if let Some(error) = response_json.get("error") {
        return Err(AnalystError::Llm(format!("LLM API error: {}", error)));
    }

    let choices = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| AnalystError::Llm("No choices array in LLM response".to_string()))?;

    let first = choices
        .first()
        .ok_or_else(|| AnalystError::Llm("Empty choices array in LLM response".to_string()))?;

    match first.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("LLM response was truncated due to length limit"),
        Some("content_filter") => {
            return Err(AnalystError::Llm(
                "LLM response was filtered by content policy".to_string(),
            ))
        }
        _ => {}
    }

    let content = first["message"]["content"]
        .as_str()
        .ok_or_else(|| AnalystError::Llm("No content in LLM response".to_string()))?
        .trim();

    if content.is_empty() {
        return Err(AnalystError::Llm("Empty content in LLM response".to_string()));
    }

    Ok(content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> CompletionRequest {
        CompletionRequest {
            system_prompt: "You are a data analyst.".to_string(),
            messages: vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello")],
            max_tokens: 200,
            temperature: 0.0,
        }
    }

    #[test]
    fn test_body_puts_system_prompt_first() {
        let client = OpenAiClient::new("k".into(), "gpt-4o".into(), "https://example.test/v1/".into());
        let body = client.build_body(&request());
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(body["max_completion_tokens"], 200);
        assert_eq!(client.base_url, "https://example.test/v1");
    }

    #[test]
    fn test_request_estimate_counts_every_message() {
        // system: 2 + 6 + 4, "Hi": 1 + 1 + 4, "Hello": 3 + 2 + 4
        assert_eq!(request().estimated_tokens(), 27);
    }

    #[test]
    fn test_older_models_use_max_tokens() {
        let client = OpenAiClient::new("k".into(), "gpt-3.5-turbo".into(), "http://x".into());
        let body = client.build_body(&request());
        assert_eq!(body["max_tokens"], 200);
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn test_extract_content() {
        let ok = json!({"choices": [{"message": {"content": "  analysis  "}, "finish_reason": "stop"}]});
        assert_eq!(extract_content(&ok).unwrap(), "analysis");

        let filtered = json!({"choices": [{"message": {"content": "x"}, "finish_reason": "content_filter"}]});
        assert!(extract_content(&filtered).is_err());

        let error = json!({"error": {"message": "invalid api key"}});
        assert!(matches!(extract_content(&error), Err(AnalystError::Llm(_))));

        let empty = json!({"choices": []});
        assert!(extract_content(&empty).is_err());
    }
}
