//! External interpreter (LLM) collaborator.
//!
//! The engine hands the interpreter a prompt built from the command markdown, a
//! slice of current state and the player's message, and expects raw text back.
//! Parsing and validating that text is the execution engine's job; implementations
//! here only move bytes.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Everything an interpreter needs for one call.
#[derive(Debug, Clone, Serialize)]
pub struct InterpreterRequest {
    pub experience_id: String,
    pub player_id: String,
    /// Primary name of the command being interpreted.
    pub command: String,
    /// Words after the matched verb or alias.
    pub arguments: String,
    pub message: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// State slice embedded in `user_prompt`, also exposed structurally.
    pub state: Value,
    /// 1 for the first attempt, 2 for the repair retry.
    pub attempt: u8,
}

impl InterpreterRequest {
    pub fn is_repair(&self) -> bool {
        self.attempt > 1
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("interpreter is disabled")]
    Disabled,

    #[error("interpreter timed out after {0}s")]
    Timeout(u64),

    #[error("interpreter transport error: {0}")]
    Transport(String),

    #[error("interpreter returned no content")]
    EmptyResponse,
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Return the interpreter's raw text response.
    async fn interpret(&self, request: &InterpreterRequest) -> Result<String, InterpreterError>;
}

/// Stand-in used when no LLM endpoint is configured; every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledInterpreter;

#[async_trait]
impl Interpreter for DisabledInterpreter {
    async fn interpret(&self, _request: &InterpreterRequest) -> Result<String, InterpreterError> {
        Err(InterpreterError::Disabled)
    }
}

#[cfg(feature = "http-llm")]
pub use http::HttpInterpreter;

#[cfg(feature = "http-llm")]
mod http {
    use super::{Interpreter, InterpreterError, InterpreterRequest};
    use crate::config::LlmConfig;
    use async_trait::async_trait;
    use log::debug;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize)]
    struct ChatCompletionRequest<'a> {
        model: &'a str,
        messages: Vec<ChatMessage<'a>>,
        temperature: f32,
    }

    #[derive(Serialize)]
    struct ChatMessage<'a> {
        role: &'static str,
        content: &'a str,
    }

    #[derive(Deserialize)]
    struct ChatCompletionResponse {
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: ChatMessageResponse,
    }

    #[derive(Deserialize)]
    struct ChatMessageResponse {
        #[serde(default)]
        content: Option<String>,
    }

    /// OpenAI-compatible chat-completions client.
    pub struct HttpInterpreter {
        config: LlmConfig,
        client: reqwest::Client,
    }

    impl HttpInterpreter {
        pub fn new(config: LlmConfig) -> Result<Self, InterpreterError> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
                .build()
                .map_err(|e| InterpreterError::Transport(e.to_string()))?;
            Ok(Self { config, client })
        }
    }

    #[async_trait]
    impl Interpreter for HttpInterpreter {
        async fn interpret(&self, request: &InterpreterRequest) -> Result<String, InterpreterError> {
            if !self.config.enabled {
                return Err(InterpreterError::Disabled);
            }
            let body = ChatCompletionRequest {
                model: &self.config.model,
                temperature: self.config.temperature,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: &request.system_prompt,
                    },
                    ChatMessage {
                        role: "user",
                        content: &request.user_prompt,
                    },
                ],
            };
            let mut call = self.client.post(&self.config.endpoint).json(&body);
            if !self.config.api_key.is_empty() {
                call = call.bearer_auth(&self.config.api_key);
            }
            debug!(
                "Interpreter call: experience={} command={} attempt={}",
                request.experience_id, request.command, request.attempt
            );
            let response = call.send().await.map_err(|e| {
                if e.is_timeout() {
                    InterpreterError::Timeout(self.config.timeout_seconds)
                } else {
                    InterpreterError::Transport(e.to_string())
                }
            })?;
            let response = response
                .error_for_status()
                .map_err(|e| InterpreterError::Transport(e.to_string()))?;
            let parsed: ChatCompletionResponse = response
                .json()
                .await
                .map_err(|e| InterpreterError::Transport(e.to_string()))?;
            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .filter(|c| !c.trim().is_empty())
                .ok_or(InterpreterError::EmptyResponse)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_interpreter_always_fails() {
        let request = InterpreterRequest {
            experience_id: "demo".into(),
            player_id: "alice".into(),
            command: "look".into(),
            arguments: String::new(),
            message: "look".into(),
            system_prompt: String::new(),
            user_prompt: String::new(),
            state: Value::Null,
            attempt: 1,
        };
        assert!(!request.is_repair());
        let err = DisabledInterpreter.interpret(&request).await.unwrap_err();
        assert!(matches!(err, InterpreterError::Disabled));
    }
}
