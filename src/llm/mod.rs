//! Language-model completion interface.
//!
//! One request, one response, no streaming. The pipeline only ever talks to
//! [`LanguageModel`]; [`OpenAiModel`] is the production implementation.

mod openai;

pub use openai::OpenAiModel;

use async_trait::async_trait;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// What shape of answer the model is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub format: ResponseFormat,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Return the model's text for `request`.
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;
}
