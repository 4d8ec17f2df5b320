use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat as OpenAiResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use tracing::debug;

use super::{CompletionRequest, LanguageModel, PromptMessage, ResponseFormat, Role};
use crate::config::LlmConfig;
use crate::error::LlmError;

/// Chat-completions backend for OpenAI or any compatible endpoint.
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
}

impl OpenAiModel {
    pub fn new(config: &LlmConfig, api_key: &str) -> Self {
        let mut openai = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = &config.api_base {
            openai = openai.with_api_base(base);
        }
        Self {
            client: Client::with_config(openai),
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn to_openai_message(message: &PromptMessage) -> Result<ChatCompletionRequestMessage, LlmError> {
    let content = message.content.clone();
    let built = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::System),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::User),
    };
    built.map_err(|e| LlmError::Request(e.to_string()))
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let messages = request
            .messages
            .iter()
            .map(to_openai_message)
            .collect::<Result<Vec<_>, _>>()?;

        let format = match request.format {
            ResponseFormat::Json => OpenAiResponseFormat::JsonObject,
            ResponseFormat::Text => OpenAiResponseFormat::Text,
        };

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .messages(messages)
            .temperature(self.temperature)
            .response_format(format)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)?;

        debug!(model = %self.model, chars = content.len(), "model responded");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_map_to_chat_messages() {
        assert!(matches!(
            to_openai_message(&PromptMessage::system("rules")),
            Ok(ChatCompletionRequestMessage::System(_))
        ));
        assert!(matches!(
            to_openai_message(&PromptMessage::user("how many orders")),
            Ok(ChatCompletionRequestMessage::User(_))
        ));
    }

    #[test]
    fn test_model_name_comes_from_config() {
        let config = LlmConfig {
            api_base: Some("http://localhost:11434/v1".to_string()),
            ..LlmConfig::default()
        };
        let model = OpenAiModel::new(&config, "key");
        assert_eq!(model.model(), "gpt-4o-mini");
    }
}
