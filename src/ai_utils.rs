use std::sync::LazyLock;

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::LlmConfig, error::LlmError};

/// Incremental text deltas from a streamed completion.
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatTurn>,
}

impl CompletionRequest {
    /// A single user message with no system instruction or history.
    pub fn single(content: impl Into<String>) -> Self {
        Self {
            system: None,
            messages: vec![ChatTurn::user(content)],
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;

    async fn complete_stream(&self, request: CompletionRequest) -> Result<TextStream, LlmError>;
}

/// Any OpenAI compatible chat completion endpoint.
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    max_output_tokens: u32,
}

impl OpenAiModel {
    pub fn new(config: &LlmConfig) -> Self {
        let openai = OpenAIConfig::default()
            .with_api_base(config.api_base.clone())
            .with_api_key(config.api_key.clone());
        Self {
            client: Client::with_config(openai),
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
        }
    }

    fn build_request(
        &self,
        request: CompletionRequest,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        if let Some(system) = request.system {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()?
                    .into(),
            );
        }
        for turn in request.messages {
            let message: ChatCompletionRequestMessage = match turn.role {
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content)
                    .build()?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content)
                    .build()?
                    .into(),
            };
            messages.push(message);
        }
        CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .max_completion_tokens(self.max_output_tokens)
            .messages(messages)
            .build()
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let request = self.build_request(request).map_err(classify_error)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify_error)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("no content in response".to_string()))
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<TextStream, LlmError> {
        let request = self.build_request(request).map_err(classify_error)?;
        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(classify_error)?;
        let deltas = async_stream::stream! {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(response) => {
                        let Some(choice) = response.choices.first() else {
                            continue;
                        };
                        if let Some(content) = choice.delta.content.as_ref() {
                            if !content.is_empty() {
                                yield Ok(content.clone());
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(classify_error(e));
                        break;
                    }
                }
            }
        };
        Ok(deltas.boxed())
    }
}

static RATE_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|quota|too many requests|rate[ _-]?limit").unwrap()
});

/// Whether an upstream error message describes rate limiting rather than a hard failure.
pub fn is_rate_limit_message(message: &str) -> bool {
    RATE_LIMIT_PATTERN.is_match(message)
}

fn classify_error(e: OpenAIError) -> LlmError {
    let message = e.to_string();
    debug!("upstream model error: {}", message);
    if is_rate_limit_message(&message) {
        return LlmError::RateLimited(message);
    }
    match e {
        OpenAIError::JSONDeserialize(_) => LlmError::InvalidResponse(message),
        _ => LlmError::RequestFailed(message),
    }
}

pub trait Tokens {
    fn tokens(&self) -> u64;
}
impl Tokens for String {
    fn tokens(&self) -> u64 {
        self.as_str().tokens()
    }
}
impl Tokens for str {
    fn tokens(&self) -> u64 {
        (self.len() + 2) as u64 / 4
    }
}
impl Tokens for ChatTurn {
    fn tokens(&self) -> u64 {
        self.content.tokens()
    }
}

/// Find the first well-formed JSON object embedded in free text.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    for (start, _) in text.match_indices('{') {
        let mut values =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        if let Some(Ok(serde_json::Value::Object(object))) = values.next() {
            return Some(object);
        }
    }
    None
}
