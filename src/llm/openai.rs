//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! 聊天与嵌入各一个客户端，单次调用用 tokio 超时包裹。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::error::ConciergeError;
use crate::llm::{ChatClient, EmbeddingClient};
use crate::memory::{Message, Role};

fn build_client(base_url: Option<&str>, api_key: Option<&str>) -> Client<OpenAIConfig> {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "sk-placeholder".to_string());

    let config = if let Some(url) = base_url {
        OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
    } else {
        OpenAIConfig::new().with_api_key(api_key)
    };

    Client::with_config(config)
}

/// OpenAI 兼容聊天客户端：持有 Client 与 model 名，complete 时转消息格式并取首条 content
pub struct OpenAiChatClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiChatClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        Self {
            client: build_client(base_url, api_key),
            model: model.to_string(),
            timeout,
        }
    }

    pub fn from_config(cfg: &LlmSection) -> Self {
        Self::new(
            cfg.base_url.as_deref(),
            &cfg.chat_model,
            cfg.api_key.as_deref(),
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    fn to_openai_messages(&self, messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
            })
            .collect()
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, ConciergeError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages))
            .temperature(0.2)
            .build()
            .map_err(|e| ConciergeError::Llm(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| ConciergeError::Timeout(format!("chat completion ({})", self.model)))?
            .map_err(|e| ConciergeError::Llm(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }
}

/// OpenAI 兼容嵌入客户端：批量输入，保持与请求相同的顺序返回向量
pub struct OpenAiEmbeddingClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiEmbeddingClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        Self {
            client: build_client(base_url, api_key),
            model: model.to_string(),
            timeout,
        }
    }

    pub fn from_config(cfg: &LlmSection) -> Self {
        Self::new(
            cfg.base_url.as_deref(),
            &cfg.embed_model,
            cfg.api_key.as_deref(),
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ConciergeError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(texts.to_vec()))
            .build()
            .map_err(|e| ConciergeError::Embedding(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.embeddings().create(request))
            .await
            .map_err(|_| ConciergeError::Timeout(format!("embeddings ({})", self.model)))?
            .map_err(|e| ConciergeError::Embedding(e.to_string()))?;

        if response.data.len() != texts.len() {
            return Err(ConciergeError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                response.data.len()
            )));
        }

        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}
