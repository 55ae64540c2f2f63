//! OpenAI 兼容推理服务
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek、OpenAI、自建代理均可。
//! 有输出 schema 时把 schema 写进 system 消息，并从回复中提取 JSON。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::Value;

use crate::llm::traits::{extract_json, LlmError, ReasoningRequest, ReasoningService};

/// OpenAI 兼容推理服务：持有 Client 与 model 名
pub struct OpenAiReasoner {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiReasoner {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_messages(&self, request: &ReasoningRequest) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let mut system = request.system_prompt.clone().unwrap_or_default();
        if let Some(schema) = &request.output_schema {
            system.push_str(
                "\n\nRespond with a single JSON object only, no prose, matching this JSON Schema:\n",
            );
            system.push_str(&serde_json::to_string(schema).unwrap_or_default());
        }

        let mut messages = Vec::with_capacity(2);
        if !system.trim().is_empty() {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .map_err(|e| LlmError::Transport(e.to_string()))?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()
                .map_err(|e| LlmError::Transport(e.to_string()))?,
        ));
        Ok(messages)
    }
}

#[async_trait]
impl ReasoningService for OpenAiReasoner {
    async fn call(&self, request: &ReasoningRequest) -> Result<Value, LlmError> {
        #[allow(deprecated)]
        let api_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.build_messages(request)?)
            .max_tokens(request.max_tokens)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(api_request)
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        tracing::debug!(task = request.task.as_str(), model = %self.model, chars = content.len(), "reasoning response");

        if request.output_schema.is_some() {
            extract_json(&content)
        } else if content.trim().is_empty() {
            Err(LlmError::EmptyResponse)
        } else {
            Ok(Value::String(content))
        }
    }
}
