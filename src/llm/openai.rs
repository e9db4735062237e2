//! OpenAI 兼容 API 提供方
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；OpenAI、DeepSeek、Doubao 与自建代理
//! 均通过 `with_api_base` 接入。支持 function calling。OpenAIError 映射为 LlmError，请求可被取消令牌中断。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionTools,
    CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{
    LlmError, LlmOptions, ModelProvider, ModelResponse, TokenUsage, ToolCall, ToolDefinition,
};
use crate::memory::{Message, Role};

/// 将 async_openai 错误归类为 LlmError
fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) if e.is_timeout() => LlmError::Timeout,
        OpenAIError::Reqwest(e) => LlmError::Network(e.to_string()),
        OpenAIError::ApiError(api) => {
            let kind = api
                .code
                .as_deref()
                .or(api.r#type.as_deref())
                .unwrap_or_default()
                .to_lowercase();
            if kind.contains("api_key") || kind.contains("auth") || kind.contains("permission") {
                LlmError::Auth(api.message)
            } else if kind.contains("rate_limit") {
                LlmError::RateLimited {
                    retry_after_ms: 1000,
                }
            } else if kind.contains("server_error") || kind.contains("overloaded") {
                LlmError::Api {
                    status: 500,
                    message: api.message,
                }
            } else {
                LlmError::Api {
                    status: 400,
                    message: api.message,
                }
            }
        }
        OpenAIError::InvalidArgument(msg) => LlmError::Configuration(msg),
        other => LlmError::InvalidResponse(other.to_string()),
    }
}

/// 消息历史转为 API 请求消息；assistant 携带 tool_calls，tool 携带 tool_call_id
fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    messages
        .iter()
        .map(|m| -> Result<ChatCompletionRequestMessage, OpenAIError> {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::Assistant => {
                    let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                    if !m.content.is_empty() || m.tool_calls.is_empty() {
                        args.content(m.content.clone());
                    }
                    if !m.tool_calls.is_empty() {
                        args.tool_calls(
                            m.tool_calls
                                .iter()
                                .map(|c| {
                                    ChatCompletionMessageToolCalls::Function(
                                        ChatCompletionMessageToolCall {
                                            id: c.id.clone(),
                                            function: FunctionCall {
                                                name: c.name.clone(),
                                                arguments: c.arguments.clone(),
                                            },
                                        },
                                    )
                                })
                                .collect::<Vec<_>>(),
                        );
                    }
                    ChatCompletionRequestMessage::Assistant(args.build()?)
                }
                Role::Tool => ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(m.content.clone())
                        .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                        .build()?,
                ),
            };
            Ok(msg)
        })
        .collect::<Result<Vec<_>, OpenAIError>>()
        .map_err(map_openai_error)
}

fn to_openai_tools(tools: &[ToolDefinition]) -> Result<Vec<ChatCompletionTools>, LlmError> {
    tools
        .iter()
        .map(|t| -> Result<ChatCompletionTools, OpenAIError> {
            let function = FunctionObjectArgs::default()
                .name(t.name.clone())
                .description(t.description.clone())
                .parameters(t.parameters.clone())
                .build()?;
            let tool = ChatCompletionTool { function };
            Ok(ChatCompletionTools::Function(tool))
        })
        .collect::<Result<Vec<_>, OpenAIError>>()
        .map_err(map_openai_error)
}

/// OpenAI 兼容提供方：持有 Client 与默认 model 名
pub struct OpenAiProvider {
    name: String,
    client: Client<OpenAIConfig>,
    api_base: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    supported_models: Vec<String>,
}

impl OpenAiProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let api_base = base_url.trim_end_matches('/').to_string();
        if api_base.is_empty() {
            return Err(LlmError::Configuration("empty base_url".to_string()));
        }
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        let mut config = OpenAIConfig::new().with_api_base(api_base.clone());
        if let Some(key) = &api_key {
            config = config.with_api_key(key.clone());
        }
        Ok(Self {
            name: name.into(),
            client: Client::with_config(config),
            api_base,
            api_key,
            model: model.to_string(),
            timeout,
            supported_models: vec![model.to_string()],
        })
    }

    /// 追加可选模型（首个为默认模型）
    pub fn with_supported_models(mut self, models: impl IntoIterator<Item = String>) -> Self {
        for m in models {
            if !self.supported_models.contains(&m) {
                self.supported_models.push(m);
            }
        }
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    async fn send(&self, messages: &[Message], options: &LlmOptions) -> Result<ModelResponse, LlmError> {
        if self.api_key.is_none() {
            return Err(LlmError::Auth(format!("no API key configured for {}", self.name)));
        }
        let model = options.model.as_deref().unwrap_or(&self.model);

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model).messages(to_openai_messages(messages)?);
        if let Some(t) = options.temperature {
            args.temperature(t);
        }
        if let Some(n) = options.max_tokens {
            args.max_completion_tokens(n);
        }
        if !options.tools.is_empty() {
            args.tools(to_openai_tools(&options.tools)?);
        }
        let request = args.build().map_err(map_openai_error)?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(map_openai_error)?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64));
        let response_model = response.model;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;

        let finish_reason = choice
            .finish_reason
            .and_then(|r| serde_json::to_value(r).ok())
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();

        let mut tool_calls = Vec::new();
        for call in choice.message.tool_calls.unwrap_or_default() {
            match call {
                ChatCompletionMessageToolCalls::Function(f) => {
                    tool_calls.push(ToolCall::new(f.id, f.function.name, f.function.arguments));
                }
                other => tracing::warn!(call = ?other, "ignoring non-function tool call"),
            }
        }

        Ok(ModelResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            model: if response_model.is_empty() {
                model.to_string()
            } else {
                response_model
            },
            finish_reason,
            usage,
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_response(
        &self,
        messages: &[Message],
        options: &LlmOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError> {
        tracing::debug!(provider = %self.name, messages = messages.len(), tools = options.tools.len(), "chat completion request");
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            r = self.send(messages, options) => r,
        }
    }

    fn supported_models(&self) -> Vec<String> {
        self.supported_models.clone()
    }

    async fn validate_configuration(&self) -> bool {
        self.api_key.is_some()
            && !self.model.is_empty()
            && reqwest::Url::parse(&self.api_base).is_ok()
    }
}
