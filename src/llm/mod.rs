pub mod config;
pub mod types;

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};

use crate::error::{ConfigError, LlmError, Result};
use crate::llm::config::{ModelConfig, ModelRegistry};
use crate::llm::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatResponse, Message, ResponseFormat,
    ToolDefinition,
};

/// 错误响应体在错误信息中保留的最大字符数
const MAX_ERROR_BODY_CHARS: usize = 512;

/// 意图检测与 Agent 循环依赖的 LLM 调用接口
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发起一次简单的无工具对话，返回模型的文本内容
    async fn chat_simple(&self, messages: Vec<Message>) -> Result<String>;

    /// 带函数调用能力的对话，返回文本和/或工具调用
    async fn chat_with_tools(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ChatResponse>;

    /// 要求模型输出 JSON 对象；默认退化为普通对话，由调用方解析
    async fn chat_json(&self, messages: Vec<Message>) -> Result<String> {
        self.chat_simple(messages).await
    }
}

/// OpenAI 兼容接口的默认实现
pub struct DefaultLlmClient {
    client: Client,
    model: ModelConfig,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl DefaultLlmClient {
    pub fn new(client: Client, model: ModelConfig) -> Self {
        Self {
            client,
            model,
            temperature: Some(0.3),
            max_tokens: Some(2048),
        }
    }

    /// 按模型名从环境变量加载
    pub fn from_env(model_name: &str) -> Result<Self> {
        let registry = ModelRegistry::from_env()?;
        Ok(Self::new(Client::new(), registry.get(model_name)?))
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model.model
    }

    fn headers(&self) -> Result<HeaderMap> {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.model.apikey)).map_err(|e| {
            ConfigError::InvalidValue {
                field: format!("apikey ({})", self.model.model),
                message: e.to_string(),
            }
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn complete(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        response_format: Option<ResponseFormat>,
    ) -> Result<ChatResponse> {
        let tool_choice = tools.as_ref().map(|_| "auto".to_string());
        let request_body = ChatCompletionRequest {
            model: self.model.model.clone(),
            messages,
            tools,
            tool_choice,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format,
        };

        let started = Instant::now();
        let completion = self.post(&request_body).await?;
        let total_tokens = completion.usage.as_ref().and_then(|u| u.total_tokens);
        if completion.choices.is_empty() {
            return Err(LlmError::InvalidResponse(format!("{} 返回了空的 choices", self.model.model)).into());
        }
        let response = ChatResponse::from(completion);
        tracing::debug!(
            model = %self.model.model,
            messages = request_body.messages.len(),
            tool_calls = response.tool_calls.len(),
            finish_reason = response.finish_reason.as_deref().unwrap_or("-"),
            total_tokens,
            latency_ms = started.elapsed().as_millis() as u64,
            "LLM: 补全完成"
        );
        Ok(response)
    }

    /// 发往 Chat Completions 接口；连接层失败、HTTP 错误、响应解析失败分别映射为不同的 [`LlmError`]
    async fn post(&self, body: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let response = self
            .client
            .post(&self.model.baseurl)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    "请求超时"
                } else if e.is_connect() {
                    "无法连接"
                } else {
                    "请求失败"
                };
                tracing::warn!(model = %self.model.model, url = %self.model.baseurl, "LLM: {}: {}", kind, e);
                LlmError::NetworkError(format!("{} {}: {}", self.model.model, kind, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            tracing::warn!(model = %self.model.model, status = status.as_u16(), "LLM: 接口返回错误");
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message,
            }
            .into());
        }

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("{}: {}", self.model.model, e)).into())
    }
}

#[async_trait]
impl LlmClient for DefaultLlmClient {
    async fn chat_simple(&self, messages: Vec<Message>) -> Result<String> {
        self.complete(messages, None, None)
            .await?
            .content
            .ok_or_else(|| LlmError::EmptyResponse.into())
    }

    async fn chat_with_tools(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ChatResponse> {
        let tools = (!tools.is_empty()).then_some(tools);
        self.complete(messages, tools, None).await
    }

    async fn chat_json(&self, messages: Vec<Message>) -> Result<String> {
        self.complete(messages, None, Some(ResponseFormat::JsonObject))
            .await?
            .content
            .ok_or_else(|| LlmError::EmptyResponse.into())
    }
}
