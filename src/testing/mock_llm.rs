//! Mock LLM 客户端，用于在不发起真实 HTTP 请求的情况下测试使用了 [`LlmClient`] 的组件。
//!
//! 典型用途：
//! - 测试 [`CallAgent`](crate::agent::CallAgent) 的工具调用循环
//! - 测试 [`IntentDetector`](crate::intent::IntentDetector) 的 LLM 判定与回退路径
//!
//! # 示例
//!
//! ```rust
//! use call_copilot::testing::MockLlmClient;
//! use call_copilot::llm::LlmClient;
//! use call_copilot::llm::types::Message;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mock = Arc::new(
//!     MockLlmClient::new()
//!         .with_response("第一次响应")
//!         .with_response("第二次响应")
//! );
//!
//! let r1 = mock.chat_simple(vec![Message::user("hi")]).await.unwrap();
//! assert_eq!(r1, "第一次响应");
//! assert_eq!(mock.call_count(), 1);
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{CopilotError, LlmError, Result};
use crate::llm::LlmClient;
use crate::llm::types::{ChatResponse, Message, ToolCall, ToolDefinition};

/// 预设响应
enum MockLlmResponse {
    Content(String),
    /// `(工具名, 参数 JSON 文本)`；工具名按子串匹配本次调用传入的工具定义，匹配不到时原样使用
    ToolCalls(Vec<(String, String)>),
    Empty,
    Err(CopilotError),
}

/// 可脚本化的 Mock LLM 客户端。
///
/// 按顺序返回预设的响应；队列耗尽后返回 `EmptyResponse` 错误。
/// 所有调用都被记录，可通过 [`call_count`](MockLlmClient::call_count) /
/// [`last_messages`](MockLlmClient::last_messages) 等方法检查。
pub struct MockLlmClient {
    responses: Arc<Mutex<VecDeque<MockLlmResponse>>>,
    /// 每次调用时收到的 messages 列表，按顺序记录
    calls: Arc<Mutex<Vec<Vec<Message>>>>,
    tools: Arc<Mutex<Vec<Vec<ToolDefinition>>>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    /// 创建空 Mock，尚未设置任何响应
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            tools: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(self, response: MockLlmResponse) -> Self {
        self.responses.lock().push_back(response);
        self
    }

    /// 追加一条文本响应
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(MockLlmResponse::Content(text.into()))
    }

    /// 追加一条工具调用响应；`tool` 与传入工具定义的函数名或描述做子串匹配
    pub fn with_tool_call(self, tool: impl Into<String>, arguments: Value) -> Self {
        self.push(MockLlmResponse::ToolCalls(vec![(
            tool.into(),
            arguments.to_string(),
        )]))
    }

    /// 同一轮返回多个工具调用
    pub fn with_tool_calls(self, calls: Vec<(&str, Value)>) -> Self {
        self.push(MockLlmResponse::ToolCalls(
            calls
                .into_iter()
                .map(|(name, args)| (name.to_string(), args.to_string()))
                .collect(),
        ))
    }

    /// 参数为原始字符串（可构造非法 JSON）
    pub fn with_raw_tool_call(self, tool: impl Into<String>, arguments: impl Into<String>) -> Self {
        self.push(MockLlmResponse::ToolCalls(vec![(tool.into(), arguments.into())]))
    }

    /// 追加一条既无文本也无工具调用的响应
    pub fn with_empty(self) -> Self {
        self.push(MockLlmResponse::Empty)
    }

    /// 追加一条错误响应（用于测试错误处理路径）
    pub fn with_error(self, err: CopilotError) -> Self {
        self.push(MockLlmResponse::Err(err))
    }

    /// 追加一条网络错误（常用的便捷方法）
    pub fn with_network_error(self, msg: impl Into<String>) -> Self {
        self.with_error(LlmError::NetworkError(msg.into()).into())
    }

    /// 已发生的调用总次数
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// 最后一次调用时传入的 messages（若从未调用则返回 `None`）
    pub fn last_messages(&self) -> Option<Vec<Message>> {
        self.calls.lock().last().cloned()
    }

    /// 按调用顺序记录的全部 messages
    pub fn all_messages(&self) -> Vec<Vec<Message>> {
        self.calls.lock().clone()
    }

    /// 最后一次 `chat_with_tools` 传入的工具定义
    pub fn last_tools(&self) -> Option<Vec<ToolDefinition>> {
        self.tools.lock().last().cloned()
    }

    /// 剩余未消费的预设响应数量
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }

    fn next(&self, messages: Vec<Message>) -> Option<MockLlmResponse> {
        let index = {
            let mut calls = self.calls.lock();
            calls.push(messages);
            calls.len()
        };
        tracing::debug!("MockLlmClient: 第 {} 次调用", index);
        self.responses.lock().pop_front()
    }
}

fn resolve_tool_name(wanted: &str, tools: &[ToolDefinition]) -> String {
    tools
        .iter()
        .find(|t| t.function.name == wanted)
        .or_else(|| {
            tools.iter().find(|t| {
                t.function.name.contains(wanted) || t.function.description.contains(wanted)
            })
        })
        .map(|t| t.function.name.clone())
        .unwrap_or_else(|| wanted.to_string())
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat_simple(&self, messages: Vec<Message>) -> Result<String> {
        match self.next(messages) {
            Some(MockLlmResponse::Content(text)) => Ok(text),
            Some(MockLlmResponse::Err(e)) => Err(e),
            Some(MockLlmResponse::ToolCalls(_) | MockLlmResponse::Empty) | None => {
                Err(LlmError::EmptyResponse.into())
            }
        }
    }

    async fn chat_with_tools(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ChatResponse> {
        let response = self.next(messages);
        let round = self.tools.lock().len();
        let resolved = match response {
            Some(MockLlmResponse::Content(text)) => Ok(ChatResponse::text(text)),
            Some(MockLlmResponse::ToolCalls(calls)) => Ok(ChatResponse::tools(
                calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, arguments))| {
                        ToolCall::function(
                            format!("call_{}_{}", round, i),
                            resolve_tool_name(&name, &tools),
                            arguments,
                        )
                    })
                    .collect(),
            )),
            Some(MockLlmResponse::Empty) => Ok(ChatResponse::default()),
            Some(MockLlmResponse::Err(e)) => Err(e),
            None => Err(LlmError::EmptyResponse.into()),
        };
        self.tools.lock().push(tools);
        resolved
    }
}
