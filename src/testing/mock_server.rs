//! 脚本化的 MCP 服务端，用于在不启动子进程 / 不发起 HTTP 请求的情况下测试连接层。
//!
//! [`MockTransportFactory`] 按传输配置（stdio 为 `command args...`，http 为 URL）
//! 查找预先注册的 [`MockToolServer`]，为每次连接创建一个内存传输。
//!
//! # 示例
//!
//! ```rust
//! use call_copilot::testing::{MockToolServer, MockTransportFactory};
//! use call_copilot::mcp::{McpClient, ServerConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let factory = MockTransportFactory::new();
//! factory.add_server("node crm.js", MockToolServer::new().with_tool("search_contacts", "Search contacts"));
//!
//! let config = ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]);
//! let client = McpClient::new(config, Arc::new(factory.clone()));
//! client.connect().await.unwrap();
//! assert!(client.has_tool("search_contacts"));
//! assert_eq!(factory.connect_count("node crm.js"), 1);
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::error::{McpError, Result};
use crate::mcp::server_config::TransportConfig;
use crate::mcp::transport::{McpTransport, TransportFactory};
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};

/// 预设的工具调用结果
#[derive(Clone)]
enum MockToolResponse {
    Success(Value),
    Failure(String),
}

/// 可脚本化的工具服务端定义
#[derive(Clone, Default)]
pub struct MockToolServer {
    tools: Vec<Value>,
    responses: HashMap<String, VecDeque<MockToolResponse>>,
    connect_error: Option<String>,
    failing_close: bool,
}

impl MockToolServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个工具（带单个 `query` 字符串参数）
    pub fn with_tool(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.tools.push(json!({
            "name": name.into(),
            "description": description.into(),
            "inputSchema": {
                "type": "object",
                "properties": { "query": { "type": "string" } }
            }
        }));
        self
    }

    /// 直接追加原始工具定义（可用于构造格式错误的 tools/list）
    pub fn with_raw_tool(mut self, raw: Value) -> Self {
        self.tools.push(raw);
        self
    }

    /// 为指定工具追加一条成功结果（按顺序消费，耗尽后返回默认结果）
    pub fn with_response(mut self, tool: impl Into<String>, result: Value) -> Self {
        self.responses
            .entry(tool.into())
            .or_default()
            .push_back(MockToolResponse::Success(result));
        self
    }

    /// 为指定工具追加一条 `isError: true` 结果
    pub fn with_tool_error(mut self, tool: impl Into<String>, message: impl Into<String>) -> Self {
        self.responses
            .entry(tool.into())
            .or_default()
            .push_back(MockToolResponse::Failure(message.into()));
        self
    }

    /// 每次连接都失败
    pub fn failing_connect(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }

    /// close 返回错误
    pub fn failing_close(mut self) -> Self {
        self.failing_close = true;
        self
    }
}

#[derive(Default)]
struct ServerState {
    server: MockToolServer,
    connect_count: usize,
    close_count: usize,
    calls: Vec<(String, Value)>,
    /// 当前连接代数，kill 后旧传输失效
    generation: u64,
    alive_generation: Option<u64>,
    /// 远端不可达：传输仍自认为可用，但请求全部失败
    unreachable: bool,
}

/// 按传输配置分发到 [`MockToolServer`] 的工厂；clone 共享同一状态
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    servers: Arc<Mutex<HashMap<String, ServerState>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// stdio：`command args...`；http：URL
    pub fn key_for(config: &TransportConfig) -> String {
        match config {
            TransportConfig::Stdio { command, args, .. } => {
                std::iter::once(command.as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            TransportConfig::Http { url, .. } => url.clone(),
        }
    }

    pub fn add_server(&self, key: impl Into<String>, server: MockToolServer) {
        self.servers.lock().insert(
            key.into(),
            ServerState {
                server,
                ..Default::default()
            },
        );
    }

    /// 修改后续连接的失败行为；`None` 表示恢复正常
    pub fn set_connect_error(&self, key: &str, error: Option<&str>) {
        if let Some(state) = self.servers.lock().get_mut(key) {
            state.server.connect_error = error.map(String::from);
        }
    }

    /// 模拟服务端进程退出：已建立的传输全部失效
    pub fn kill(&self, key: &str) {
        if let Some(state) = self.servers.lock().get_mut(key) {
            state.alive_generation = None;
        }
    }

    /// 模拟 HTTP 服务端下线：`is_alive` 不变，每个请求在传输层失败
    pub fn set_unreachable(&self, key: &str, unreachable: bool) {
        if let Some(state) = self.servers.lock().get_mut(key) {
            state.unreachable = unreachable;
        }
    }

    pub fn connect_count(&self, key: &str) -> usize {
        self.servers.lock().get(key).map_or(0, |s| s.connect_count)
    }

    pub fn close_count(&self, key: &str) -> usize {
        self.servers.lock().get(key).map_or(0, |s| s.close_count)
    }

    /// 按时序记录的 `(tool, arguments)`
    pub fn calls(&self, key: &str) -> Vec<(String, Value)> {
        self.servers
            .lock()
            .get(key)
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, config: &TransportConfig) -> Result<Arc<dyn McpTransport>> {
        let key = Self::key_for(config);
        let mut servers = self.servers.lock();
        let state = servers
            .get_mut(&key)
            .ok_or_else(|| McpError::ConnectionFailed(format!("no mock server for '{}'", key)))?;
        state.connect_count += 1;
        if let Some(err) = &state.server.connect_error {
            return Err(McpError::ConnectionFailed(err.clone()).into());
        }
        state.generation += 1;
        state.alive_generation = Some(state.generation);
        Ok(Arc::new(MockTransport {
            key,
            generation: state.generation,
            servers: self.servers.clone(),
        }))
    }
}

struct MockTransport {
    key: String,
    generation: u64,
    servers: Arc<Mutex<HashMap<String, ServerState>>>,
}

impl MockTransport {
    fn handle(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let mut servers = self.servers.lock();
        let state = servers
            .get_mut(&self.key)
            .ok_or(McpError::TransportClosed)?;
        if state.alive_generation != Some(self.generation) {
            return Err(McpError::TransportClosed.into());
        }
        if state.unreachable {
            return Err(McpError::ConnectionFailed(format!(
                "error sending request to {}",
                self.key
            ))
            .into());
        }

        let id = request.id.clone();
        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.key, "version": "0.0.0" }
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(id, json!({ "tools": state.server.tools })),
            "tools/call" => {
                let params = request.params.clone().unwrap_or(Value::Null);
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                state.calls.push((name.clone(), arguments));
                let scripted = state
                    .server
                    .responses
                    .get_mut(&name)
                    .and_then(VecDeque::pop_front);
                match scripted {
                    Some(MockToolResponse::Success(value)) => JsonRpcResponse::success(
                        id,
                        json!({ "content": [{ "type": "text", "text": value.to_string() }] }),
                    ),
                    Some(MockToolResponse::Failure(message)) => JsonRpcResponse::success(
                        id,
                        json!({ "content": [{ "type": "text", "text": message }], "isError": true }),
                    ),
                    None => JsonRpcResponse::success(
                        id,
                        json!({ "content": [{ "type": "text", "text": "mock response" }] }),
                    ),
                }
            }
            other => JsonRpcResponse::failure(id, -32601, format!("method not found: {}", other)),
        };
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for MockTransport {
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.handle(&request)
    }

    async fn notify(&self, _notification: JsonRpcNotification) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut servers = self.servers.lock();
        let Some(state) = servers.get_mut(&self.key) else {
            return Ok(());
        };
        state.close_count += 1;
        if state.alive_generation == Some(self.generation) {
            state.alive_generation = None;
        }
        if state.server.failing_close {
            return Err(McpError::ConnectionFailed("mock close failure".to_string()).into());
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.servers
            .lock()
            .get(&self.key)
            .is_some_and(|s| s.alive_generation == Some(self.generation))
    }
}
