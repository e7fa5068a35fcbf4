use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{McpError, Result};
use crate::mcp::server_config::{ConnectionStatus, ServerConfig};
use crate::mcp::transport::{McpTransport, TransportFactory};
use crate::mcp::types::{
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, McpTool,
    McpToolCallParams, McpToolCallResult, McpToolsListResult, Tool, ToolCallResult,
    ToolCallStatus, content_to_text,
};
use crate::util::now_millis;

pub type ObserverId = u64;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// 连接客户端的事件订阅接口
///
/// 回调在状态迁移的调用方线程上同步执行，实现方不应阻塞。
pub trait ClientObserver: Send + Sync {
    /// `detail`：error 状态下为错误信息，disconnected 状态下为断开原因
    fn on_status_changed(&self, _server_id: &str, _status: ConnectionStatus, _detail: Option<&str>) {
    }
    fn on_tools_changed(&self, _server_id: &str, _tools: &[Tool]) {}
    fn on_tool_result(&self, _result: &ToolCallResult) {}
}

#[derive(Debug, Clone, Default)]
struct ClientState {
    status: ConnectionStatus,
    last_error: Option<String>,
    connected_at: Option<u64>,
}

/// MCP 连接客户端
///
/// 管理与单个 MCP 服务端的完整生命周期：
/// 1. 建立传输 → 2. 握手（initialize） → 3. 工具发现（tools/list） → 4. 工具调用（tools/call）
///
/// connect / disconnect 通过传输槽位的异步锁串行化。
pub struct McpClient {
    config: RwLock<ServerConfig>,
    factory: Arc<dyn TransportFactory>,
    state: RwLock<ClientState>,
    tools: RwLock<Vec<Tool>>,
    transport: tokio::sync::Mutex<Option<Arc<dyn McpTransport>>>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn ClientObserver>)>>,
    next_observer_id: AtomicU64,
}

impl McpClient {
    pub fn new(config: ServerConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            config: RwLock::new(config),
            factory,
            state: RwLock::new(ClientState::default()),
            tools: RwLock::new(Vec::new()),
            transport: tokio::sync::Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
        }
    }

    // ── 订阅 ─────────────────────────────────────────────────────────────────

    pub fn subscribe(&self, observer: Arc<dyn ClientObserver>) -> ObserverId {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.observers.write().push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.observers.write().retain(|(oid, _)| *oid != id);
    }

    pub fn clear_observers(&self) {
        self.observers.write().clear();
    }

    fn observers(&self) -> Vec<Arc<dyn ClientObserver>> {
        self.observers.read().iter().map(|(_, o)| o.clone()).collect()
    }

    /// 状态迁移：更新状态后通知所有订阅者
    fn transition(&self, status: ConnectionStatus, detail: Option<String>) {
        {
            let mut state = self.state.write();
            state.status = status;
            match status {
                ConnectionStatus::Connected => {
                    state.last_error = None;
                    state.connected_at = Some(now_millis());
                }
                ConnectionStatus::Error => {
                    state.last_error = detail.clone();
                    state.connected_at = None;
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                    state.connected_at = None;
                }
            }
        }
        let server_id = self.id();
        for observer in self.observers() {
            observer.on_status_changed(&server_id, status, detail.as_deref());
        }
    }

    fn set_tools(&self, tools: Vec<Tool>) {
        *self.tools.write() = tools.clone();
        let server_id = self.id();
        for observer in self.observers() {
            observer.on_tools_changed(&server_id, &tools);
        }
    }

    // ── 生命周期 ─────────────────────────────────────────────────────────────

    /// 建立传输、握手并发现工具；任何失败都会进入 error 状态并返回错误
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.transport.lock().await;
        if slot.is_some() && self.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        if let Some(stale) = slot.take()
            && let Err(e) = stale.close().await
        {
            tracing::warn!(server_id = %self.id(), "MCP: 关闭旧传输失败: {}", e);
        }

        let config = self.config();
        tracing::info!(server_id = %config.id, "MCP: 正在连接服务端 '{}'", config.name);
        self.transition(ConnectionStatus::Connecting, None);

        match self.establish(&config).await {
            Ok((transport, tools)) => {
                tracing::info!(
                    server_id = %config.id,
                    "MCP: 已连接 '{}'，发现 {} 个工具",
                    config.name,
                    tools.len()
                );
                *slot = Some(transport);
                self.set_tools(tools);
                self.transition(ConnectionStatus::Connected, None);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server_id = %config.id, "MCP: 连接 '{}' 失败: {}", config.name, e);
                self.tools.write().clear();
                self.transition(ConnectionStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn establish(&self, config: &ServerConfig) -> Result<(Arc<dyn McpTransport>, Vec<Tool>)> {
        let transport = self.factory.create(&config.transport).await?;
        match Self::handshake(&transport, config).await {
            Ok(tools) => Ok((transport, tools)),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::debug!("MCP: 握手失败后关闭传输出错: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn handshake(transport: &Arc<dyn McpTransport>, config: &ServerConfig) -> Result<Vec<Tool>> {
        // ── Step 1: initialize 握手 ───────────────────────────────────────────
        let init_req = JsonRpcRequest::new(
            "initialize",
            Some(serde_json::to_value(InitializeParams::default())?),
        );
        let init_resp = transport.send(init_req).await?;
        if let Some(err) = init_resp.error {
            return Err(McpError::InitializationFailed(err.message).into());
        }
        let init_result: InitializeResult = serde_json::from_value(init_resp.result.ok_or_else(
            || McpError::InitializationFailed("initialize 响应为空".to_string()),
        )?)
        .map_err(|e| McpError::InitializationFailed(e.to_string()))?;

        tracing::debug!(
            "MCP: '{}' 协议版本 {}",
            config.name,
            init_result.protocol_version
        );
        if let Some(info) = &init_result.server_info {
            tracing::debug!("MCP: 服务端信息: {} v{}", info.name, info.version);
        }

        // ── Step 2: 发送 initialized 通知 ────────────────────────────────────
        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        // ── Step 3: 发现工具 ─────────────────────────────────────────────────
        let tools = Self::fetch_tools(transport, config).await?;
        for tool in &tools {
            tracing::debug!(
                "MCP:   工具 '{}' - {}",
                tool.name,
                tool.description.as_deref().unwrap_or("(无描述)")
            );
        }
        Ok(tools)
    }

    /// 从传输层获取工具列表（支持分页），跳过格式错误的条目
    async fn fetch_tools(transport: &Arc<dyn McpTransport>, config: &ServerConfig) -> Result<Vec<Tool>> {
        let mut all_tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let resp = transport
                .send(JsonRpcRequest::new("tools/list", params))
                .await?;

            if let Some(err) = resp.error {
                tracing::warn!("MCP: '{}' tools/list 返回错误: {}", config.name, err.message);
                break;
            }

            let result: McpToolsListResult = match serde_json::from_value(
                resp.result.unwrap_or(Value::Null),
            ) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("MCP: '{}' tools/list 响应格式错误: {}", config.name, e);
                    break;
                }
            };

            for raw in result.tools {
                match serde_json::from_value::<McpTool>(raw) {
                    Ok(tool) => all_tools.push(Tool::from_mcp(tool, &config.id, &config.name)),
                    Err(e) => tracing::warn!("MCP: '{}' 跳过无效工具定义: {}", config.name, e),
                }
            }

            cursor = result.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        Ok(all_tools)
    }

    /// 关闭传输（幂等）；即使底层关闭失败也会进入 disconnected 状态
    pub async fn disconnect(&self, reason: &str) {
        let mut slot = self.transport.lock().await;
        let transport = slot.take();
        let was_disconnected = self.status() == ConnectionStatus::Disconnected;

        if let Some(transport) = transport
            && let Err(e) = transport.close().await
        {
            tracing::warn!(server_id = %self.id(), "MCP: 关闭传输失败: {}", e);
        }

        if was_disconnected {
            return;
        }
        tracing::info!(server_id = %self.id(), "MCP: 断开 '{}' ({})", self.name(), reason);
        self.set_tools(Vec::new());
        self.transition(ConnectionStatus::Disconnected, Some(reason.to_string()));
    }

    /// 健康探测：对 connected 的服务端发送 `ping`
    ///
    /// 传输已失效（子进程退出）或请求在传输层失败（HTTP 服务端不可达）时迁移到 error。
    /// 服务端返回 JSON-RPC 错误（如不支持 ping）仍视为存活。
    pub async fn probe(&self) -> ConnectionStatus {
        if self.status() != ConnectionStatus::Connected {
            return self.status();
        }
        let transport = self.transport.lock().await.clone();
        let failure = match &transport {
            Some(t) if t.is_alive() => {
                let ping = t.send(JsonRpcRequest::new("ping", None));
                match tokio::time::timeout(PING_TIMEOUT, ping).await {
                    Ok(Ok(_)) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("ping 超时（{} 秒）", PING_TIMEOUT.as_secs())),
                }
            }
            _ => Some(McpError::TransportClosed.to_string()),
        };
        let Some(reason) = failure else {
            return ConnectionStatus::Connected;
        };

        let mut slot = self.transport.lock().await;
        // 探测期间已被重连或断开
        let unchanged = match (&transport, slot.as_ref()) {
            (Some(probed), Some(current)) => Arc::ptr_eq(probed, current),
            (None, None) => true,
            _ => false,
        };
        if !unchanged || self.status() != ConnectionStatus::Connected {
            return self.status();
        }
        if let Some(dead) = slot.take()
            && let Err(e) = dead.close().await
        {
            tracing::debug!(server_id = %self.id(), "MCP: 关闭失效传输出错: {}", e);
        }
        tracing::warn!(server_id = %self.id(), "MCP: '{}' 健康探测失败: {}", self.name(), reason);
        self.set_tools(Vec::new());
        self.transition(ConnectionStatus::Error, Some(reason));
        ConnectionStatus::Error
    }

    // ── 工具调用 ─────────────────────────────────────────────────────────────

    /// 调用工具；错误被收进结果而不是返回，同时通知订阅者
    pub async fn execute_tool(&self, tool_name: &str, input: Value) -> ToolCallResult {
        let started = Instant::now();
        let outcome = self.call_tool(tool_name, input).await;

        let (status, result, error) = match outcome {
            Ok(value) => (ToolCallStatus::Success, Some(value), None),
            Err(e) => (ToolCallStatus::Error, None, Some(e)),
        };
        let call = ToolCallResult {
            call_id: uuid::Uuid::new_v4().to_string(),
            server_id: self.id(),
            tool_name: tool_name.to_string(),
            status,
            result,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: now_millis(),
        };

        tracing::debug!(
            server_id = %call.server_id,
            tool = %tool_name,
            status = ?call.status,
            duration_ms = call.duration_ms,
            "MCP: 工具调用完成"
        );
        for observer in self.observers() {
            observer.on_tool_result(&call);
        }
        call
    }

    async fn call_tool(&self, tool_name: &str, input: Value) -> std::result::Result<Value, String> {
        if self.status() != ConnectionStatus::Connected {
            return Err(McpError::NotConnected(self.id()).to_string());
        }
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or_else(|| McpError::NotConnected(self.id()).to_string())?;

        let params = McpToolCallParams {
            name: tool_name.to_string(),
            arguments: Some(input),
        };
        let params = serde_json::to_value(params).map_err(|e| e.to_string())?;
        let resp = transport
            .send(JsonRpcRequest::new("tools/call", Some(params)))
            .await
            .map_err(|e| e.to_string())?;

        if let Some(err) = resp.error {
            return Err(McpError::ToolCallFailed(format!(
                "工具 '{}' 调用失败: {}",
                tool_name, err.message
            ))
            .to_string());
        }

        let result: McpToolCallResult =
            serde_json::from_value(resp.result.unwrap_or(Value::Null)).map_err(|e| e.to_string())?;
        let text = content_to_text(&result.content);
        if result.is_error {
            return Err(text);
        }
        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }
        Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
    }

    // ── 查询 ─────────────────────────────────────────────────────────────────

    pub fn id(&self) -> String {
        self.config.read().id.clone()
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    /// 替换配置快照；变更传输参数前调用方需先断开
    pub fn set_config(&self, config: ServerConfig) {
        *self.config.write() = config;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn connected_at(&self) -> Option<u64> {
        self.state.read().connected_at
    }

    pub fn get_tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().iter().any(|t| t.name == name)
    }

    pub fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.read().iter().find(|t| t.name == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockToolServer, MockTransportFactory};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<(ConnectionStatus, Option<String>)>>,
        results: Mutex<Vec<ToolCallResult>>,
    }

    impl ClientObserver for Recorder {
        fn on_status_changed(&self, _server_id: &str, status: ConnectionStatus, detail: Option<&str>) {
            self.statuses.lock().push((status, detail.map(String::from)));
        }
        fn on_tool_result(&self, result: &ToolCallResult) {
            self.results.lock().push(result.clone());
        }
    }

    fn client_with(server: MockToolServer) -> (McpClient, MockTransportFactory) {
        let factory = MockTransportFactory::new();
        factory.add_server("node crm.js", server);
        let config = ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]);
        (McpClient::new(config, Arc::new(factory.clone())), factory)
    }

    #[tokio::test]
    async fn test_connect_discovers_tools_and_emits_transitions() {
        let (client, _) = client_with(
            MockToolServer::new()
                .with_tool("search_contacts", "Search CRM contacts")
                .with_tool("get_deal", "Fetch a deal"),
        );
        let recorder = Arc::new(Recorder::default());
        client.subscribe(recorder.clone());

        client.connect().await.unwrap();

        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert!(client.connected_at().is_some());
        assert_eq!(client.get_tools().len(), 2);
        assert!(client.has_tool("get_deal"));
        assert_eq!(client.get_tool("get_deal").unwrap().server_id, "crm");
        let statuses: Vec<_> = recorder.statuses.lock().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_goes_to_error() {
        let (client, _) = client_with(MockToolServer::new().failing_connect("spawn failed"));
        let recorder = Arc::new(Recorder::default());
        client.subscribe(recorder.clone());

        assert!(client.connect().await.is_err());
        assert_eq!(client.status(), ConnectionStatus::Error);
        assert!(client.last_error().unwrap().contains("spawn failed"));
        let last = recorder.statuses.lock().last().cloned().unwrap();
        assert_eq!(last.0, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_execute_tool_captures_errors_in_result() {
        let server = MockToolServer::new()
            .with_tool("search_contacts", "Search CRM contacts")
            .with_response("search_contacts", json!({"contacts": [{"name": "Jane"}]}))
            .with_tool_error("get_deal", "deal not found");
        let (client, _) = client_with(server.with_tool("get_deal", "Fetch a deal"));
        let recorder = Arc::new(Recorder::default());
        client.subscribe(recorder.clone());

        // 未连接时也返回结果而非报错
        let offline = client.execute_tool("search_contacts", json!({})).await;
        assert_eq!(offline.status, ToolCallStatus::Error);

        client.connect().await.unwrap();
        let ok = client
            .execute_tool("search_contacts", json!({"query": "Jane"}))
            .await;
        assert!(ok.is_success());
        assert_eq!(ok.result.unwrap()["contacts"][0]["name"], "Jane");

        let failed = client.execute_tool("get_deal", json!({"id": 1})).await;
        assert_eq!(failed.status, ToolCallStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("deal not found"));

        assert_eq!(recorder.results.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_survives_close_failure() {
        let (client, factory) =
            client_with(MockToolServer::new().with_tool("t", "x").failing_close());
        let recorder = Arc::new(Recorder::default());
        client.subscribe(recorder.clone());

        client.connect().await.unwrap();
        client.disconnect("user request").await;
        client.disconnect("again").await;

        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(client.get_tools().is_empty());
        assert_eq!(factory.close_count("node crm.js"), 1);
        let disconnects: Vec<_> = recorder
            .statuses
            .lock()
            .iter()
            .filter(|(s, _)| *s == ConnectionStatus::Disconnected)
            .cloned()
            .collect();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].1.as_deref(), Some("user request"));
    }
}
