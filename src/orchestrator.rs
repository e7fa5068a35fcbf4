//! 连接编排器
//!
//! 顶层生命周期协调者：服务端配置的增删改、连接 / 断开 / 测试，
//! 把 [`ConnectionRegistry`]、[`HealthMonitor`] 与持久化 [`ServerStore`] 串起来，
//! 并通过 [`EventBus`] 向外广播 [`ConnectionEvent`]。
//!
//! 传输失败不会越过编排器向上抛出 panic：它们被记录到持久化状态并广播 `server-error`，
//! 同时以 `Err` 返回给调用方。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{ConfigError, McpError, Result};
use crate::events::{ConnectionEvent, EventBus};
use crate::mcp::client::McpClient;
use crate::mcp::health::{HealthConfig, HealthMonitor};
use crate::mcp::registry::{ConnectionRegistry, parse_namespaced};
use crate::mcp::server_config::{
    ConnectionStatus, NewServer, ServerConfig, ServerUpdate, TransportConfig,
};
use crate::mcp::transport::TransportFactory;
use crate::mcp::types::{Tool, ToolCallResult};
use crate::store::{ServerStore, ToolCallLogEntry};

/// 工具执行接口，Agent 循环只依赖它而不是整个编排器
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// 服务端未注册或未连接时返回 `Err`；工具本身的失败体现在结果的 status 中
    async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        input: Value,
    ) -> Result<ToolCallResult>;
}

/// 连接测试结果
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub latency_ms: u64,
    pub tools: Vec<Tool>,
    pub error: Option<String>,
}

/// 各状态的服务端数量与已连接工具总数
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub error: usize,
    pub total_tools: usize,
}

// ── 导入格式 ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ImportFile {
    #[serde(rename = "mcpServers")]
    mcp_servers: BTreeMap<String, ImportedServer>,
}

#[derive(Deserialize)]
struct ImportedServer {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    disabled: bool,
}

impl ImportedServer {
    fn into_transport(self) -> Option<TransportConfig> {
        match (self.command, self.url) {
            (Some(command), _) => Some(TransportConfig::Stdio {
                command,
                args: self.args,
                env: self.env,
            }),
            (None, Some(url)) => Some(TransportConfig::Http {
                url,
                headers: self.headers,
            }),
            (None, None) => None,
        }
    }
}

// ── 编排器 ───────────────────────────────────────────────────────────────────

pub struct ConnectionOrchestrator {
    registry: Arc<ConnectionRegistry>,
    health: HealthMonitor,
    store: Arc<dyn ServerStore>,
    factory: Arc<dyn TransportFactory>,
    events: EventBus,
}

impl ConnectionOrchestrator {
    pub fn new(
        store: Arc<dyn ServerStore>,
        factory: Arc<dyn TransportFactory>,
        health_config: HealthConfig,
    ) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new(factory.clone()));
        let health = HealthMonitor::new(
            health_config,
            registry.clone(),
            store.clone(),
            events.clone(),
        );
        Self {
            registry,
            health,
            store,
            factory,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    // ── 启动 / 关闭 ──────────────────────────────────────────────────────────

    /// 加载持久化配置：重置上个进程遗留的 live 状态，注册启用的服务端，连接 auto_connect 的服务端
    pub async fn initialize(&self) -> Result<()> {
        let servers = self.store.list_servers().await?;
        for server in &servers {
            if server.status.is_live() {
                self.persist_status(&server.id, ConnectionStatus::Disconnected, None)
                    .await;
            }
        }

        let enabled: Vec<_> = servers.into_iter().filter(|s| s.enabled).collect();
        for server in &enabled {
            self.registry.register(server.clone());
        }

        let auto: Vec<_> = enabled.iter().filter(|s| s.auto_connect).collect();
        tracing::info!(
            registered = enabled.len(),
            auto_connect = auto.len(),
            "Orchestrator: 初始化完成，开始自动连接"
        );
        let results = join_all(auto.iter().map(|s| self.connect(&s.id))).await;
        for (server, result) in auto.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(server_id = %server.id, "Orchestrator: 自动连接失败: {}", e);
            }
        }
        Ok(())
    }

    /// 停止所有监控并并发断开全部客户端
    pub async fn shutdown(&self) {
        self.health.stop_all();
        let ids = self.registry.server_ids();
        join_all(ids.iter().map(|id| async move {
            if let Some(client) = self.registry.get_client(id)
                && client.status().is_live()
            {
                client.disconnect("shutdown").await;
                self.persist_status(id, ConnectionStatus::Disconnected, None)
                    .await;
            }
        }))
        .await;
        tracing::info!(servers = ids.len(), "Orchestrator: 已关闭");
    }

    // ── 配置 CRUD ────────────────────────────────────────────────────────────

    /// 持久化配置，叠加注册表中的实时状态
    pub async fn list_servers(&self) -> Result<Vec<ServerConfig>> {
        Ok(self
            .store
            .list_servers()
            .await?
            .into_iter()
            .map(|c| self.with_live_status(c))
            .collect())
    }

    pub async fn get_server(&self, id: &str) -> Result<ServerConfig> {
        self.load(id).await.map(|c| self.with_live_status(c))
    }

    pub async fn create_server(&self, new: NewServer) -> Result<ServerConfig> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut config = ServerConfig::new(id, new.name, new.transport);
        config.enabled = new.enabled;
        config.auto_connect = new.auto_connect;
        self.insert_config(config).await
    }

    async fn insert_config(&self, config: ServerConfig) -> Result<ServerConfig> {
        config.validate()?;
        self.store.insert_server(config.clone()).await?;
        tracing::info!(server_id = %config.id, "Orchestrator: 新增服务端 '{}'", config.name);

        if config.enabled {
            self.registry.register(config.clone());
            if config.auto_connect
                && let Err(e) = self.connect(&config.id).await
            {
                tracing::warn!(server_id = %config.id, "Orchestrator: 新服务端自动连接失败: {}", e);
            }
        }
        Ok(config)
    }

    /// 修改配置；传输参数变化且处于连接中时先断开
    pub async fn update_server(&self, id: &str, update: ServerUpdate) -> Result<ServerConfig> {
        let mut config = self.load(id).await?;
        let transport_changed = update.apply(&mut config);
        config.validate()?;

        let live = self
            .registry
            .get_status(id)
            .is_some_and(|s| s.is_live());
        if live && (transport_changed || !config.enabled) {
            self.disconnect_with_reason(id, "configuration changed").await;
            config.status = ConnectionStatus::Disconnected;
            config.last_error = None;
        }
        self.store.update_server(config.clone()).await?;

        if config.enabled {
            if !self.registry.update_config(config.clone()) {
                self.registry.register(config.clone());
            }
        } else {
            self.health.stop_monitoring(id);
            self.registry.unregister(id).await;
        }
        tracing::info!(server_id = %id, transport_changed, "Orchestrator: 更新服务端");
        Ok(self.with_live_status(config))
    }

    /// 删除服务端：先停止监控并断开，再从注册表与存储中移除
    pub async fn delete_server(&self, id: &str) -> Result<()> {
        let config = self.load(id).await?;
        let was_live = self
            .registry
            .get_status(id)
            .is_some_and(|s| s.is_live());

        self.health.stop_monitoring(id);
        self.registry.unregister(id).await;
        self.store.delete_server(id).await?;

        if was_live {
            self.events.emit(ConnectionEvent::ServerDisconnected {
                server_id: id.to_string(),
                reason: "deleted".to_string(),
            });
        }
        tracing::info!(server_id = %id, "Orchestrator: 删除服务端 '{}'", config.name);
        Ok(())
    }

    /// 导入 `{"mcpServers": {...}}` 格式的配置，返回新建的配置
    pub async fn import_servers(&self, json: &str) -> Result<Vec<ServerConfig>> {
        let file: ImportFile = serde_json::from_str(json)
            .map_err(|e| ConfigError::ParseFailed(format!("mcpServers 导入失败: {}", e)))?;

        let mut created = Vec::new();
        for (name, server) in file.mcp_servers {
            let enabled = !server.disabled;
            let Some(transport) = server.into_transport() else {
                tracing::warn!("Orchestrator: 跳过 '{}'：既没有 command 也没有 url", name);
                continue;
            };
            let new = NewServer {
                name,
                transport,
                enabled,
                auto_connect: false,
            };
            created.push(self.create_server(new).await?);
        }
        tracing::info!(count = created.len(), "Orchestrator: 导入完成");
        Ok(created)
    }

    // ── 连接 ─────────────────────────────────────────────────────────────────

    /// 连接并开始健康监控，返回发现的工具
    pub async fn connect(&self, id: &str) -> Result<Vec<Tool>> {
        let config = self.load(id).await?;
        if !config.enabled {
            return Err(McpError::ServerDisabled(id.to_string()).into());
        }
        let client = self.registry.register(config);

        self.persist_status(id, ConnectionStatus::Connecting, None)
            .await;
        match client.connect().await {
            Ok(()) => {
                let tools = client.get_tools();
                self.persist_status(id, ConnectionStatus::Connected, None)
                    .await;
                self.health.start_monitoring(id);
                self.events.emit(ConnectionEvent::ServerConnected {
                    server_id: id.to_string(),
                    tools: tools.clone(),
                });
                Ok(tools)
            }
            Err(e) => {
                let error = e.to_string();
                self.persist_status(id, ConnectionStatus::Error, Some(error.clone()))
                    .await;
                self.events.emit(ConnectionEvent::ServerError {
                    server_id: id.to_string(),
                    error,
                });
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self, id: &str) -> Result<()> {
        self.load(id).await?;
        self.disconnect_with_reason(id, "user request").await;
        Ok(())
    }

    async fn disconnect_with_reason(&self, id: &str, reason: &str) {
        self.health.stop_monitoring(id);
        let Some(client) = self.registry.get_client(id) else {
            return;
        };
        let was_live = client.status().is_live();
        client.disconnect(reason).await;
        self.persist_status(id, ConnectionStatus::Disconnected, None)
            .await;
        if was_live {
            self.events.emit(ConnectionEvent::ServerDisconnected {
                server_id: id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    pub async fn force_reconnect(&self, id: &str) -> Result<()> {
        let config = self.load(id).await?;
        if !config.enabled {
            return Err(McpError::ServerDisabled(id.to_string()).into());
        }
        self.registry.register(config);
        self.health.force_reconnect(id).await
    }

    /// 测试已保存的服务端，不改变其持久化状态
    pub async fn test_connection(&self, id: &str) -> Result<ConnectionTestResult> {
        let config = self.load(id).await?;
        Ok(self.test_config(&config).await)
    }

    /// 用临时客户端连接一次再断开；不注册、不监控、不落盘
    pub async fn test_config(&self, config: &ServerConfig) -> ConnectionTestResult {
        let started = Instant::now();
        if let Err(e) = config.validate() {
            return ConnectionTestResult {
                success: false,
                latency_ms: 0,
                tools: Vec::new(),
                error: Some(e.to_string()),
            };
        }

        let client = McpClient::new(config.clone(), self.factory.clone());
        let outcome = client.connect().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(()) => ConnectionTestResult {
                success: true,
                latency_ms,
                tools: client.get_tools(),
                error: None,
            },
            Err(e) => ConnectionTestResult {
                success: false,
                latency_ms,
                tools: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        client.disconnect("connection test finished").await;
        tracing::info!(
            server_id = %config.id,
            success = result.success,
            latency_ms,
            "Orchestrator: 连接测试"
        );
        result
    }

    // ── 工具调用 ─────────────────────────────────────────────────────────────

    /// `serverId:toolName` 形式的调用
    pub async fn execute_namespaced(&self, namespaced: &str, input: Value) -> Result<ToolCallResult> {
        let (server_id, tool_name) = parse_namespaced(namespaced)?;
        self.execute_tool(server_id, tool_name, input).await
    }

    pub async fn recent_tool_calls(&self, limit: usize) -> Result<Vec<ToolCallLogEntry>> {
        self.store.recent_tool_calls(limit).await
    }

    // ── 统计 ─────────────────────────────────────────────────────────────────

    pub fn connection_stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        for snapshot in self.registry.all_statuses() {
            stats.total += 1;
            match snapshot.status {
                ConnectionStatus::Connected => stats.connected += 1,
                ConnectionStatus::Connecting => stats.connecting += 1,
                ConnectionStatus::Disconnected => stats.disconnected += 1,
                ConnectionStatus::Error => stats.error += 1,
            }
            stats.total_tools += snapshot.tool_count;
        }
        stats
    }

    // ── 内部 ─────────────────────────────────────────────────────────────────

    async fn load(&self, id: &str) -> Result<ServerConfig> {
        self.store
            .get_server(id)
            .await?
            .ok_or_else(|| McpError::ServerNotFound(id.to_string()).into())
    }

    fn with_live_status(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(snapshot) = self.registry.snapshot(&config.id) {
            config.status = snapshot.status;
            config.last_error = snapshot.last_error;
        }
        config
    }

    async fn persist_status(&self, id: &str, status: ConnectionStatus, error: Option<String>) {
        if let Err(e) = self.store.update_status(id, status, error).await {
            tracing::warn!(server_id = %id, "Orchestrator: 持久化状态失败: {}", e);
        }
    }
}

#[async_trait]
impl ToolExecutor for ConnectionOrchestrator {
    /// 写入调用日志、委托客户端执行，并按结果广播 completed / error 事件
    async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        input: Value,
    ) -> Result<ToolCallResult> {
        let client = self
            .registry
            .get_client(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        if client.status() != ConnectionStatus::Connected {
            return Err(McpError::NotConnected(server_id.to_string()).into());
        }

        let entry = ToolCallLogEntry::pending(server_id, tool_name, input.clone());
        let log_id = entry.id.clone();
        if let Err(e) = self.store.log_tool_call(entry).await {
            tracing::warn!(server_id = %server_id, "Orchestrator: 写入调用日志失败: {}", e);
        }

        let result = client.execute_tool(tool_name, input).await;

        if let Err(e) = self.store.update_tool_call(&log_id, &result).await {
            tracing::warn!(server_id = %server_id, "Orchestrator: 更新调用日志失败: {}", e);
        }
        self.events
            .emit(ConnectionEvent::from_tool_result(result.clone()));
        Ok(result)
    }
}
