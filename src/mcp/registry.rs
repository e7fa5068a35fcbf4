use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{Result, ToolError};
use crate::mcp::client::{ClientObserver, McpClient, ObserverId};
use crate::mcp::server_config::{ConnectionStatus, ServerConfig};
use crate::mcp::transport::TransportFactory;
use crate::mcp::types::Tool;
use crate::util::now_millis;

type Entries = Arc<RwLock<HashMap<String, ConnectionEntry>>>;

/// 注册表中的单条记录
///
/// 状态字段只由客户端的状态迁移回调更新，注册表自身不判定连接结果。
struct ConnectionEntry {
    client: Arc<McpClient>,
    config: ServerConfig,
    status: ConnectionStatus,
    last_error: Option<String>,
    connected_at: Option<u64>,
    observer_id: ObserverId,
}

/// 对外暴露的条目快照
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub server_id: String,
    pub name: String,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub connected_at: Option<u64>,
    pub tool_count: usize,
}

/// 客户端状态 → 注册表记录
struct RegistryObserver {
    entries: Weak<RwLock<HashMap<String, ConnectionEntry>>>,
}

impl ClientObserver for RegistryObserver {
    fn on_status_changed(&self, server_id: &str, status: ConnectionStatus, detail: Option<&str>) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = entries.write();
        let Some(entry) = entries.get_mut(server_id) else {
            return;
        };
        entry.status = status;
        match status {
            ConnectionStatus::Connected => {
                entry.last_error = None;
                entry.connected_at = Some(now_millis());
            }
            ConnectionStatus::Error => {
                entry.last_error = detail.map(String::from);
                entry.connected_at = None;
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                entry.connected_at = None;
            }
        }
        tracing::debug!(server_id = %server_id, status = %status, "Registry: 状态更新");
    }
}

/// 连接注册表：按服务端 ID 管理 [`McpClient`]，每个 ID 至多一个客户端
pub struct ConnectionRegistry {
    factory: Arc<dyn TransportFactory>,
    entries: Entries,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册服务端（幂等）：已存在时返回现有客户端
    pub fn register(&self, config: ServerConfig) -> Arc<McpClient> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&config.id) {
            return existing.client.clone();
        }

        let client = Arc::new(McpClient::new(config.clone(), self.factory.clone()));
        let observer_id = client.subscribe(Arc::new(RegistryObserver {
            entries: Arc::downgrade(&self.entries),
        }));
        tracing::info!(server_id = %config.id, "Registry: 注册服务端 '{}'", config.name);
        entries.insert(
            config.id.clone(),
            ConnectionEntry {
                client: client.clone(),
                config,
                status: ConnectionStatus::Disconnected,
                last_error: None,
                connected_at: None,
                observer_id,
            },
        );
        client
    }

    /// 注销服务端：连接中则先断开，再移除订阅与记录
    pub async fn unregister(&self, id: &str) -> bool {
        let found = self
            .entries
            .read()
            .get(id)
            .map(|e| (e.client.clone(), e.status.is_live()));
        let Some((client, live)) = found else {
            return false;
        };

        if live {
            client.disconnect("unregistered").await;
        }

        let removed = self.entries.write().remove(id);
        if let Some(entry) = &removed {
            entry.client.unsubscribe(entry.observer_id);
            entry.client.clear_observers();
            tracing::info!(server_id = %id, "Registry: 已注销");
        }
        removed.is_some()
    }

    /// 替换配置快照（调用方负责在传输参数变化前断开）
    pub fn update_config(&self, config: ServerConfig) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&config.id) else {
            return false;
        };
        entry.client.set_config(config.clone());
        entry.config = config;
        true
    }

    // ── 查询 ─────────────────────────────────────────────────────────────────

    pub fn get_client(&self, id: &str) -> Option<Arc<McpClient>> {
        self.entries.read().get(id).map(|e| e.client.clone())
    }

    pub fn get_config(&self, id: &str) -> Option<ServerConfig> {
        self.entries.read().get(id).map(|e| e.config.clone())
    }

    pub fn get_status(&self, id: &str) -> Option<ConnectionStatus> {
        self.entries.read().get(id).map(|e| e.status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn snapshot(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.entries.read().get(id).map(Self::snapshot_of)
    }

    /// 按服务端 ID 排序的全部快照
    pub fn all_statuses(&self) -> Vec<ConnectionSnapshot> {
        let mut all: Vec<_> = self.entries.read().values().map(Self::snapshot_of).collect();
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        all
    }

    fn snapshot_of(entry: &ConnectionEntry) -> ConnectionSnapshot {
        ConnectionSnapshot {
            server_id: entry.config.id.clone(),
            name: entry.config.name.clone(),
            status: entry.status,
            last_error: entry.last_error.clone(),
            connected_at: entry.connected_at,
            tool_count: if entry.status == ConnectionStatus::Connected {
                entry.client.get_tools().len()
            } else {
                0
            },
        }
    }

    /// 所有 connected 服务端的工具并集
    pub fn get_all_tools(&self) -> Vec<Tool> {
        let entries = self.entries.read();
        let mut ids: Vec<&String> = entries
            .iter()
            .filter(|(_, e)| e.status == ConnectionStatus::Connected)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids.into_iter()
            .flat_map(|id| entries[id].client.get_tools())
            .collect()
    }

    /// 按工具名在 connected 服务端中查找（多个同名时取服务端 ID 最小者）
    pub fn find_tool(&self, name: &str) -> Option<(Tool, Arc<McpClient>)> {
        let entries = self.entries.read();
        let mut candidates: Vec<_> = entries
            .values()
            .filter(|e| e.status == ConnectionStatus::Connected)
            .filter_map(|e| e.client.get_tool(name).map(|t| (t, e.client.clone())))
            .collect();
        candidates.sort_by(|a, b| a.0.server_id.cmp(&b.0.server_id));
        candidates.into_iter().next()
    }

    /// 按 `serverId:toolName` 查找
    pub fn find_tool_by_namespace(&self, namespaced: &str) -> Result<Option<(Tool, Arc<McpClient>)>> {
        let (server_id, tool_name) = parse_namespaced(namespaced)?;
        let entries = self.entries.read();
        Ok(entries
            .get(server_id)
            .filter(|e| e.status == ConnectionStatus::Connected)
            .and_then(|e| e.client.get_tool(tool_name).map(|t| (t, e.client.clone()))))
    }

    /// 断开并移除全部服务端
    pub async fn clear(&self) {
        for id in self.server_ids() {
            self.unregister(&id).await;
        }
    }
}

/// 拆分 `serverId:toolName`；工具名本身可以包含冒号
pub fn parse_namespaced(namespaced: &str) -> Result<(&str, &str)> {
    match namespaced.split_once(':') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(ToolError::InvalidNamespace(namespaced.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockToolServer, MockTransportFactory};

    fn registry() -> (ConnectionRegistry, MockTransportFactory) {
        let factory = MockTransportFactory::new();
        factory.add_server(
            "node crm.js",
            MockToolServer::new()
                .with_tool("search_contacts", "Search CRM contacts")
                .with_tool("search", "Generic search"),
        );
        factory.add_server(
            "https://docs.example/mcp",
            MockToolServer::new().with_tool("search", "Search docs"),
        );
        factory.add_server(
            "node broken.js",
            MockToolServer::new().failing_connect("exit code 1"),
        );
        (ConnectionRegistry::new(Arc::new(factory.clone())), factory)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (registry, _) = registry();
        let a = registry.register(ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]));
        let b = registry.register(ServerConfig::stdio("crm", "Other", "node", vec!["other.js"]));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_config("crm").unwrap().name, "CRM");
    }

    #[tokio::test]
    async fn test_status_tracks_client_transitions() {
        let (registry, _) = registry();
        let crm = registry.register(ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]));
        let broken =
            registry.register(ServerConfig::stdio("broken", "Broken", "node", vec!["broken.js"]));

        crm.connect().await.unwrap();
        assert!(broken.connect().await.is_err());

        assert_eq!(registry.get_status("crm"), Some(ConnectionStatus::Connected));
        assert!(registry.snapshot("crm").unwrap().connected_at.is_some());
        let broken = registry.snapshot("broken").unwrap();
        assert_eq!(broken.status, ConnectionStatus::Error);
        assert!(broken.last_error.unwrap().contains("exit code 1"));
    }

    #[tokio::test]
    async fn test_all_tools_only_from_connected() {
        let (registry, _) = registry();
        let crm = registry.register(ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]));
        registry.register(ServerConfig::http("docs", "Docs", "https://docs.example/mcp"));
        crm.connect().await.unwrap();

        let tools = registry.get_all_tools();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|t| t.server_id == "crm"));

        crm.disconnect("test").await;
        assert!(registry.get_all_tools().is_empty());
    }

    #[tokio::test]
    async fn test_find_tool_by_namespace_disambiguates() {
        let (registry, _) = registry();
        let crm = registry.register(ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]));
        let docs = registry.register(ServerConfig::http("docs", "Docs", "https://docs.example/mcp"));
        crm.connect().await.unwrap();
        docs.connect().await.unwrap();

        let (tool, client) = registry.find_tool_by_namespace("docs:search").unwrap().unwrap();
        assert_eq!(tool.description.as_deref(), Some("Search docs"));
        assert_eq!(client.id(), "docs");
        assert_eq!(registry.find_tool("search").unwrap().0.server_id, "crm");
        assert!(registry.find_tool_by_namespace("docs:missing").unwrap().is_none());
        assert!(registry.find_tool_by_namespace("no-colon").is_err());
    }

    #[tokio::test]
    async fn test_unregister_disconnects_first() {
        let (registry, factory) = registry();
        let crm = registry.register(ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]));
        crm.connect().await.unwrap();

        assert!(registry.unregister("crm").await);
        assert_eq!(factory.close_count("node crm.js"), 1);
        assert_eq!(crm.status(), ConnectionStatus::Disconnected);
        assert!(!registry.contains("crm"));
        assert!(!registry.unregister("crm").await);
    }

    #[test]
    fn test_parse_namespaced() {
        assert_eq!(parse_namespaced("crm:search").unwrap(), ("crm", "search"));
        assert_eq!(parse_namespaced("fs:read:file").unwrap(), ("fs", "read:file"));
        assert!(parse_namespaced(":search").is_err());
        assert!(parse_namespaced("crm:").is_err());
    }
}
