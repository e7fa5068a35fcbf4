use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ServerStore, StoreData, ToolCallLogEntry};
use crate::error::Result;
use crate::mcp::server_config::{ConnectionStatus, ServerConfig};
use crate::mcp::types::ToolCallResult;

/// 进程内存 Store，不持久化，适合测试和短生命周期使用
#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<StoreData>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定配置预填充
    pub fn with_servers(servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        let mut data = StoreData::default();
        for server in servers {
            if let Err(e) = data.insert_server(server) {
                tracing::warn!("InMemoryStore: 跳过重复配置: {}", e);
            }
        }
        Self {
            data: RwLock::new(data),
        }
    }
}

#[async_trait]
impl ServerStore for InMemoryStore {
    async fn list_servers(&self) -> Result<Vec<ServerConfig>> {
        Ok(self.data.read().await.list_servers())
    }

    async fn get_server(&self, id: &str) -> Result<Option<ServerConfig>> {
        Ok(self.data.read().await.get_server(id))
    }

    async fn insert_server(&self, config: ServerConfig) -> Result<()> {
        self.data.write().await.insert_server(config)
    }

    async fn update_server(&self, config: ServerConfig) -> Result<()> {
        self.data.write().await.update_server(config)
    }

    async fn delete_server(&self, id: &str) -> Result<bool> {
        Ok(self.data.write().await.delete_server(id))
    }

    async fn update_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error: Option<String>,
    ) -> Result<bool> {
        Ok(self.data.write().await.update_status(id, status, error))
    }

    async fn log_tool_call(&self, entry: ToolCallLogEntry) -> Result<()> {
        self.data.write().await.log_tool_call(entry);
        Ok(())
    }

    async fn update_tool_call(&self, log_id: &str, result: &ToolCallResult) -> Result<()> {
        self.data.write().await.update_tool_call(log_id, result)
    }

    async fn recent_tool_calls(&self, limit: usize) -> Result<Vec<ToolCallLogEntry>> {
        Ok(self.data.read().await.recent_tool_calls(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CopilotError, StoreError};

    #[tokio::test]
    async fn test_crud_round() {
        let store = InMemoryStore::new();
        let config = ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]);
        store.insert_server(config.clone()).await.unwrap();

        let dup = store.insert_server(config.clone()).await.unwrap_err();
        assert!(matches!(dup, CopilotError::Store(StoreError::AlreadyExists(_))));

        let mut renamed = config.clone();
        renamed.name = "CRM v2".into();
        store.update_server(renamed).await.unwrap();
        assert_eq!(store.get_server("crm").await.unwrap().unwrap().name, "CRM v2");

        assert!(store.delete_server("crm").await.unwrap());
        assert!(!store.delete_server("crm").await.unwrap());
        assert!(store.get_server("crm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_on_missing_server_returns_false() {
        let store = InMemoryStore::with_servers([ServerConfig::http("docs", "Docs", "https://d.example/mcp")]);
        assert!(
            store
                .update_status("docs", ConnectionStatus::Error, Some("refused".into()))
                .await
                .unwrap()
        );
        let saved = store.get_server("docs").await.unwrap().unwrap();
        assert_eq!(saved.status, ConnectionStatus::Error);
        assert_eq!(saved.last_error.as_deref(), Some("refused"));

        assert!(
            !store
                .update_status("gone", ConnectionStatus::Connected, None)
                .await
                .unwrap()
        );
    }
}
