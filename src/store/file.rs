use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ServerStore, StoreData, ToolCallLogEntry};
use crate::error::{Result, StoreError};
use crate::mcp::server_config::{ConnectionStatus, ServerConfig};
use crate::mcp::types::ToolCallResult;
use crate::util::expand_tilde;

/// JSON 文件持久化 Store
///
/// 每次写操作后全量落盘（pretty JSON）。文件格式：
///
/// ```json
/// {
///   "servers": [ { "id": "crm", "name": "CRM", "transport": { "type": "stdio", ... }, ... } ],
///   "tool_calls": [ { "id": "...", "server_id": "crm", "tool_name": "search", "status": "success", ... } ]
/// }
/// ```
pub struct FileStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl FileStore {
    /// 打开或创建 Store 文件，自动建父目录；文件损坏时从空状态开始
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::IoError(format!("创建目录失败: {e}")))?;
        }
        let data: StoreData = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::IoError(format!("读取 store 文件失败: {e}")))?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Store 文件解析失败，从空状态开始: {e}");
                StoreData::default()
            })
        } else {
            StoreData::default()
        };
        info!(
            path = %path.display(),
            servers = data.servers.len(),
            tool_calls = data.tool_calls.len(),
            "🗄️ FileStore 初始化"
        );
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在持有写锁期间调用，保证落盘顺序与修改顺序一致
    async fn flush(&self, data: &StoreData) -> Result<()> {
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| StoreError::IoError(format!("写入 store 文件失败: {e}")))?;
        debug!(path = %self.path.display(), "💾 Store 已持久化");
        Ok(())
    }
}

#[async_trait]
impl ServerStore for FileStore {
    async fn list_servers(&self) -> Result<Vec<ServerConfig>> {
        Ok(self.data.read().await.list_servers())
    }

    async fn get_server(&self, id: &str) -> Result<Option<ServerConfig>> {
        Ok(self.data.read().await.get_server(id))
    }

    async fn insert_server(&self, config: ServerConfig) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert_server(config)?;
        self.flush(&data).await
    }

    async fn update_server(&self, config: ServerConfig) -> Result<()> {
        let mut data = self.data.write().await;
        data.update_server(config)?;
        self.flush(&data).await
    }

    async fn delete_server(&self, id: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let removed = data.delete_server(id);
        if removed {
            self.flush(&data).await?;
        }
        Ok(removed)
    }

    async fn update_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let mut data = self.data.write().await;
        let found = data.update_status(id, status, error);
        if found {
            self.flush(&data).await?;
        }
        Ok(found)
    }

    async fn log_tool_call(&self, entry: ToolCallLogEntry) -> Result<()> {
        let mut data = self.data.write().await;
        data.log_tool_call(entry);
        self.flush(&data).await
    }

    async fn update_tool_call(&self, log_id: &str, result: &ToolCallResult) -> Result<()> {
        let mut data = self.data.write().await;
        data.update_tool_call(log_id, result)?;
        self.flush(&data).await
    }

    async fn recent_tool_calls(&self, limit: usize) -> Result<Vec<ToolCallLogEntry>> {
        Ok(self.data.read().await.recent_tool_calls(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("servers.json");

        {
            let store = FileStore::new(&path).unwrap();
            store
                .insert_server(ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]))
                .await
                .unwrap();
            store
                .update_status("crm", ConnectionStatus::Error, Some("spawn failed".into()))
                .await
                .unwrap();
            store
                .log_tool_call(ToolCallLogEntry::pending("crm", "search", json!({"q": 1})))
                .await
                .unwrap();
        }

        let reopened = FileStore::new(&path).unwrap();
        let servers = reopened.list_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].status, ConnectionStatus::Error);
        assert_eq!(servers[0].last_error.as_deref(), Some("spawn failed"));
        assert_eq!(reopened.recent_tool_calls(10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_leave_latest_state_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        let store = std::sync::Arc::new(FileStore::new(&path).unwrap());
        for i in 0..16 {
            store
                .insert_server(ServerConfig::http(format!("s{i}"), "S", "https://s.example/mcp"))
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update_status(&format!("s{i}"), ConnectionStatus::Connected, None)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let reopened = FileStore::new(&path).unwrap();
        let servers = reopened.list_servers().await.unwrap();
        assert_eq!(servers.len(), 16);
        assert!(servers.iter().all(|s| s.status == ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileStore::new(&path).unwrap();
        assert!(store.list_servers().await.unwrap().is_empty());

        // 下一次写入覆盖损坏的文件
        store
            .insert_server(ServerConfig::http("docs", "Docs", "https://d.example/mcp"))
            .await
            .unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"docs\""));
    }
}
