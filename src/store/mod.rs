//! 服务端配置与工具调用日志的持久化
//!
//! 编排器只依赖 [`ServerStore`] trait，具体存储由宿主注入。
//! 凭据（环境变量、请求头）按外部组件给出的形式原样保存。
//!
//! ## 内置实现
//!
//! - [`InMemoryStore`]：进程内存，适合测试
//! - [`FileStore`]：JSON 文件持久化，每次修改后落盘
//!
//! ```rust,no_run
//! use call_copilot::store::{FileStore, ServerStore};
//! use call_copilot::mcp::ServerConfig;
//!
//! # async fn example() -> call_copilot::error::Result<()> {
//! let store = FileStore::new("~/.call-copilot/servers.json")?;
//! store.insert_server(ServerConfig::http("docs", "Docs", "https://docs.example.com/mcp")).await?;
//! println!("{} 个服务端", store.list_servers().await?.len());
//! # Ok(())
//! # }
//! ```

mod file;
mod memory;

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::mcp::server_config::{ConnectionStatus, ServerConfig};
use crate::mcp::types::ToolCallResult;
use crate::util::now_millis;

pub use file::FileStore;
pub use memory::InMemoryStore;

/// 工具调用日志保留的最大条数
pub const MAX_TOOL_CALL_LOG: usize = 500;

// ── 工具调用日志 ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallLogStatus {
    Pending,
    Success,
    Error,
}

/// 工具调用日志条目：调用前以 pending 写入，完成后补全结果
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCallLogEntry {
    pub id: String,
    pub server_id: String,
    pub tool_name: String,
    pub input: Value,
    pub status: ToolCallLogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Unix 毫秒
    pub created_at: u64,
}

impl ToolCallLogEntry {
    pub fn pending(server_id: &str, tool_name: &str, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            input,
            status: ToolCallLogStatus::Pending,
            result: None,
            error: None,
            duration_ms: None,
            created_at: now_millis(),
        }
    }

    fn complete(&mut self, result: &ToolCallResult) {
        self.status = if result.is_success() {
            ToolCallLogStatus::Success
        } else {
            ToolCallLogStatus::Error
        };
        self.result = result.result.clone();
        self.error = result.error.clone();
        self.duration_ms = Some(result.duration_ms);
    }
}

// ── ServerStore trait ────────────────────────────────────────────────────────

/// 编排器使用的持久化接口
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// 按创建顺序返回全部配置
    async fn list_servers(&self) -> Result<Vec<ServerConfig>>;

    async fn get_server(&self, id: &str) -> Result<Option<ServerConfig>>;

    /// ID 已存在时返回 `AlreadyExists`
    async fn insert_server(&self, config: ServerConfig) -> Result<()>;

    /// 整体替换，ID 不存在时返回 `NotFound`
    async fn update_server(&self, config: ServerConfig) -> Result<()>;

    /// 返回是否存在并删除
    async fn delete_server(&self, id: &str) -> Result<bool>;

    /// 记录连接状态；服务端不存在（如已删除）时返回 `false`
    async fn update_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error: Option<String>,
    ) -> Result<bool>;

    async fn log_tool_call(&self, entry: ToolCallLogEntry) -> Result<()>;

    /// 用调用结果补全 pending 日志
    async fn update_tool_call(&self, log_id: &str, result: &ToolCallResult) -> Result<()>;

    /// 最近的调用日志，新的在前
    async fn recent_tool_calls(&self, limit: usize) -> Result<Vec<ToolCallLogEntry>>;
}

// ── 共享的内存表示 ───────────────────────────────────────────────────────────

/// 两种实现共用的数据结构，FileStore 直接将其序列化落盘
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    servers: Vec<ServerConfig>,
    #[serde(default)]
    tool_calls: VecDeque<ToolCallLogEntry>,
}

impl StoreData {
    fn list_servers(&self) -> Vec<ServerConfig> {
        self.servers.clone()
    }

    fn get_server(&self, id: &str) -> Option<ServerConfig> {
        self.servers.iter().find(|s| s.id == id).cloned()
    }

    fn insert_server(&mut self, config: ServerConfig) -> Result<()> {
        if self.servers.iter().any(|s| s.id == config.id) {
            return Err(StoreError::AlreadyExists(config.id).into());
        }
        self.servers.push(config);
        Ok(())
    }

    fn update_server(&mut self, config: ServerConfig) -> Result<()> {
        let slot = self
            .servers
            .iter_mut()
            .find(|s| s.id == config.id)
            .ok_or_else(|| StoreError::NotFound(config.id.clone()))?;
        *slot = config;
        Ok(())
    }

    fn delete_server(&mut self, id: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.id != id);
        self.servers.len() != before
    }

    fn update_status(&mut self, id: &str, status: ConnectionStatus, error: Option<String>) -> bool {
        let Some(server) = self.servers.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        server.status = status;
        server.last_error = error;
        server.updated_at = now_millis();
        true
    }

    fn log_tool_call(&mut self, entry: ToolCallLogEntry) {
        self.tool_calls.push_back(entry);
        while self.tool_calls.len() > MAX_TOOL_CALL_LOG {
            self.tool_calls.pop_front();
        }
    }

    fn update_tool_call(&mut self, log_id: &str, result: &ToolCallResult) -> Result<()> {
        let entry = self
            .tool_calls
            .iter_mut()
            .rev()
            .find(|e| e.id == log_id)
            .ok_or_else(|| StoreError::NotFound(log_id.to_string()))?;
        entry.complete(result);
        Ok(())
    }

    fn recent_tool_calls(&self, limit: usize) -> Vec<ToolCallLogEntry> {
        self.tool_calls.iter().rev().take(limit).cloned().collect()
    }

    #[cfg(test)]
    fn tool_call_count(&self) -> usize {
        self.tool_calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::ToolCallStatus;
    use serde_json::json;

    fn result_for(status: ToolCallStatus) -> ToolCallResult {
        ToolCallResult {
            call_id: "c1".into(),
            server_id: "crm".into(),
            tool_name: "search".into(),
            status,
            result: Some(json!({"hits": 1})),
            error: None,
            duration_ms: 12,
            timestamp: now_millis(),
        }
    }

    #[test]
    fn test_tool_call_log_is_bounded_and_newest_first() {
        let mut data = StoreData::default();
        for i in 0..(MAX_TOOL_CALL_LOG + 5) {
            data.log_tool_call(ToolCallLogEntry::pending("crm", &format!("t{}", i), json!({})));
        }
        assert_eq!(data.tool_call_count(), MAX_TOOL_CALL_LOG);
        let recent = data.recent_tool_calls(2);
        assert_eq!(recent[0].tool_name, format!("t{}", MAX_TOOL_CALL_LOG + 4));
    }

    #[test]
    fn test_update_tool_call_completes_pending_entry() {
        let mut data = StoreData::default();
        let entry = ToolCallLogEntry::pending("crm", "search", json!({"query": "Acme"}));
        let id = entry.id.clone();
        data.log_tool_call(entry);

        data.update_tool_call(&id, &result_for(ToolCallStatus::Success))
            .unwrap();
        let stored = &data.recent_tool_calls(1)[0];
        assert_eq!(stored.status, ToolCallLogStatus::Success);
        assert_eq!(stored.duration_ms, Some(12));
        assert!(data
            .update_tool_call("missing", &result_for(ToolCallStatus::Error))
            .is_err());
    }
}
