pub mod http;
pub mod stdio;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::mcp::server_config::TransportConfig;
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// MCP 传输层抽象
///
/// 负责在 Client 和 Server 之间传递 JSON-RPC 消息，
/// 屏蔽底层通信细节（进程 stdin/stdout 或 HTTP）。
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// 发送请求并等待响应（传输层自动管理请求 ID）
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// 发送通知（无需等待响应）
    async fn notify(&self, notification: JsonRpcNotification) -> Result<()>;

    /// 关闭传输层连接
    async fn close(&self) -> Result<()>;

    /// 底层连接是否仍然可用（子进程退出后为 false）
    fn is_alive(&self) -> bool {
        true
    }
}

/// 按配置创建传输层，测试中替换为脚本化实现
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, config: &TransportConfig) -> Result<Arc<dyn McpTransport>>;
}

/// 默认工厂：stdio 启动子进程，http 创建 reqwest 客户端
#[derive(Default)]
pub struct DefaultTransportFactory {
    http: reqwest::Client,
}

impl DefaultTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(&self, config: &TransportConfig) -> Result<Arc<dyn McpTransport>> {
        match config {
            TransportConfig::Stdio { command, args, env } => {
                Ok(Arc::new(StdioTransport::spawn(command, args, env).await?))
            }
            TransportConfig::Http { url, headers } => Ok(Arc::new(HttpTransport::new(
                self.http.clone(),
                url.clone(),
                headers.clone(),
            ))),
        }
    }
}
