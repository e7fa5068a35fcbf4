//! 对外事件
//!
//! 编排器与健康监控通过 `tokio::sync::broadcast` 广播 [`ConnectionEvent`]，
//! UI 或上层编排器调用 `subscribe()` 获取接收端。没有订阅者时事件被丢弃。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::mcp::types::{Tool, ToolCallResult};

/// 广播通道容量，慢速订阅者落后超过该值会收到 `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ConnectionEvent {
    ServerConnected {
        server_id: String,
        tools: Vec<Tool>,
    },
    ServerDisconnected {
        server_id: String,
        reason: String,
    },
    ServerError {
        server_id: String,
        error: String,
    },
    ToolCallCompleted(ToolCallResult),
    ToolCallError(ToolCallResult),
    Reconnecting {
        server_id: String,
        attempt: u32,
    },
    Reconnected {
        server_id: String,
    },
    ReconnectFailed {
        server_id: String,
        error: String,
    },
}

impl ConnectionEvent {
    /// 事件名（与序列化后的 `event` 字段一致）
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::ServerConnected { .. } => "server-connected",
            ConnectionEvent::ServerDisconnected { .. } => "server-disconnected",
            ConnectionEvent::ServerError { .. } => "server-error",
            ConnectionEvent::ToolCallCompleted(_) => "tool-call-completed",
            ConnectionEvent::ToolCallError(_) => "tool-call-error",
            ConnectionEvent::Reconnecting { .. } => "reconnecting",
            ConnectionEvent::Reconnected { .. } => "reconnected",
            ConnectionEvent::ReconnectFailed { .. } => "reconnect-failed",
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            ConnectionEvent::ServerConnected { server_id, .. }
            | ConnectionEvent::ServerDisconnected { server_id, .. }
            | ConnectionEvent::ServerError { server_id, .. }
            | ConnectionEvent::Reconnecting { server_id, .. }
            | ConnectionEvent::Reconnected { server_id }
            | ConnectionEvent::ReconnectFailed { server_id, .. } => server_id,
            ConnectionEvent::ToolCallCompleted(result) | ConnectionEvent::ToolCallError(result) => {
                &result.server_id
            }
        }
    }

    /// 工具调用结果按状态分流为 completed / error
    pub fn from_tool_result(result: ToolCallResult) -> Self {
        if result.is_success() {
            ConnectionEvent::ToolCallCompleted(result)
        } else {
            ConnectionEvent::ToolCallError(result)
        }
    }
}

/// 事件广播端，clone 后共享同一通道
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        tracing::debug!(event = event.name(), server_id = %event.server_id(), "事件广播");
        // 无订阅者时 send 返回 Err，属正常情况
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }
}
