use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::util::now_millis;

/// 连接状态
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }

    /// connected 或 connecting，断开前需要先关闭传输层
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输层配置
///
/// 参数中可能含有密钥（环境变量、Authorization 头），落盘前由外部组件加密。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// stdio 传输：启动子进程，通过 stdin/stdout 通信
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// 额外注入的环境变量
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// HTTP 传输：JSON-RPC over HTTP POST，响应可为 JSON 或 event-stream
    #[serde(alias = "sse", alias = "streamable-http")]
    Http {
        url: String,
        /// 自定义请求头（如 Authorization）
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Http { .. } => "http",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "command".to_string(),
                        message: "stdio 服务端必须指定启动命令".to_string(),
                    }
                    .into());
                }
            }
            TransportConfig::Http { url, .. } => {
                let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                    field: "url".to_string(),
                    message: e.to_string(),
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigError::InvalidValue {
                        field: "url".to_string(),
                        message: format!("不支持的协议: {}", parsed.scheme()),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// MCP 服务端配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_connect: bool,
    /// 最近一次已知的连接状态
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Unix 毫秒
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, transport: TransportConfig) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            name: name.into(),
            transport,
            enabled: true,
            auto_connect: false,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 创建 stdio 配置
    ///
    /// # 示例
    /// ```
    /// use call_copilot::mcp::ServerConfig;
    /// let config = ServerConfig::stdio("fs", "filesystem", "npx", vec![
    ///     "-y", "@modelcontextprotocol/server-filesystem", "/tmp"
    /// ]);
    /// assert_eq!(config.transport.kind(), "stdio");
    /// ```
    pub fn stdio(
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<impl Into<String>>,
    ) -> Self {
        Self::new(
            id,
            name,
            TransportConfig::Stdio {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
            },
        )
    }

    /// 创建 HTTP 配置
    pub fn http(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::http_with_headers(id, name, url, HashMap::new())
    }

    /// 创建 HTTP 配置（带自定义请求头）
    pub fn http_with_headers(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self::new(
            id,
            name,
            TransportConfig::Http {
                url: url.into(),
                headers,
            },
        )
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".to_string(),
                message: "名称不能为空".to_string(),
            }
            .into());
        }
        self.transport.validate()
    }
}

/// 新建服务端的输入（ID 与时间戳由编排器生成）
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NewServer {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_connect: bool,
}

/// 更新服务端的输入，`None` 字段保持不变
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub transport: Option<TransportConfig>,
    pub enabled: Option<bool>,
    pub auto_connect: Option<bool>,
}

impl ServerUpdate {
    /// 应用到配置上，返回传输参数是否发生变化
    pub fn apply(self, config: &mut ServerConfig) -> bool {
        let mut transport_changed = false;
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(transport) = self.transport {
            transport_changed = transport != config.transport;
            config.transport = transport;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(auto_connect) = self.auto_connect {
            config.auto_connect = auto_connect;
        }
        config.updated_at = now_millis();
        transport_changed
    }
}
