use thiserror::Error;

/// call-copilot 的统一错误类型
#[derive(Debug, Error)]
pub enum CopilotError {
    /// MCP 连接 / 协议错误
    #[error("MCP Error: {0}")]
    Mcp(#[from] McpError),
    /// LLM 相关错误
    #[error("LLM Error: {0}")]
    Llm(#[from] LlmError),
    /// 工具解析 / 执行错误
    #[error("Tool Error: {0}")]
    Tool(#[from] ToolError),
    /// 持久化错误
    #[error("Store Error: {0}")]
    Store(#[from] StoreError),
    /// 配置错误
    #[error("Config Error: {0}")]
    Config(#[from] ConfigError),
    /// IO 错误
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    /// 其他错误
    #[error("Error: {0}")]
    Other(String),
}

/// MCP 服务端连接与协议错误
#[derive(Debug, Error)]
pub enum McpError {
    /// 子进程启动失败或远端不可达
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// initialize 握手失败
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
    /// JSON-RPC 报文异常
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    /// tools/call 在协议层失败
    #[error("Tool call failed: {0}")]
    ToolCallFailed(String),
    /// 传输层已关闭，等待中的请求无法完成
    #[error("Transport closed")]
    TransportClosed,
    /// 服务端当前不是 connected 状态
    #[error("Server '{0}' is not connected")]
    NotConnected(String),
    /// 未知的服务端 ID
    #[error("Server '{0}' not found")]
    ServerNotFound(String),
    /// 服务端已被禁用
    #[error("Server '{0}' is disabled")]
    ServerDisabled(String),
}

/// LLM 相关错误
#[derive(Debug, Error)]
pub enum LlmError {
    /// 网络请求失败
    #[error("Network error: {0}")]
    NetworkError(String),
    /// API 返回错误状态码
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },
    /// 响应格式无效
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// 没有返回内容
    #[error("Empty response from LLM")]
    EmptyResponse,
}

/// 工具解析 / 执行错误
#[derive(Debug, Error)]
pub enum ToolError {
    /// 工具未找到
    #[error("Tool '{0}' not found")]
    NotFound(String),
    /// 命名空间格式无效（应为 `serverId:toolName`）
    #[error("Invalid namespaced tool name: '{0}'")]
    InvalidNamespace(String),
    /// 正则模式无效
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}

/// 持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 记录不存在
    #[error("Record '{0}' not found")]
    NotFound(String),
    /// 记录已存在
    #[error("Record '{0}' already exists")]
    AlreadyExists(String),
    /// 文件读写失败
    #[error("IO error: {0}")]
    IoError(String),
    /// 序列化 / 反序列化失败
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),
    /// 配置解析失败
    #[error("Failed to parse config: {0}")]
    ParseFailed(String),
    /// 环境变量格式错误
    #[error("Invalid model env var: {0}")]
    EnvFormatError(String),
    /// 未知的模型配置项
    #[error("Unknown model config key '{0}' in {1}")]
    UnMatchConfigError(String, String),
    /// 模型配置缺少必要字段
    #[error("Model '{0}' is missing '{1}'")]
    MissingConfig(String, String),
    /// 未找到模型
    #[error("Model '{0}' not configured")]
    NotFindModelError(String),
    /// 配置值无效
    #[error("Invalid config value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl From<reqwest::Error> for CopilotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CopilotError::Llm(LlmError::NetworkError("Request timeout".to_string()))
        } else if err.is_connect() {
            CopilotError::Llm(LlmError::NetworkError(format!(
                "Connection failed: {}",
                err
            )))
        } else {
            CopilotError::Llm(LlmError::NetworkError(err.to_string()))
        }
    }
}

impl From<serde_json::Error> for CopilotError {
    fn from(err: serde_json::Error) -> Self {
        CopilotError::Mcp(McpError::ProtocolError(err.to_string()))
    }
}

impl From<serde_yaml::Error> for CopilotError {
    fn from(err: serde_yaml::Error) -> Self {
        CopilotError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<regex::Error> for CopilotError {
    fn from(err: regex::Error) -> Self {
        CopilotError::Tool(ToolError::InvalidPattern(err.to_string()))
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, CopilotError>;
