use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── JSON-RPC 2.0 核心类型 ─────────────────────────────────────────────────────

/// JSON-RPC 2.0 请求（Client → Server）
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// 请求 ID（由传输层自动填充，调用方可留空）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 响应（Server → Client）
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 通知（单向，无需响应）
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 错误对象
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ── MCP 工具相关类型 ──────────────────────────────────────────────────────────

/// MCP 工具定义（来自 tools/list 的原始报文）
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 工具参数的 JSON Schema
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// tools/list 响应结果
///
/// `tools` 保留为原始 JSON，逐条解析，单条格式错误不影响其余工具。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpToolsListResult {
    #[serde(default)]
    pub tools: Vec<Value>,
    /// 分页游标（如有下一页）
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// tools/call 请求参数
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpToolCallParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// tools/call 响应结果
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpToolCallResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    /// 为 true 时表示工具执行出错（但协议层成功）
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    /// 结构化输出（新版协议）
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

/// MCP 内容块（文本 / 图片 / 资源引用）
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

impl McpContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            McpContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// 将 McpContent 列表转换为可读文本
pub fn content_to_text(content: &[McpContent]) -> String {
    content
        .iter()
        .map(|c| match c {
            McpContent::Text { text } => text.clone(),
            McpContent::Image { mime_type, .. } => format!("[image: {}]", mime_type),
            McpContent::Resource { resource } => format!("[resource: {}]", resource),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── MCP 握手类型 ──────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// initialize 请求参数
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "call-copilot".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// 客户端能力声明
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ClientCapabilities {}

/// 客户端身份信息
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// initialize 响应结果
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo", skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

/// 服务端能力声明
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
}

/// 服务端身份信息
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

// ── 领域类型 ─────────────────────────────────────────────────────────────────

/// 工具输入参数的 JSON Schema（object 类型）
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolInputSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

fn object_type() -> String {
    "object".to_string()
}

impl Default for ToolInputSchema {
    fn default() -> Self {
        Self {
            schema_type: object_type(),
            properties: Map::new(),
            required: Vec::new(),
        }
    }
}

impl ToolInputSchema {
    /// 宽松解析：非对象或字段类型不符时退化为空 object schema
    pub fn from_value(value: &Value) -> Self {
        if !value.is_object() {
            return Self::default();
        }
        let mut schema: Self = serde_json::from_value(value.clone()).unwrap_or_default();
        schema.schema_type = object_type();
        schema
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
    }
}

/// 已发现的工具，带所属服务端信息
///
/// 每次（重新）连接时由 tools/list 重新生成，不作为可变状态持久化。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: ToolInputSchema,
    pub server_id: String,
    pub server_name: String,
}

impl Tool {
    pub fn from_mcp(tool: McpTool, server_id: &str, server_name: &str) -> Self {
        Self {
            input_schema: ToolInputSchema::from_value(&tool.input_schema),
            name: tool.name,
            description: tool.description,
            server_id: server_id.to_string(),
            server_name: server_name.to_string(),
        }
    }

    /// `serverId:toolName`
    pub fn namespaced_name(&self) -> String {
        format!("{}:{}", self.server_id, self.name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Success,
    Error,
}

/// 单次工具调用的结果，创建后不可变
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ToolCallResult {
    pub call_id: String,
    pub server_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Unix 毫秒
    pub timestamp: u64,
}

impl ToolCallResult {
    pub fn is_success(&self) -> bool {
        self.status == ToolCallStatus::Success
    }

    /// 喂回 LLM 的文本形式
    pub fn to_content_string(&self) -> String {
        match self.status {
            ToolCallStatus::Success => match &self.result {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => "null".to_string(),
            },
            ToolCallStatus::Error => serde_json::json!({
                "error": self.error.as_deref().unwrap_or("unknown error")
            })
            .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_schema_tolerates_garbage() {
        assert_eq!(ToolInputSchema::from_value(&json!("nope")), ToolInputSchema::default());
        assert_eq!(
            ToolInputSchema::from_value(&json!({"type": "object", "properties": 3})),
            ToolInputSchema::default()
        );

        let schema = ToolInputSchema::from_value(&json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }));
        assert!(schema.properties.contains_key("query"));
        assert_eq!(schema.required, vec!["query".to_string()]);
    }

    #[test]
    fn test_error_result_content_is_json() {
        let result = ToolCallResult {
            call_id: "c1".to_string(),
            server_id: "crm".to_string(),
            tool_name: "search".to_string(),
            status: ToolCallStatus::Error,
            result: None,
            error: Some("boom".to_string()),
            duration_ms: 3,
            timestamp: 0,
        };
        let parsed: Value = serde_json::from_str(&result.to_content_string()).unwrap();
        assert_eq!(parsed["error"], "boom");
    }
}
