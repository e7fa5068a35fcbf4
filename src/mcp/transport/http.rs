use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use crate::error::{McpError, Result};
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use super::McpTransport;

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// HTTP 传输层
///
/// 每个 JSON-RPC 消息一次 POST 到配置的 URL。服务端可以直接返回 JSON，
/// 也可以返回 `text/event-stream`，此时从 `data:` 行中取出 id 匹配的响应。
/// 服务端下发的 `Mcp-Session-Id` 会在后续请求中带回。
/// 请求在连接层失败（服务端不可达）后 `is_alive` 返回 false，直到再次收到响应。
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    reachable: AtomicBool,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: String, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            url,
            headers,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
        }
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, &self.url)
            .header(ACCEPT, "application/json, text/event-stream");
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        if let Some(session) = self.session_id.read().as_ref() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session.to_string());
        }
    }
}

/// 从 event-stream 报文中取出 id 匹配的 JSON-RPC 响应
pub(crate) fn parse_event_stream(body: &str, id: &Value) -> Option<JsonRpcResponse> {
    let mut data = String::new();
    let mut events = Vec::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if line.trim().is_empty() && !data.is_empty() {
            events.push(std::mem::take(&mut data));
        }
    }
    if !data.is_empty() {
        events.push(data);
    }

    events
        .iter()
        .filter_map(|event| serde_json::from_str::<JsonRpcResponse>(event).ok())
        .find(|resp| resp.id.as_ref() == Some(id))
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = Value::Number(self.next_id.fetch_add(1, Ordering::SeqCst).into());
        request.id = Some(id.clone());

        let response = match self.request(reqwest::Method::POST).json(&request).send().await {
            Ok(response) => {
                self.reachable.store(true, Ordering::SeqCst);
                response
            }
            Err(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() {
                    self.reachable.store(false, Ordering::SeqCst);
                }
                return Err(McpError::ConnectionFailed(format!("HTTP 请求失败: {}", e)).into());
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(
                McpError::ConnectionFailed(format!("HTTP 错误 {}: {}", status, body)).into(),
            );
        }
        self.remember_session(&response);

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| McpError::ProtocolError(format!("读取 HTTP 响应失败: {}", e)))?;

        if is_event_stream {
            return parse_event_stream(&body, &id).ok_or_else(|| {
                McpError::ProtocolError("event-stream 中没有匹配的响应".to_string()).into()
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            McpError::ProtocolError(format!("解析 HTTP 响应失败: {}", e)).into()
        })
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        // 通知是 fire-and-forget
        match self
            .request(reqwest::Method::POST)
            .json(&notification)
            .send()
            .await
        {
            Ok(response) => self.remember_session(&response),
            Err(e) => tracing::debug!("MCP http: 通知发送失败: {}", e),
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // 仅有会话时才需要显式结束
        if self.session_id.read().is_none() {
            return Ok(());
        }
        let result = self.request(reqwest::Method::DELETE).send().await;
        *self.session_id.write() = None;
        result
            .map(|_| ())
            .map_err(|e| McpError::ConnectionFailed(format!("结束 HTTP 会话失败: {}", e)).into())
    }

    fn is_alive(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_stream_picks_matching_id() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\
                    \n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"tools\":[]}}\n\
                    \n";
        let resp = parse_event_stream(body, &json!(7)).unwrap();
        assert_eq!(resp.result, Some(json!({"tools": []})));
        assert!(parse_event_stream(body, &json!(8)).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_marks_transport_dead() {
        // 绑定后立即释放端口，连接会被拒绝
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        drop(listener);

        let transport = HttpTransport::new(reqwest::Client::new(), url, HashMap::new());
        assert!(transport.is_alive());
        let err = transport
            .send(JsonRpcRequest::new("ping", None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 请求失败"));
        assert!(!transport.is_alive());
    }

    #[test]
    fn test_event_stream_without_trailing_blank_line() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}";
        assert!(parse_event_stream(body, &json!(1)).is_some());
    }
}
