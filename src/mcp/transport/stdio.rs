use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};

use crate::error::{McpError, Result};
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use super::McpTransport;

/// 等待响应的发送端 Map：请求 ID → oneshot channel
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// stdio 传输层
///
/// 启动子进程，通过 stdin 发送 JSON-RPC 请求（每行一个 JSON），
/// 通过 stdout 读取响应，后台 task 负责将响应路由到对应的等待方。
/// 子进程随传输层 drop 一并终止。
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    child: Mutex<Child>,
}

impl StdioTransport {
    /// 启动 MCP 服务端进程并建立 stdio 传输
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::ConnectionFailed(format!("无法启动 MCP 服务端 '{}': {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ConnectionFailed("无法获取子进程 stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ConnectionFailed("无法获取子进程 stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let command = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(command = %command, "MCP stdio stderr: {}", line);
                }
            });
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        // 后台 task：持续读取 stdout，将响应路由到对应的 pending channel
        let pending_clone = pending.clone();
        let closed_clone = closed.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        route_line(line, &pending_clone).await;
                    }
                    Ok(None) => {
                        tracing::debug!("MCP stdio: stdout 已关闭");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("MCP stdio: 读取 stdout 出错: {}", e);
                        break;
                    }
                }
            }
            // 持锁置位并清空：send 在同一把锁下检查 closed，不会漏掉新登记的请求
            let mut pending = pending_clone.lock().await;
            closed_clone.store(true, Ordering::SeqCst);
            pending.clear();
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            child: Mutex::new(child),
        })
    }

    async fn write_line(&self, line: String) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::ProtocolError(format!("写入 stdin 失败: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::ProtocolError(format!("flush stdin 失败: {}", e)))?;
        Ok(())
    }
}

async fn route_line(line: &str, pending: &PendingMap) {
    let json: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("MCP stdio: 解析 stdout 行失败: {} | 原始内容: {}", e, line);
            return;
        }
    };

    // 有 id → 这是对某个请求的响应；无 id → 服务端主动通知
    match json.get("id").and_then(Value::as_u64) {
        Some(id) => match serde_json::from_value::<JsonRpcResponse>(json) {
            Ok(response) => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    // 调用方可能已放弃等待
                    let _ = tx.send(response);
                }
            }
            Err(e) => tracing::warn!("MCP stdio: 解析响应失败: {}", e),
        },
        None => {
            let method = json
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            tracing::debug!("MCP stdio: 收到服务端通知: {}", method);
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        request.id = Some(Value::Number(id.into()));

        let (tx, rx) = oneshot::channel::<JsonRpcResponse>();
        {
            let mut pending = self.pending.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(McpError::TransportClosed.into());
            }
            pending.insert(id, tx);
        }

        let line = serde_json::to_string(&request)? + "\n";
        if let Err(e) = self.write_line(line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| McpError::TransportClosed.into())
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        let line = serde_json::to_string(&notification)? + "\n";
        self.write_line(line).await
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        {
            let mut pending = self.pending.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            pending.clear();
        }
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        child
            .kill()
            .await
            .map_err(|e| McpError::ConnectionFailed(format!("终止服务端进程失败: {}", e)).into())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_fails_once_stdout_is_closed() {
        // 关闭 stdout 但进程继续存活，stdin 写入仍会成功
        let args = vec!["-c".to_string(), "exec 1>&-; sleep 5".to_string()];
        let transport = StdioTransport::spawn("sh", &args, &HashMap::new()).await.unwrap();

        for _ in 0..2 {
            let result = tokio::time::timeout(
                Duration::from_secs(3),
                transport.send(JsonRpcRequest::new("ping", None)),
            )
            .await
            .expect("send must not hang after stdout closes");
            assert!(result.is_err());
        }
        assert!(!transport.is_alive());
        transport.close().await.unwrap();
    }
}
