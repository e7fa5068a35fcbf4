//! 健康监控
//!
//! 每个被监控的服务端持有两个定时任务：
//! - 固定间隔的健康检查（探测客户端状态）
//! - 一次性的重连退避定时器
//!
//! 重连状态机：`Idle → Scheduled → Attempting → (成功 → Idle | 失败 → Scheduled | 耗尽 → Exhausted)`。
//! 进入 `Exhausted` 后不再自动重试，直到外部调用 [`HealthMonitor::force_reconnect`]。
//!
//! 定时任务只持有监控器内部状态的弱引用；`stop_monitoring` / `stop_all` / drop 时全部 abort。

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{McpError, Result};
use crate::events::{ConnectionEvent, EventBus};
use crate::mcp::registry::ConnectionRegistry;
use crate::mcp::server_config::ConnectionStatus;
use crate::store::ServerStore;
use crate::util::now_millis;

/// 健康检查与重连参数（毫秒）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            initial_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 60_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

/// 第 `attempt` 次（从 1 开始）重连前的等待：`min(initial · 2^(attempt-1), max)`
pub fn backoff_delay(config: &HealthConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay = config
        .initial_reconnect_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_reconnect_delay_ms);
    Duration::from_millis(delay)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPhase {
    Idle,
    Scheduled,
    Attempting,
    /// 达到最大次数，等待外部强制重连
    Exhausted,
}

/// 单个服务端的监控状态快照
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub server_id: String,
    pub is_healthy: bool,
    pub reconnect_attempts: u32,
    pub phase: ReconnectPhase,
    /// 最近一次健康检查（Unix 毫秒）
    pub last_check: Option<u64>,
}

struct MonitoredServer {
    health_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    attempts: u32,
    last_check: Option<u64>,
    is_healthy: bool,
    phase: ReconnectPhase,
}

impl MonitoredServer {
    fn new() -> Self {
        Self {
            health_task: None,
            reconnect_task: None,
            attempts: 0,
            last_check: None,
            is_healthy: true,
            phase: ReconnectPhase::Idle,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    fn snapshot(&self, server_id: &str) -> HealthSnapshot {
        HealthSnapshot {
            server_id: server_id.to_string(),
            is_healthy: self.is_healthy,
            reconnect_attempts: self.attempts,
            phase: self.phase,
            last_check: self.last_check,
        }
    }
}

struct Inner {
    config: HealthConfig,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn ServerStore>,
    events: EventBus,
    servers: Mutex<HashMap<String, MonitoredServer>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, mut server) in self.servers.get_mut().drain() {
            server.cancel_timers();
        }
    }
}

/// 健康监控器，clone 后共享同一份状态
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn ServerStore>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                events,
                servers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// 开始监控（已在监控中则忽略）
    pub fn start_monitoring(&self, server_id: &str) {
        let mut servers = self.inner.servers.lock();
        if servers.contains_key(server_id) {
            return;
        }
        let mut monitored = MonitoredServer::new();
        monitored.health_task = Some(spawn_health_loop(
            Arc::downgrade(&self.inner),
            server_id.to_string(),
            self.inner.config.check_interval(),
        ));
        servers.insert(server_id.to_string(), monitored);
        tracing::debug!(server_id = %server_id, "Health: 开始监控");
    }

    /// 停止监控并取消两个定时器
    pub fn stop_monitoring(&self, server_id: &str) -> bool {
        match self.inner.servers.lock().remove(server_id) {
            Some(mut monitored) => {
                monitored.cancel_timers();
                tracing::debug!(server_id = %server_id, "Health: 停止监控");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = self.inner.servers.lock().drain().collect();
        for (_, mut monitored) in drained {
            monitored.cancel_timers();
        }
    }

    pub fn is_monitoring(&self, server_id: &str) -> bool {
        self.inner.servers.lock().contains_key(server_id)
    }

    pub fn status(&self, server_id: &str) -> Option<HealthSnapshot> {
        self.inner
            .servers
            .lock()
            .get(server_id)
            .map(|m| m.snapshot(server_id))
    }

    pub fn all_statuses(&self) -> Vec<HealthSnapshot> {
        let mut all: Vec<_> = self
            .inner
            .servers
            .lock()
            .iter()
            .map(|(id, m)| m.snapshot(id))
            .collect();
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        all
    }

    /// 立即执行一次健康检查（不等待定时器）
    pub async fn check_now(&self, server_id: &str) {
        self.inner.check(server_id).await;
    }

    /// 取消已排期的重连，清零计数并立即重连
    ///
    /// 未在监控中的服务端会先纳入监控。正在重连时只清零计数，由当前尝试决定结果。
    pub async fn force_reconnect(&self, server_id: &str) -> Result<()> {
        if !self.inner.registry.contains(server_id) {
            return Err(McpError::ServerNotFound(server_id.to_string()).into());
        }
        self.start_monitoring(server_id);
        {
            let mut servers = self.inner.servers.lock();
            let Some(monitored) = servers.get_mut(server_id) else {
                return Ok(());
            };
            if monitored.phase == ReconnectPhase::Attempting {
                monitored.attempts = 0;
                return Ok(());
            }
            if let Some(task) = monitored.reconnect_task.take() {
                task.abort();
            }
            monitored.attempts = 1;
            monitored.phase = ReconnectPhase::Attempting;
        }
        tracing::info!(server_id = %server_id, "Health: 强制重连");
        self.inner.attempt_reconnect(server_id, 1).await
    }
}

fn spawn_health_loop(inner: Weak<Inner>, server_id: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.check(&server_id).await;
        }
    })
}

impl Inner {
    async fn check(self: &Arc<Self>, server_id: &str) {
        let Some(client) = self.registry.get_client(server_id) else {
            tracing::debug!(server_id = %server_id, "Health: 服务端已注销，跳过检查");
            return;
        };
        let status = client.probe().await;

        let newly_unhealthy = {
            let mut servers = self.servers.lock();
            let Some(monitored) = servers.get_mut(server_id) else {
                return;
            };
            monitored.last_check = Some(now_millis());
            match status {
                ConnectionStatus::Connected => {
                    if !monitored.is_healthy {
                        tracing::info!(server_id = %server_id, "Health: 恢复健康");
                    }
                    monitored.is_healthy = true;
                    monitored.attempts = 0;
                    if monitored.phase == ReconnectPhase::Exhausted {
                        monitored.phase = ReconnectPhase::Idle;
                    }
                    false
                }
                // 连接进行中，下一轮再判断
                ConnectionStatus::Connecting => false,
                ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                    let was_healthy = monitored.is_healthy;
                    monitored.is_healthy = false;
                    if monitored.phase == ReconnectPhase::Idle {
                        tracing::warn!(server_id = %server_id, status = %status, "Health: 服务端不健康，开始重连");
                        self.schedule_reconnect(server_id, monitored);
                    }
                    was_healthy
                }
            }
        };

        if newly_unhealthy {
            let error = client
                .last_error()
                .unwrap_or_else(|| status.as_str().to_string());
            self.persist(server_id, status, client.last_error()).await;
            self.events.emit(ConnectionEvent::ServerError {
                server_id: server_id.to_string(),
                error,
            });
        }
    }

    /// 计数 +1 后按退避排期；已达上限则进入 Exhausted 并报告终止
    fn schedule_reconnect(self: &Arc<Self>, server_id: &str, monitored: &mut MonitoredServer) {
        if monitored.attempts >= self.config.max_reconnect_attempts {
            monitored.phase = ReconnectPhase::Exhausted;
            monitored.reconnect_task = None;
            tracing::error!(
                server_id = %server_id,
                attempts = monitored.attempts,
                "Health: 重连次数耗尽，停止自动重连"
            );
            self.events.emit(ConnectionEvent::ReconnectFailed {
                server_id: server_id.to_string(),
                error: format!("已达最大重连次数 {}", self.config.max_reconnect_attempts),
            });
            return;
        }

        monitored.attempts += 1;
        let attempt = monitored.attempts;
        let delay = backoff_delay(&self.config, attempt);
        monitored.phase = ReconnectPhase::Scheduled;
        tracing::info!(
            server_id = %server_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Health: 已排期重连"
        );

        let weak = Arc::downgrade(self);
        let server_id = server_id.to_string();
        monitored.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut servers = inner.servers.lock();
                match servers.get_mut(&server_id) {
                    Some(m) if m.phase == ReconnectPhase::Scheduled => {
                        m.phase = ReconnectPhase::Attempting;
                    }
                    _ => return,
                }
            }
            if let Err(e) = inner.attempt_reconnect(&server_id, attempt).await {
                tracing::debug!(server_id = %server_id, "Health: 第 {} 次重连失败: {}", attempt, e);
            }
        }));
    }

    /// 执行一次重连；调用前阶段已置为 Attempting
    async fn attempt_reconnect(self: &Arc<Self>, server_id: &str, attempt: u32) -> Result<()> {
        let Some(client) = self.registry.get_client(server_id) else {
            return Err(McpError::ServerNotFound(server_id.to_string()).into());
        };

        self.events.emit(ConnectionEvent::Reconnecting {
            server_id: server_id.to_string(),
            attempt,
        });
        self.persist(server_id, ConnectionStatus::Connecting, None).await;

        let outcome = client.connect().await;
        match &outcome {
            Ok(()) => {
                self.persist(server_id, ConnectionStatus::Connected, None).await;
                let mut servers = self.servers.lock();
                if let Some(monitored) = servers.get_mut(server_id) {
                    monitored.attempts = 0;
                    monitored.is_healthy = true;
                    monitored.phase = ReconnectPhase::Idle;
                    monitored.reconnect_task = None;
                }
                drop(servers);
                tracing::info!(server_id = %server_id, attempt, "Health: 重连成功");
                self.events.emit(ConnectionEvent::Reconnected {
                    server_id: server_id.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(server_id = %server_id, attempt, "Health: 重连失败: {}", e);
                self.persist(server_id, ConnectionStatus::Error, Some(e.to_string()))
                    .await;
                let mut servers = self.servers.lock();
                // 已停止监控则不再排期
                if let Some(monitored) = servers.get_mut(server_id) {
                    monitored.is_healthy = false;
                    monitored.phase = ReconnectPhase::Idle;
                    self.schedule_reconnect(server_id, monitored);
                }
            }
        }
        outcome
    }

    async fn persist(&self, server_id: &str, status: ConnectionStatus, error: Option<String>) {
        match self.store.update_status(server_id, status, error).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(server_id = %server_id, "Health: 存储中无此服务端"),
            Err(e) => tracing::warn!(server_id = %server_id, "Health: 持久化状态失败: {}", e),
        }
    }
}
