//! MCP 连接层
//!
//! - [`client`]：单个服务端的连接客户端（传输建立、握手、工具发现与调用）
//! - [`registry`]：按服务端 ID 管理客户端，汇总状态与工具
//! - [`health`]：周期健康检查与指数退避重连
//! - [`transport`]：stdio / HTTP 传输实现
//!
//! ```rust,no_run
//! use call_copilot::mcp::{ConnectionRegistry, DefaultTransportFactory, ServerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> call_copilot::error::Result<()> {
//! let registry = ConnectionRegistry::new(Arc::new(DefaultTransportFactory::new()));
//! let client = registry.register(ServerConfig::stdio(
//!     "fs",
//!     "filesystem",
//!     "npx",
//!     vec!["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
//! ));
//! client.connect().await?;
//! println!("{} 个工具", registry.get_all_tools().len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod health;
pub mod registry;
pub mod server_config;
pub mod transport;
pub mod types;

pub use client::{ClientObserver, McpClient, ObserverId};
pub use health::{HealthConfig, HealthMonitor, HealthSnapshot, ReconnectPhase, backoff_delay};
pub use registry::{ConnectionRegistry, ConnectionSnapshot, parse_namespaced};
pub use server_config::{ConnectionStatus, NewServer, ServerConfig, ServerUpdate, TransportConfig};
pub use transport::{DefaultTransportFactory, McpTransport, TransportFactory};
pub use types::{Tool, ToolCallResult, ToolCallStatus, ToolInputSchema};
