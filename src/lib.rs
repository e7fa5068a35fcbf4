//! call-copilot：通话期间的 MCP 工具助手
//!
//! 管理多个 MCP 工具服务端的连接（健康检查、指数退避重连），聚合其工具目录，
//! 并根据实时通话转写驱动一个有界的 LLM 工具调用循环。
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use call_copilot::prelude::*;
//!
//! # async fn example() -> call_copilot::error::Result<()> {
//! let store = Arc::new(FileStore::new("~/.call-copilot/servers.json")?);
//! let orchestrator = Arc::new(ConnectionOrchestrator::new(
//!     store,
//!     Arc::new(DefaultTransportFactory::new()),
//!     HealthConfig::default(),
//! ));
//! orchestrator.initialize().await?;
//!
//! let aggregator = Arc::new(ToolAggregator::new(orchestrator.registry().clone()));
//! let llm = Arc::new(DefaultLlmClient::from_env("gpt-4o")?);
//! let agent = CallAgent::new(llm, aggregator, orchestrator.clone(), AgentConfig::default());
//!
//! let segments = vec![TranscriptSegment::them("who is our contact at Acme Corp?")];
//! if let Some(result) = agent.handle_utterance(&segments).await {
//!     println!("{:?}", result.response);
//! }
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod intent;
pub mod llm;
pub mod mcp;
pub mod orchestrator;
pub mod store;
pub mod testing;
pub mod tools;
pub mod transcript;
mod util;

pub mod prelude {
    pub use crate::agent::{AgentConfig, AgentOutcome, AgentRunResult, CallAgent};
    pub use crate::config::CopilotConfig;
    pub use crate::error::{CopilotError, Result};
    pub use crate::events::ConnectionEvent;
    pub use crate::intent::{DetectionMode, IntentDetection, IntentDetector};
    pub use crate::llm::{DefaultLlmClient, LlmClient};
    pub use crate::mcp::{
        ConnectionStatus, DefaultTransportFactory, HealthConfig, NewServer, ServerConfig,
        ServerUpdate, Tool, ToolCallResult, TransportConfig,
    };
    pub use crate::orchestrator::{ConnectionOrchestrator, ToolExecutor};
    pub use crate::store::{FileStore, InMemoryStore, ServerStore};
    pub use crate::tools::{AggregatedTool, ToolAggregator, ToolIntent};
    pub use crate::transcript::{Channel, TranscriptSegment};
}
