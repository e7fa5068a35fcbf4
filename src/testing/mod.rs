//! 测试基础设施
//!
//! 提供在不依赖真实 LLM / MCP 服务端的情况下测试 call-copilot 各组件的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockLlmClient`] | 替代真实 LLM，脚本化文本 / 工具调用 / 错误响应 |
//! | [`MockToolServer`] | 描述一个脚本化的 MCP 服务端：工具列表、逐次响应、连接失败 |
//! | [`MockTransportFactory`] | 按传输配置分发到 `MockToolServer`，记录连接 / 关闭 / 调用次数 |
//!
//! # 设计原则
//!
//! - **零网络请求**：所有 Mock 都完全在内存中运行，不启动子进程
//! - **可脚本化**：通过 `with_response()` / `with_tool_error()` 精确控制返回值
//! - **可观测**：通过 `call_count()` / `calls()` / `close_count()` 等方法检查调用情况
//! - **线程安全**：内部使用 `Arc<Mutex<_>>`，clone 后共享同一份状态

mod mock_llm;
mod mock_server;

pub use mock_llm::MockLlmClient;
pub use mock_server::{MockToolServer, MockTransportFactory};
