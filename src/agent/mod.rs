//! 通话 Agent 循环
//!
//! [`CallAgent`] 把已连接工具以函数调用的形式交给 LLM，有界地循环
//! “调用 LLM → 执行请求的工具 → 回填结果”，直到得到最终文本或耗尽迭代预算。
//!
//! - [`tool_names`]：每次 run 重建的短函数名映射（≤ 32 字符）
//! - [`conversation`]：跨 run 保留、超长时掐头去尾保留的对话历史
//! - [`config`]：迭代预算、历史上限、触发词等配置

mod call_agent;
pub mod config;
pub mod conversation;
pub mod tool_names;

pub use call_agent::{AgentOutcome, AgentRunResult, CallAgent, ToolInvocation};
pub use config::{AgentConfig, DEFAULT_TRIGGER_KEYWORDS};
pub use conversation::Conversation;
pub use tool_names::{MAX_FUNCTION_NAME_LEN, ToolNameMap, ToolTarget};
