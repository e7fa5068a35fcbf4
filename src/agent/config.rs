//! Agent 配置

use serde::{Deserialize, Serialize};

/// 默认触发词：命中任一才值得花一次 LLM 往返
pub const DEFAULT_TRIGGER_KEYWORDS: &[&str] = &[
    "account",
    "availability",
    "calendar",
    "contact",
    "contract",
    "customer",
    "deal",
    "document",
    "email",
    "find",
    "follow up",
    "look up",
    "lookup",
    "meeting",
    "price",
    "pricing",
    "proposal",
    "remember",
    "schedule",
    "search",
    "what is",
    "who is",
];

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a real-time assistant listening to a live call. \
When the latest utterances ask for facts that the available tools can provide, call the tools \
and then answer in one or two short sentences the user can glance at during the call. \
If no tool is relevant, answer briefly from the conversation itself.";

/// Agent 运行时配置
///
/// 可从 YAML 反序列化（缺省字段取默认值），也可通过链式调用设置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 单次 run 内 LLM 往返上限
    pub max_tool_calls: usize,
    /// 对话历史上限（条）
    pub max_history: usize,
    /// 裁剪时保留的开头条数（system / 首轮上下文）
    pub preserved_head: usize,
    /// 每次 run 携带的最近转写片段数
    pub context_segments: usize,
    /// 与默认触发词取并集
    pub custom_keywords: Vec<String>,
    /// 相同工具 + 相同参数的重复调用抑制窗口
    pub tool_cooldown_ms: u64,
    pub system_prompt: String,
    pub temperature: Option<f32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 5,
            max_history: 20,
            preserved_head: 2,
            context_segments: 10,
            custom_keywords: Vec::new(),
            tool_cooldown_ms: 30_000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: None,
        }
    }
}

impl AgentConfig {
    pub fn max_tool_calls(mut self, max_tool_calls: usize) -> Self {
        self.max_tool_calls = max_tool_calls;
        self
    }

    pub fn max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn preserved_head(mut self, preserved_head: usize) -> Self {
        self.preserved_head = preserved_head;
        self
    }

    pub fn context_segments(mut self, context_segments: usize) -> Self {
        self.context_segments = context_segments;
        self
    }

    pub fn custom_keywords(mut self, keywords: Vec<String>) -> Self {
        self.custom_keywords = keywords;
        self
    }

    pub fn tool_cooldown_ms(mut self, tool_cooldown_ms: u64) -> Self {
        self.tool_cooldown_ms = tool_cooldown_ms;
        self
    }

    pub fn system_prompt(mut self, system_prompt: &str) -> Self {
        self.system_prompt = system_prompt.to_string();
        self
    }

    /// 默认触发词 ∪ 自定义触发词，小写去重
    pub fn trigger_keywords(&self) -> Vec<String> {
        let mut keywords: Vec<String> = DEFAULT_TRIGGER_KEYWORDS
            .iter()
            .map(|k| k.to_string())
            .chain(
                self.custom_keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty()),
            )
            .collect();
        keywords.sort();
        keywords.dedup();
        keywords
    }
}
