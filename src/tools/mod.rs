//! 工具聚合
//!
//! [`ToolAggregator`] 是注册表之上的只读视图：为每个已连接服务端的工具加上
//! `serverId:toolName` 命名空间，提供子串 / 正则搜索，以及按意图类别的关键词过滤。
//! 意图类别只是启发式的便利层，调用方随时可以绕过它直接按命名空间查找。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::RegexBuilder;
use serde::Serialize;

use crate::error::{Result, ToolError};
use crate::mcp::registry::ConnectionRegistry;
use crate::mcp::types::Tool;

/// 带命名空间的工具
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedTool {
    pub namespaced_name: String,
    #[serde(flatten)]
    pub tool: Tool,
}

impl AggregatedTool {
    fn new(tool: Tool) -> Self {
        Self {
            namespaced_name: tool.namespaced_name(),
            tool,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.tool.server_id
    }

    pub fn name(&self) -> &str {
        &self.tool.name
    }

    pub fn description(&self) -> &str {
        self.tool.description.as_deref().unwrap_or("")
    }

    /// name + description，小写
    fn haystack(&self) -> String {
        format!("{} {}", self.tool.name, self.description()).to_lowercase()
    }

    fn matches_any(&self, keywords: &[&str]) -> bool {
        let haystack = self.haystack();
        keywords
            .iter()
            .any(|k| haystack.contains(&k.to_lowercase()))
    }
}

// ── 意图类别 ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolIntent {
    Crm,
    Search,
    Calendar,
    Docs,
    Memory,
}

impl ToolIntent {
    pub const ALL: [ToolIntent; 5] = [
        ToolIntent::Crm,
        ToolIntent::Search,
        ToolIntent::Calendar,
        ToolIntent::Docs,
        ToolIntent::Memory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolIntent::Crm => "crm",
            ToolIntent::Search => "search",
            ToolIntent::Calendar => "calendar",
            ToolIntent::Docs => "docs",
            ToolIntent::Memory => "memory",
        }
    }

    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            ToolIntent::Crm => &[
                "crm", "contact", "customer", "account", "lead", "deal", "company", "salesforce",
                "hubspot",
            ],
            ToolIntent::Search => &["search", "find", "lookup", "query", "web"],
            ToolIntent::Calendar => &["calendar", "event", "meeting", "schedule", "availability"],
            ToolIntent::Docs => &["doc", "document", "file", "page", "wiki", "notion", "drive"],
            ToolIntent::Memory => &["memory", "note", "remember", "recall"],
        }
    }
}

impl fmt::Display for ToolIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolIntent {
    type Err = ToolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ToolIntent::ALL
            .into_iter()
            .find(|i| i.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ToolError::NotFound(format!("未知意图类别: {}", s)))
    }
}

// ── 聚合器 ───────────────────────────────────────────────────────────────────

pub struct ToolAggregator {
    registry: Arc<ConnectionRegistry>,
}

impl ToolAggregator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// 所有已连接服务端的工具（按服务端 ID 排序，服务端内保持发现顺序）
    pub fn get_all_tools(&self) -> Vec<AggregatedTool> {
        self.registry
            .get_all_tools()
            .into_iter()
            .map(AggregatedTool::new)
            .collect()
    }

    pub fn get_tools_by_server(&self, server_id: &str) -> Vec<AggregatedTool> {
        self.get_all_tools()
            .into_iter()
            .filter(|t| t.server_id() == server_id)
            .collect()
    }

    /// 按 `serverId:toolName` 精确查找
    pub fn get_tool(&self, namespaced: &str) -> Option<AggregatedTool> {
        self.get_all_tools()
            .into_iter()
            .find(|t| t.namespaced_name == namespaced)
    }

    /// 大小写不敏感的子串匹配（name + description）
    pub fn search_tools(&self, query: &str) -> Vec<AggregatedTool> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.get_all_tools();
        }
        self.get_all_tools()
            .into_iter()
            .filter(|t| t.haystack().contains(&query))
            .collect()
    }

    /// 大小写不敏感的正则匹配（name + description）
    pub fn find_tools_by_pattern(&self, pattern: &str) -> Result<Vec<AggregatedTool>> {
        let re = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(self
            .get_all_tools()
            .into_iter()
            .filter(|t| re.is_match(&t.tool.name) || re.is_match(t.description()))
            .collect())
    }

    pub fn get_tools_for_intent(&self, intent: ToolIntent) -> Vec<AggregatedTool> {
        let keywords = intent.keywords();
        self.get_all_tools()
            .into_iter()
            .filter(|t| t.matches_any(keywords))
            .collect()
    }

    /// 第一个 name / description 命中任一关键词的工具
    pub fn find_first_by_keywords(&self, keywords: &[&str]) -> Option<AggregatedTool> {
        if keywords.is_empty() {
            return None;
        }
        self.get_all_tools()
            .into_iter()
            .find(|t| t.matches_any(keywords))
    }

    /// 供 LLM 提示词使用的工具清单，每行一个
    pub fn tools_summary(&self) -> String {
        let tools = self.get_all_tools();
        if tools.is_empty() {
            return "(no tools available)".to_string();
        }
        tools
            .iter()
            .map(|t| {
                let desc = t.description();
                if desc.is_empty() {
                    format!("- {}", t.namespaced_name)
                } else {
                    format!("- {}: {}", t.namespaced_name, desc)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.registry.get_all_tools().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CopilotError;
    use crate::mcp::ServerConfig;
    use crate::testing::{MockToolServer, MockTransportFactory};

    async fn aggregator() -> ToolAggregator {
        let factory = MockTransportFactory::new();
        factory.add_server(
            "node crm.js",
            MockToolServer::new()
                .with_tool("search_contacts", "Search CRM contacts by name or company")
                .with_tool("create_note", "Attach a note to a deal"),
        );
        factory.add_server(
            "https://cal.example/mcp",
            MockToolServer::new()
                .with_tool("list_events", "List upcoming calendar events")
                .with_tool("search_contacts", "Search meeting attendees"),
        );
        factory.add_server(
            "node docs.js",
            MockToolServer::new().with_tool("read_page", "Read a wiki page"),
        );
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(factory)));
        registry
            .register(ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]))
            .connect()
            .await
            .unwrap();
        registry
            .register(ServerConfig::http("cal", "Calendar", "https://cal.example/mcp"))
            .connect()
            .await
            .unwrap();
        // 注册但未连接：不应出现在任何结果中
        registry.register(ServerConfig::stdio("docs", "Docs", "node", vec!["docs.js"]));
        ToolAggregator::new(registry)
    }

    #[tokio::test]
    async fn test_namespaced_names_disambiguate() {
        let agg = aggregator().await;
        let names: Vec<_> = agg
            .get_all_tools()
            .into_iter()
            .map(|t| t.namespaced_name)
            .collect();
        assert_eq!(
            names,
            vec![
                "cal:list_events",
                "cal:search_contacts",
                "crm:search_contacts",
                "crm:create_note",
            ]
        );
        assert_eq!(agg.get_tools_by_server("crm").len(), 2);
        assert!(agg.get_tools_by_server("docs").is_empty());
        assert_eq!(
            agg.get_tool("crm:search_contacts").unwrap().description(),
            "Search CRM contacts by name or company"
        );
        assert!(agg.get_tool("docs:read_page").is_none());
    }

    #[tokio::test]
    async fn test_search_and_pattern_are_case_insensitive() {
        let agg = aggregator().await;
        assert_eq!(agg.search_tools("CALENDAR").len(), 1);
        assert_eq!(agg.search_tools("search").len(), 2);
        assert_eq!(agg.search_tools("  ").len(), 4);

        let matched = agg.find_tools_by_pattern("^(LIST|create)_").unwrap();
        assert_eq!(matched.len(), 2);

        let err = agg.find_tools_by_pattern("(unclosed").unwrap_err();
        assert!(matches!(err, CopilotError::Tool(ToolError::InvalidPattern(_))));
    }

    #[tokio::test]
    async fn test_intent_filters() {
        let agg = aggregator().await;
        let crm: Vec<_> = agg
            .get_tools_for_intent(ToolIntent::Crm)
            .into_iter()
            .map(|t| t.namespaced_name)
            .collect();
        // "Search meeting attendees" 的工具名含 contact，同样命中
        assert_eq!(
            crm,
            vec!["cal:search_contacts", "crm:search_contacts", "crm:create_note"]
        );
        assert_eq!(agg.get_tools_for_intent(ToolIntent::Calendar).len(), 2);
        assert!(agg.get_tools_for_intent(ToolIntent::Docs).is_empty());

        let first = agg.find_first_by_keywords(&["note"]).unwrap();
        assert_eq!(first.namespaced_name, "crm:create_note");
        assert!(agg.find_first_by_keywords(&[]).is_none());

        assert_eq!("CRM".parse::<ToolIntent>().unwrap(), ToolIntent::Crm);
        assert!("weather".parse::<ToolIntent>().is_err());
    }

    #[tokio::test]
    async fn test_summary_lists_connected_tools() {
        let agg = aggregator().await;
        let summary = agg.tools_summary();
        assert_eq!(summary.lines().count(), 4);
        assert!(summary.contains("- crm:create_note: Attach a note to a deal"));

        let empty = ToolAggregator::new(Arc::new(ConnectionRegistry::new(Arc::new(
            MockTransportFactory::new(),
        ))));
        assert!(empty.is_empty());
        assert_eq!(empty.tools_summary(), "(no tools available)");
    }
}
