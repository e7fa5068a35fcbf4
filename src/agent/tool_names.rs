//! 函数名缩写
//!
//! 函数调用接口要求函数名不超过 32 个字符，且只能含 `[A-Za-z0-9_-]`。
//! 每次 run 重建一张 `s{服务端前缀}_{序号}_{截断的工具名}` → `(serverId, toolName)` 的映射，
//! 序号全局唯一，因此短名两两不同。映射只在本次 run 内有效。

use std::collections::HashMap;

use crate::llm::types::ToolDefinition;
use crate::tools::AggregatedTool;

pub const MAX_FUNCTION_NAME_LEN: usize = 32;
const SERVER_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolTarget {
    pub server_id: String,
    pub tool_name: String,
}

impl ToolTarget {
    pub fn namespaced(&self) -> String {
        format!("{}:{}", self.server_id, self.tool_name)
    }
}

#[derive(Debug, Default)]
pub struct ToolNameMap {
    targets: HashMap<String, ToolTarget>,
    definitions: Vec<ToolDefinition>,
}

impl ToolNameMap {
    pub fn build(tools: &[AggregatedTool]) -> Self {
        let mut map = Self::default();
        for (index, tool) in tools.iter().enumerate() {
            let short = short_name(tool.server_id(), index, tool.name());
            let description = match tool.description() {
                "" => format!("[{}] {}", tool.tool.server_name, tool.name()),
                desc => format!("[{}] {}", tool.tool.server_name, desc),
            };
            map.definitions.push(ToolDefinition::function(
                short.clone(),
                description,
                tool.tool.input_schema.to_value(),
            ));
            map.targets.insert(
                short,
                ToolTarget {
                    server_id: tool.server_id().to_string(),
                    tool_name: tool.name().to_string(),
                },
            );
        }
        map
    }

    pub fn resolve(&self, short: &str) -> Option<&ToolTarget> {
        self.targets.get(short)
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn short_name(server_id: &str, index: usize, tool_name: &str) -> String {
    let prefix: String = server_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(SERVER_PREFIX_LEN)
        .collect::<String>()
        .to_lowercase();
    let head = format!("s{}_{}_", prefix, index);
    let budget = MAX_FUNCTION_NAME_LEN.saturating_sub(head.len());
    let tail: String = tool_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(budget)
        .collect();
    format!("{}{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::{Tool, ToolInputSchema};
    use std::collections::HashSet;

    fn tool(server_id: &str, name: &str) -> AggregatedTool {
        let tool = Tool {
            name: name.to_string(),
            description: None,
            input_schema: ToolInputSchema::default(),
            server_id: server_id.to_string(),
            server_name: server_id.to_uppercase(),
        };
        AggregatedTool {
            namespaced_name: tool.namespaced_name(),
            tool,
        }
    }

    #[test]
    fn test_short_names_are_bounded_distinct_and_resolvable() {
        let tools = vec![
            tool("3f2a9c1e-uuid-server", "search_contacts_by_company_domain_and_region"),
            tool("3f2a9c1e-uuid-server", "search_contacts_by_company_domain_and_owner"),
            tool("3f2a-other", "search_contacts_by_company_domain_and_region"),
            tool("cal", "list.events/today"),
        ];
        let map = ToolNameMap::build(&tools);
        assert_eq!(map.len(), 4);

        let names: Vec<_> = map
            .definitions()
            .iter()
            .map(|d| d.function.name.clone())
            .collect();
        assert_eq!(names.iter().collect::<HashSet<_>>().len(), 4);
        for (name, original) in names.iter().zip(&tools) {
            assert!(name.len() <= MAX_FUNCTION_NAME_LEN, "{name}");
            assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
            let target = map.resolve(name).unwrap();
            assert_eq!(target.namespaced(), original.namespaced_name);
        }
        assert_eq!(names[0], "s3f2a_0_search_contacts_by_compa");
        assert_eq!(names[3], "scal_3_list_events_today");
    }

    #[test]
    fn test_definitions_carry_server_name() {
        let map = ToolNameMap::build(&[tool("crm", "lookup")]);
        let def = &map.definitions()[0];
        assert_eq!(def.function.description, "[CRM] lookup");
        assert_eq!(def.function.parameters["type"], "object");
        assert!(map.resolve("lookup").is_none());
    }
}
