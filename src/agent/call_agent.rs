use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::agent::config::AgentConfig;
use crate::agent::conversation::Conversation;
use crate::agent::tool_names::{ToolNameMap, ToolTarget};
use crate::llm::LlmClient;
use crate::llm::types::{Message, ToolCall};
use crate::orchestrator::ToolExecutor;
use crate::tools::ToolAggregator;
use crate::transcript::{TranscriptSegment, format_segments, recent};

/// 一次 run 的结局
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum AgentOutcome {
    /// 模型给出了最终文本
    Completed,
    /// 迭代预算耗尽时仍在调用工具
    PartialSuccess,
    /// 模型既没有文本也没有工具调用
    EmptyResponse,
    /// 没有已连接的工具，未调用 LLM
    NoTools,
    /// 另一个 run 正在进行，本次被丢弃
    Busy,
    /// LLM 调用失败，本次 run 追加的消息已回滚
    Failed(String),
}

/// 一次实际执行的工具调用
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRunResult {
    pub success: bool,
    pub response: Option<String>,
    pub tools_called: Vec<ToolInvocation>,
    pub outcome: AgentOutcome,
    /// 本次 run 的 LLM 往返次数
    pub iterations: usize,
}

impl AgentRunResult {
    fn skipped(outcome: AgentOutcome) -> Self {
        Self {
            success: false,
            response: None,
            tools_called: Vec::new(),
            outcome,
            iterations: 0,
        }
    }
}

struct AgentState {
    conversation: Conversation,
    /// `serverId:toolName|参数` → 冷却截止时刻
    tool_cooldowns: HashMap<String, Instant>,
}

/// 通话期间的工具调用 Agent
///
/// 对话历史在同一通通话的多次 run 之间保留；每通新通话开始时调用
/// [`reset_conversation`](CallAgent::reset_conversation)。
/// 同一时刻只允许一个 run，正在运行时到达的新 run 直接返回 [`AgentOutcome::Busy`]。
pub struct CallAgent {
    llm: Arc<dyn LlmClient>,
    aggregator: Arc<ToolAggregator>,
    executor: Arc<dyn ToolExecutor>,
    config: AgentConfig,
    trigger_keywords: Vec<String>,
    state: Mutex<AgentState>,
}

impl CallAgent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        aggregator: Arc<ToolAggregator>,
        executor: Arc<dyn ToolExecutor>,
        config: AgentConfig,
    ) -> Self {
        let state = AgentState {
            conversation: Conversation::new(config.max_history, config.preserved_head),
            tool_cooldowns: HashMap::new(),
        };
        Self {
            llm,
            aggregator,
            executor,
            trigger_keywords: config.trigger_keywords(),
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// 轻量关键词门控，决定这句话是否值得一次 LLM 往返
    pub fn should_trigger(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.trigger_keywords.iter().any(|k| text.contains(k.as_str()))
    }

    /// 最后一条片段通过门控时执行 run，否则返回 `None`
    pub async fn handle_utterance(&self, segments: &[TranscriptSegment]) -> Option<AgentRunResult> {
        let latest = segments.last()?;
        if !self.should_trigger(&latest.text) {
            return None;
        }
        Some(self.run(segments).await)
    }

    /// 新通话开始：清空历史与工具冷却（等待进行中的 run 结束）
    pub async fn reset_conversation(&self) {
        let mut state = self.state.lock().await;
        state.conversation.clear();
        state.tool_cooldowns.clear();
        tracing::info!("CallAgent: 对话已重置");
    }

    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.conversation.messages().to_vec()
    }

    pub async fn run(&self, segments: &[TranscriptSegment]) -> AgentRunResult {
        let Ok(mut state) = self.state.try_lock() else {
            tracing::info!("CallAgent: 已有 run 在进行，丢弃本次请求");
            return AgentRunResult::skipped(AgentOutcome::Busy);
        };

        let tools = self.aggregator.get_all_tools();
        if tools.is_empty() {
            tracing::warn!("CallAgent: 没有已连接的工具");
            return AgentRunResult::skipped(AgentOutcome::NoTools);
        }
        let names = ToolNameMap::build(&tools);
        let definitions = names.definitions().to_vec();

        let checkpoint = state.conversation.messages().to_vec();
        if state.conversation.is_empty() {
            state
                .conversation
                .push(Message::system(self.config.system_prompt.clone()));
        }
        let window = recent(segments, self.config.context_segments);
        state.conversation.push(Message::user(format!(
            "Latest call transcript:\n{}",
            format_segments(window)
        )));

        let mut tools_called = Vec::new();
        for iteration in 1..=self.config.max_tool_calls {
            // 每轮发送前裁剪，run 内部同样受 max_history 约束
            state.conversation.trim();
            tracing::debug!(iteration, tools = definitions.len(), "CallAgent: 调用 LLM");
            let response = match self
                .llm
                .chat_with_tools(state.conversation.messages().to_vec(), definitions.clone())
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    state.conversation.restore(checkpoint);
                    tracing::warn!(iteration, "CallAgent: LLM 调用失败，回滚本次对话: {}", e);
                    return AgentRunResult {
                        success: false,
                        response: None,
                        tools_called,
                        outcome: AgentOutcome::Failed(e.to_string()),
                        iterations: iteration,
                    };
                }
            };

            if !response.tool_calls.is_empty() {
                let mut assistant = Message::assistant_with_tools(response.tool_calls.clone());
                assistant.content = response.text_content().map(str::to_string);
                state.conversation.push(assistant);

                for call in &response.tool_calls {
                    let (message, invocation) = self.invoke(&mut state, &names, call).await;
                    state.conversation.push(message);
                    tools_called.extend(invocation);
                }
                continue;
            }

            let outcome = match response.text_content() {
                Some(text) => {
                    state.conversation.push(Message::assistant(text));
                    tracing::info!(
                        iteration,
                        tools = tools_called.len(),
                        "CallAgent: 得到最终回复"
                    );
                    AgentRunResult {
                        success: true,
                        response: Some(text.to_string()),
                        tools_called,
                        outcome: AgentOutcome::Completed,
                        iterations: iteration,
                    }
                }
                None => {
                    tracing::warn!(iteration, "CallAgent: 模型返回空响应");
                    AgentRunResult {
                        success: false,
                        response: None,
                        tools_called,
                        outcome: AgentOutcome::EmptyResponse,
                        iterations: iteration,
                    }
                }
            };
            state.conversation.trim();
            return outcome;
        }

        state.conversation.trim();
        tracing::info!(
            max = self.config.max_tool_calls,
            tools = tools_called.len(),
            "CallAgent: 迭代预算耗尽"
        );
        AgentRunResult {
            success: tools_called.iter().any(|t| t.success),
            response: None,
            tools_called,
            outcome: AgentOutcome::PartialSuccess,
            iterations: self.config.max_tool_calls,
        }
    }

    /// 执行单个工具调用，返回要追加的 tool 消息及（实际执行时的）调用记录
    async fn invoke(
        &self,
        state: &mut AgentState,
        names: &ToolNameMap,
        call: &ToolCall,
    ) -> (Message, Option<ToolInvocation>) {
        let short = call.function.name.as_str();
        let Some(ToolTarget {
            server_id,
            tool_name,
        }) = names.resolve(short).cloned()
        else {
            tracing::warn!(function = %short, "CallAgent: 模型请求了未知函数");
            let content = json!({ "error": format!("unknown function '{}'", short) });
            return (Message::tool_result(&call.id, short, content.to_string()), None);
        };

        let arguments = parse_arguments(&call.function.arguments, short);
        let key = format!("{}:{}|{}", server_id, tool_name, arguments);
        let now = Instant::now();
        if state.tool_cooldowns.get(&key).is_some_and(|until| *until > now) {
            tracing::info!(tool = %tool_name, "CallAgent: 相同调用处于冷却期，跳过");
            let content = json!({
                "skipped": true,
                "note": "This exact call was made moments ago; reuse the earlier result."
            });
            return (Message::tool_result(&call.id, short, content.to_string()), None);
        }

        tracing::info!(server_id = %server_id, tool = %tool_name, "CallAgent: 调用工具");
        let (success, output) = match self
            .executor
            .execute_tool(&server_id, &tool_name, arguments.clone())
            .await
        {
            Ok(result) => (result.is_success(), result.to_content_string()),
            Err(e) => {
                tracing::warn!(tool = %tool_name, "CallAgent: 工具不可用: {}", e);
                (false, json!({ "error": e.to_string() }).to_string())
            }
        };
        if success {
            state.tool_cooldowns.insert(
                key,
                now + Duration::from_millis(self.config.tool_cooldown_ms),
            );
        }

        let message = Message::tool_result(&call.id, short, output.clone());
        let invocation = ToolInvocation {
            server_id,
            tool_name,
            arguments,
            success,
            output,
        };
        (message, Some(invocation))
    }
}

/// 参数解析失败或不是 object 时按空输入处理
fn parse_arguments(raw: &str, function: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            tracing::warn!(function = %function, "CallAgent: 参数不是 object，按空输入处理: {}", other);
            json!({})
        }
        Err(e) => {
            tracing::warn!(function = %function, "CallAgent: 参数 JSON 不合法，按空输入处理: {}", e);
            json!({})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, Result};
    use crate::llm::types::{ChatResponse, ToolDefinition};
    use crate::mcp::ServerConfig;
    use crate::mcp::health::HealthConfig;
    use crate::orchestrator::ConnectionOrchestrator;
    use crate::store::InMemoryStore;
    use crate::testing::{MockLlmClient, MockToolServer, MockTransportFactory};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    const CRM_KEY: &str = "node crm.js";

    struct Harness {
        orchestrator: Arc<ConnectionOrchestrator>,
        aggregator: Arc<ToolAggregator>,
        factory: MockTransportFactory,
    }

    impl Harness {
        async fn new() -> Self {
            let factory = MockTransportFactory::new();
            factory.add_server(
                CRM_KEY,
                MockToolServer::new()
                    .with_tool("search_contacts", "Search CRM contacts")
                    .with_response(
                        "search_contacts",
                        json!({"contacts": [{"name": "Jane Doe", "title": "VP Sales"}]}),
                    ),
            );
            let store = InMemoryStore::with_servers([ServerConfig::stdio(
                "crm",
                "CRM",
                "node",
                vec!["crm.js"],
            )
            .with_auto_connect(true)]);
            let orchestrator = Arc::new(ConnectionOrchestrator::new(
                Arc::new(store),
                Arc::new(factory.clone()),
                HealthConfig::default(),
            ));
            orchestrator.initialize().await.unwrap();
            let aggregator = Arc::new(ToolAggregator::new(orchestrator.registry().clone()));
            Self {
                orchestrator,
                aggregator,
                factory,
            }
        }

        fn agent(&self, llm: Arc<dyn LlmClient>, config: AgentConfig) -> CallAgent {
            CallAgent::new(
                llm,
                self.aggregator.clone(),
                self.orchestrator.clone(),
                config,
            )
        }
    }

    fn segments() -> Vec<TranscriptSegment> {
        vec![
            TranscriptSegment::me("thanks for joining"),
            TranscriptSegment::them("who is the contact at Acme?"),
        ]
    }

    #[tokio::test]
    async fn test_tool_call_then_text() {
        let h = Harness::new().await;
        let llm = Arc::new(
            MockLlmClient::new()
                .with_tool_call("search_contacts", json!({"query": "Acme"}))
                .with_response("Jane Doe is the VP Sales at Acme."),
        );
        let agent = h.agent(llm.clone(), AgentConfig::default());

        let result = agent.run(&segments()).await;
        assert!(result.success);
        assert_eq!(result.outcome, AgentOutcome::Completed);
        assert_eq!(result.response.as_deref(), Some("Jane Doe is the VP Sales at Acme."));
        assert_eq!(result.tools_called.len(), 1);
        assert_eq!(result.tools_called[0].tool_name, "search_contacts");
        assert!(result.tools_called[0].output.contains("VP Sales"));
        assert_eq!(result.iterations, 2);

        assert_eq!(h.factory.calls(CRM_KEY), vec![("search_contacts".to_string(), json!({"query": "Acme"}))]);
        let roles: Vec<_> = agent.history().await.into_iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "assistant"]);

        let tools = llm.last_tools().unwrap();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].function.name.len() <= 32);
    }

    #[tokio::test]
    async fn test_llm_error_rolls_back_run() {
        let h = Harness::new().await;
        let llm = Arc::new(
            MockLlmClient::new()
                .with_response("first answer")
                .with_tool_call("search_contacts", json!({"query": "Globex"}))
                .with_network_error("connection reset"),
        );
        let agent = h.agent(llm, AgentConfig::default());

        assert!(agent.run(&segments()).await.success);
        let before = agent.history().await;

        let result = agent.run(&segments()).await;
        assert!(!result.success);
        assert!(matches!(result.outcome, AgentOutcome::Failed(_)));
        assert_eq!(result.tools_called.len(), 1);
        assert_eq!(agent.history().await, before);
        // 连接不受影响
        assert_eq!(h.aggregator.len(), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_partial_success() {
        let h = Harness::new().await;
        let mut mock = MockLlmClient::new();
        for i in 0..6 {
            mock = mock.with_tool_call("search_contacts", json!({"query": format!("q{i}")}));
        }
        let llm = Arc::new(mock);
        let agent = h.agent(llm.clone(), AgentConfig::default().max_tool_calls(3));

        let result = agent.run(&segments()).await;
        assert!(result.success);
        assert_eq!(result.outcome, AgentOutcome::PartialSuccess);
        assert_eq!(result.response, None);
        assert_eq!(result.tools_called.len(), 3);
        assert_eq!(llm.call_count(), 3);
        assert_eq!(llm.remaining(), 3);
    }

    #[tokio::test]
    async fn test_empty_response() {
        let h = Harness::new().await;
        let agent = h.agent(Arc::new(MockLlmClient::new().with_empty()), AgentConfig::default());
        let result = agent.run(&segments()).await;
        assert!(!result.success);
        assert_eq!(result.outcome, AgentOutcome::EmptyResponse);
    }

    #[tokio::test]
    async fn test_identical_call_within_cooldown_is_not_repeated() {
        let h = Harness::new().await;
        let llm = Arc::new(
            MockLlmClient::new()
                .with_tool_calls(vec![
                    ("search_contacts", json!({"query": "Acme"})),
                    ("search_contacts", json!({"query": "Acme"})),
                ])
                .with_response("done"),
        );
        let agent = h.agent(llm, AgentConfig::default());

        let result = agent.run(&segments()).await;
        assert!(result.success);
        assert_eq!(result.tools_called.len(), 1);
        assert_eq!(h.factory.calls(CRM_KEY).len(), 1);
        let history = agent.history().await;
        let skipped = history[4].content.as_deref().unwrap_or_default();
        assert!(skipped.contains("\"skipped\":true"));
    }

    #[tokio::test]
    async fn test_malformed_arguments_become_empty_input() {
        let h = Harness::new().await;
        let llm = Arc::new(
            MockLlmClient::new()
                .with_raw_tool_call("search_contacts", "{\"query\": Acme")
                .with_response("no match"),
        );
        let agent = h.agent(llm, AgentConfig::default());

        let result = agent.run(&segments()).await;
        assert!(result.success);
        assert_eq!(result.tools_called[0].arguments, json!({}));
        assert_eq!(h.factory.calls(CRM_KEY)[0].1, json!({}));
    }

    #[tokio::test]
    async fn test_unknown_function_is_reported_to_model() {
        let h = Harness::new().await;
        let llm = Arc::new(
            MockLlmClient::new()
                .with_tool_call("no_such_function", json!({}))
                .with_response("sorry"),
        );
        let agent = h.agent(llm.clone(), AgentConfig::default());

        let result = agent.run(&segments()).await;
        assert!(result.success);
        assert!(result.tools_called.is_empty());
        let sent = llm.last_messages().unwrap();
        let last = sent.last().unwrap();
        assert!(last.is_role("tool"));
        assert!(last.content.as_deref().unwrap_or_default().contains("unknown function"));
    }

    #[tokio::test]
    async fn test_no_tools_skips_llm() {
        let h = Harness::new().await;
        h.orchestrator.disconnect("crm").await.unwrap();
        let llm = Arc::new(MockLlmClient::new().with_response("unused"));
        let agent = h.agent(llm.clone(), AgentConfig::default());

        let result = agent.run(&segments()).await;
        assert_eq!(result.outcome, AgentOutcome::NoTools);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_gating() {
        let h = Harness::new().await;
        let llm = Arc::new(MockLlmClient::new().with_response("ok"));
        let config = AgentConfig::default().custom_keywords(vec!["renewal".into()]);
        let agent = h.agent(llm.clone(), config);

        assert!(agent.should_trigger("When is the RENEWAL due?"));
        assert!(agent.should_trigger("can you look up their pricing"));
        assert!(!agent.should_trigger("sounds great, talk soon"));

        let quiet = [TranscriptSegment::them("sounds great, talk soon")];
        assert!(agent.handle_utterance(&quiet).await.is_none());
        assert!(agent.handle_utterance(&[]).await.is_none());
        assert_eq!(llm.call_count(), 0);

        let result = agent.handle_utterance(&segments()).await.unwrap();
        assert_eq!(result.outcome, AgentOutcome::Completed);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_reset() {
        let h = Harness::new().await;
        let mut mock = MockLlmClient::new();
        for i in 0..15 {
            mock = mock
                .with_tool_call("search_contacts", json!({"query": format!("n{i}")}))
                .with_response(format!("answer {i}"));
        }
        let agent = h.agent(Arc::new(mock), AgentConfig::default().max_history(8));

        for _ in 0..15 {
            assert!(agent.run(&segments()).await.success);
            let history = agent.history().await;
            assert!(history.len() <= 8);
            assert!(history[0].is_role("system"));
        }

        agent.reset_conversation().await;
        assert!(agent.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_history_stays_bounded_within_a_run() {
        let h = Harness::new().await;
        let mut mock = MockLlmClient::new();
        for i in 0..3 {
            mock = mock.with_tool_call("search_contacts", json!({"query": format!("q{i}")}));
        }
        let llm = Arc::new(mock.with_response("Jane Doe"));
        let agent = h.agent(llm.clone(), AgentConfig::default().max_history(4));

        let result = agent.run(&segments()).await;
        assert_eq!(result.outcome, AgentOutcome::Completed);
        assert_eq!(result.tools_called.len(), 3);

        let sent = llm.all_messages();
        assert_eq!(sent.len(), 4);
        for messages in &sent {
            assert!(messages.len() <= 4);
            assert!(messages[0].is_role("system"));
            assert!(messages.get(2).is_none_or(|m| !m.is_role("tool")));
        }
        // 最近一组 assistant/tool 调用完整保留
        let last = sent.last().unwrap();
        let roles: Vec<_> = last.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
        assert!(agent.history().await.len() <= 4);
    }

    /// 阻塞在第一次调用上，直到测试放行
    struct GatedLlm {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LlmClient for GatedLlm {
        async fn chat_simple(&self, _messages: Vec<Message>) -> Result<String> {
            Err(LlmError::EmptyResponse.into())
        }

        async fn chat_with_tools(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
        ) -> Result<ChatResponse> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(ChatResponse::text("finally"))
        }
    }

    #[tokio::test]
    async fn test_concurrent_run_is_dropped() {
        let h = Harness::new().await;
        let llm = Arc::new(GatedLlm {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let agent = Arc::new(h.agent(llm.clone(), AgentConfig::default()));

        let first = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(&segments()).await }
        });
        llm.entered.notified().await;

        let second = agent.run(&segments()).await;
        assert_eq!(second.outcome, AgentOutcome::Busy);

        llm.release.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.outcome, AgentOutcome::Completed);
        assert_eq!(agent.history().await.len(), 3);
    }
}
