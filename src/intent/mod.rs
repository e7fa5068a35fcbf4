//! 意图检测
//!
//! 对每条新的通话发言判断是否值得调用工具。两条互斥的路径，按调用选择：
//!
//! - **Pattern**：有序的 `(正则, 意图, 工具关键词, 置信度)` 规则，第一条命中且不在冷却期、
//!   并且能解析出已连接工具的规则生效，随后该意图进入冷却；
//! - **Llm**：把最近的对话窗口与工具清单交给 LLM，要求返回 JSON 判定；
//!   任何失败（接口错误、JSON 不合法、工具不存在）都回退到 Pattern 路径。

mod extract;

pub use extract::extract_input;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::error::{LlmError, Result};
use crate::llm::LlmClient;
use crate::llm::types::Message;
use crate::tools::{ToolAggregator, ToolIntent};
use crate::transcript::{TranscriptSegment, format_segments, recent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// 同一意图两次触发之间的最小间隔
    pub cooldown_ms: u64,
    /// LLM 路径携带的最近片段数
    pub context_segments: usize,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 30_000,
            context_segments: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    #[default]
    Pattern,
    Llm,
}

/// 一条快速路径规则
#[derive(Debug, Clone)]
pub struct IntentRule {
    pub pattern: Regex,
    pub intent: String,
    pub tool_keywords: Vec<String>,
    pub confidence: f32,
}

impl IntentRule {
    /// 正则大小写不敏感
    pub fn new(
        pattern: &str,
        intent: impl Into<String>,
        tool_keywords: &[&str],
        confidence: f32,
    ) -> Result<Self> {
        Ok(Self {
            pattern: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            intent: intent.into(),
            tool_keywords: tool_keywords.iter().map(|k| k.to_string()).collect(),
            confidence,
        })
    }

    fn for_intent(pattern: &str, intent: ToolIntent, confidence: f32) -> Result<Self> {
        Self::new(pattern, intent.as_str(), intent.keywords(), confidence)
    }
}

/// 默认规则，顺序即优先级
pub fn default_rules() -> Result<Vec<IntentRule>> {
    Ok(vec![
        IntentRule::for_intent(
            r"\b(contacts?|customers?|clients?|accounts?|leads?|deals?|crm)\b",
            ToolIntent::Crm,
            0.8,
        )?,
        IntentRule::for_intent(
            r"\b(meeting|schedule|calendar|availability|available|book a time|next week)\b",
            ToolIntent::Calendar,
            0.75,
        )?,
        IntentRule::for_intent(
            r"\b(documents?|docs?|proposal|contract|pricing sheet|wiki)\b",
            ToolIntent::Docs,
            0.7,
        )?,
        IntentRule::for_intent(
            r"\b(remember|note that|last time|previous call)\b",
            ToolIntent::Memory,
            0.65,
        )?,
        IntentRule::for_intent(r"\b(search|look up|lookup|find)\b", ToolIntent::Search, 0.6)?,
    ])
}

/// 检测结果；`tool_name` 为 `serverId:toolName`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentDetection {
    pub detected: bool,
    pub intent: Option<String>,
    pub tool_name: Option<String>,
    pub confidence: f32,
    pub reason: String,
    pub suggested_input: Map<String, Value>,
}

impl IntentDetection {
    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            detected: false,
            intent: None,
            tool_name: None,
            confidence: 0.0,
            reason: reason.into(),
            suggested_input: Map::new(),
        }
    }
}

/// LLM 返回的判定
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmDecision {
    detected: bool,
    #[serde(default, alias = "tool_name")]
    tool_name: Option<String>,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reason: String,
    #[serde(default, alias = "suggested_input")]
    suggested_input: Option<Map<String, Value>>,
}

const LLM_SYSTEM_PROMPT: &str = "You watch a live sales call transcript and decide whether the latest \
utterance needs a tool call. Reply with one JSON object: \
{\"detected\": bool, \"toolName\": \"serverId:toolName\" or null, \"confidence\": 0..1, \
\"reason\": string, \"suggestedInput\": object}. Only use tools from this list:\n";

pub struct IntentDetector {
    rules: Vec<IntentRule>,
    aggregator: Arc<ToolAggregator>,
    llm: Option<Arc<dyn LlmClient>>,
    config: IntentConfig,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl IntentDetector {
    pub fn new(aggregator: Arc<ToolAggregator>, config: IntentConfig) -> Result<Self> {
        Ok(Self {
            rules: default_rules()?,
            aggregator,
            llm: None,
            config,
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_rules(mut self, rules: Vec<IntentRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }

    /// 对最近的片段做检测，最后一条视为当前发言
    pub async fn detect(
        &self,
        segments: &[TranscriptSegment],
        mode: DetectionMode,
    ) -> IntentDetection {
        let Some(latest) = segments.last() else {
            return IntentDetection::none("no utterance");
        };
        match (mode, &self.llm) {
            (DetectionMode::Pattern, _) => self.detect_pattern(&latest.text),
            (DetectionMode::Llm, None) => {
                tracing::warn!("IntentDetector: 未配置 LLM，使用规则匹配");
                self.detect_pattern(&latest.text)
            }
            (DetectionMode::Llm, Some(llm)) => match self.detect_llm(llm.as_ref(), segments).await {
                Ok(detection) => detection,
                Err(e) => {
                    tracing::warn!("IntentDetector: LLM 判定失败，回退到规则匹配: {}", e);
                    self.detect_pattern(&latest.text)
                }
            },
        }
    }

    /// 快速路径：按规则顺序匹配单条发言
    pub fn detect_pattern(&self, text: &str) -> IntentDetection {
        let now = Instant::now();
        for rule in &self.rules {
            if !rule.pattern.is_match(text) {
                continue;
            }
            if self.on_cooldown(&rule.intent, now) {
                tracing::debug!(intent = %rule.intent, "IntentDetector: 冷却中，跳过");
                continue;
            }
            let keywords: Vec<&str> = rule.tool_keywords.iter().map(String::as_str).collect();
            let Some(tool) = self.aggregator.find_first_by_keywords(&keywords) else {
                tracing::debug!(intent = %rule.intent, "IntentDetector: 没有匹配的已连接工具");
                continue;
            };

            self.cooldowns.lock().insert(
                rule.intent.clone(),
                now + Duration::from_millis(self.config.cooldown_ms),
            );
            tracing::info!(
                intent = %rule.intent,
                tool = %tool.namespaced_name,
                "IntentDetector: 规则命中"
            );
            return IntentDetection {
                detected: true,
                intent: Some(rule.intent.clone()),
                tool_name: Some(tool.namespaced_name),
                confidence: rule.confidence,
                reason: format!("matched {} pattern", rule.intent),
                suggested_input: extract_input(text),
            };
        }
        IntentDetection::none("no rule matched")
    }

    async fn detect_llm(
        &self,
        llm: &dyn LlmClient,
        segments: &[TranscriptSegment],
    ) -> Result<IntentDetection> {
        let window = recent(segments, self.config.context_segments);
        let messages = vec![
            Message::system(format!(
                "{}{}",
                LLM_SYSTEM_PROMPT,
                self.aggregator.tools_summary()
            )),
            Message::user(format_segments(window)),
        ];
        let raw = llm.chat_json(messages).await?;
        let decision: LlmDecision = serde_json::from_str(strip_code_fence(&raw))
            .map_err(|e| LlmError::InvalidResponse(format!("意图 JSON 解析失败: {}", e)))?;

        if !decision.detected {
            return Ok(IntentDetection {
                confidence: decision.confidence,
                ..IntentDetection::none(decision.reason)
            });
        }

        let wanted = decision
            .tool_name
            .ok_or_else(|| LlmError::InvalidResponse("detected 为 true 但缺少 toolName".into()))?;
        let tool = self
            .aggregator
            .get_tool(&wanted)
            .or_else(|| {
                self.aggregator
                    .get_all_tools()
                    .into_iter()
                    .find(|t| t.name() == wanted)
            })
            .ok_or_else(|| LlmError::InvalidResponse(format!("未知工具: {}", wanted)))?;

        tracing::info!(tool = %tool.namespaced_name, "IntentDetector: LLM 判定需要调用工具");
        Ok(IntentDetection {
            detected: true,
            intent: None,
            tool_name: Some(tool.namespaced_name),
            confidence: decision.confidence,
            reason: decision.reason,
            suggested_input: decision.suggested_input.unwrap_or_default(),
        })
    }

    fn on_cooldown(&self, intent: &str, now: Instant) -> bool {
        self.cooldowns
            .lock()
            .get(intent)
            .is_some_and(|until| *until > now)
    }

    pub fn is_on_cooldown(&self, intent: &str) -> bool {
        self.on_cooldown(intent, Instant::now())
    }

    pub fn reset_cooldowns(&self) {
        self.cooldowns.lock().clear();
    }
}

/// 去掉 ```json ... ``` 包裹
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{ConnectionRegistry, ServerConfig};
    use crate::testing::{MockLlmClient, MockToolServer, MockTransportFactory};

    async fn aggregator() -> Arc<ToolAggregator> {
        let factory = MockTransportFactory::new();
        factory.add_server(
            "node crm.js",
            MockToolServer::new()
                .with_tool("search_contacts", "Search CRM contacts by name or company"),
        );
        factory.add_server(
            "node web.js",
            MockToolServer::new().with_tool("web_search", "Search the public web"),
        );
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(factory)));
        for config in [
            ServerConfig::stdio("crm", "CRM", "node", vec!["crm.js"]),
            ServerConfig::stdio("web", "Web", "node", vec!["web.js"]),
        ] {
            registry.register(config).connect().await.unwrap();
        }
        Arc::new(ToolAggregator::new(registry))
    }

    async fn detector() -> IntentDetector {
        IntentDetector::new(aggregator().await, IntentConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_contact_at_company() {
        let detector = detector().await;
        let detection = detector.detect_pattern("can you look up the contact at Acme Corp");

        assert!(detection.detected);
        assert_eq!(detection.intent.as_deref(), Some("crm"));
        assert_eq!(detection.tool_name.as_deref(), Some("crm:search_contacts"));
        assert_eq!(detection.suggested_input["company"], "Acme Corp");
        assert_eq!(detection.suggested_input["query"], "the contact at Acme Corp");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_then_expires() {
        let detector = detector().await;
        assert!(detector.detect_pattern("who owns this account?").detected);
        assert!(detector.is_on_cooldown("crm"));

        // crm 冷却中，继续评估后面的规则：这句话只匹配 crm
        assert!(!detector.detect_pattern("and the account owner?").detected);

        // 同一句同时命中 search 规则时由 search 接手
        let fallback = detector.detect_pattern("find the account owner");
        assert_eq!(fallback.intent.as_deref(), Some("search"));
        assert_eq!(fallback.tool_name.as_deref(), Some("crm:search_contacts"));

        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert!(!detector.is_on_cooldown("crm"));
        assert_eq!(
            detector.detect_pattern("and the account owner?").intent.as_deref(),
            Some("crm")
        );
    }

    #[tokio::test]
    async fn test_unresolved_rule_keeps_cooldown_free() {
        let detector = detector().await;
        // calendar 规则命中但没有日历工具
        let detection = detector.detect_pattern("are you available next week?");
        assert!(!detection.detected);
        assert!(!detector.is_on_cooldown("calendar"));
    }

    #[tokio::test]
    async fn test_llm_decision_is_used() {
        let llm = Arc::new(MockLlmClient::new().with_response(
            "```json\n{\"detected\": true, \"toolName\": \"web:web_search\", \"confidence\": 0.9, \
             \"reason\": \"asked about news\", \"suggestedInput\": {\"query\": \"Acme funding\"}}\n```",
        ));
        let detector = detector().await.with_llm(llm.clone());
        let segments = vec![
            TranscriptSegment::me("did you see the news?"),
            TranscriptSegment::them("Acme just raised a round"),
        ];

        let detection = detector.detect(&segments, DetectionMode::Llm).await;
        assert!(detection.detected);
        assert_eq!(detection.tool_name.as_deref(), Some("web:web_search"));
        assert_eq!(detection.suggested_input["query"], "Acme funding");

        let sent = llm.last_messages().unwrap();
        let system = sent[0].content.as_deref().unwrap_or_default();
        assert!(system.contains("web:web_search"));
        let transcript = sent[1].content.as_deref().unwrap_or_default();
        assert!(transcript.contains("[Them] Acme just raised a round"));
    }

    #[tokio::test]
    async fn test_llm_failures_fall_back_to_patterns() {
        let llm = Arc::new(
            MockLlmClient::new()
                .with_response("definitely not json")
                .with_network_error("connection reset")
                .with_response("{\"detected\": true, \"toolName\": \"ghost:tool\"}"),
        );
        let detector = detector().await.with_llm(llm.clone());
        let segments = [TranscriptSegment::them("please look up Jane Doe")];

        for _ in 0..3 {
            detector.reset_cooldowns();
            let detection = detector.detect(&segments, DetectionMode::Llm).await;
            assert_eq!(detection.intent.as_deref(), Some("search"));
            assert_eq!(detection.suggested_input["name"], "Jane Doe");
        }
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_llm_negative_decision() {
        let llm = Arc::new(
            MockLlmClient::new()
                .with_response("{\"detected\": false, \"confidence\": 0.2, \"reason\": \"small talk\"}"),
        );
        let detector = detector().await.with_llm(llm);
        let detection = detector
            .detect(&[TranscriptSegment::them("how's the weather")], DetectionMode::Llm)
            .await;
        assert!(!detection.detected);
        assert_eq!(detection.reason, "small talk");
        assert!(detector.detect(&[], DetectionMode::Pattern).await.tool_name.is_none());
    }
}
