//! 通话转写片段
//!
//! 外部转写源按时间顺序提供 `{text, channel, start_time, end_time}`，
//! 意图检测与 Agent 循环只读取最近若干条。

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// 本地用户
    Me,
    /// 通话对方
    Them,
}

impl Channel {
    pub fn label(&self) -> &'static str {
        match self {
            Channel::Me => "Me",
            Channel::Them => "Them",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 一条转写片段，时间单位为秒（相对通话开始）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub channel: Channel,
    pub start_time: f64,
    pub end_time: f64,
}

impl TranscriptSegment {
    pub fn new(channel: Channel, text: impl Into<String>, start_time: f64, end_time: f64) -> Self {
        Self {
            text: text.into(),
            channel,
            start_time,
            end_time,
        }
    }

    pub fn me(text: impl Into<String>) -> Self {
        Self::new(Channel::Me, text, 0.0, 0.0)
    }

    pub fn them(text: impl Into<String>) -> Self {
        Self::new(Channel::Them, text, 0.0, 0.0)
    }
}

/// 取最后 `n` 条
pub fn recent(segments: &[TranscriptSegment], n: usize) -> &[TranscriptSegment] {
    &segments[segments.len().saturating_sub(n)..]
}

/// 渲染为 `[Me] ...` / `[Them] ...` 行，跳过空白片段
pub fn format_segments(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .filter(|s| !s.text.trim().is_empty())
        .map(|s| format!("[{}] {}", s.channel, s.text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 解析 `me: ...` / `them: ...` 形式的输入行，无前缀时视为对方发言
pub fn parse_line(line: &str) -> Option<(Channel, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (channel, text) = match line.split_once(':') {
        Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case("me") => (Channel::Me, rest),
        Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case("them") => {
            (Channel::Them, rest)
        }
        _ => (Channel::Them, line),
    };
    let text = text.trim();
    (!text.is_empty()).then_some((channel, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_and_format() {
        let segments = vec![
            TranscriptSegment::me("hello"),
            TranscriptSegment::them("   "),
            TranscriptSegment::them("who is our contact at Acme?"),
        ];
        assert_eq!(recent(&segments, 2).len(), 2);
        assert_eq!(recent(&segments, 10).len(), 3);
        assert_eq!(
            format_segments(&segments),
            "[Me] hello\n[Them] who is our contact at Acme?"
        );
    }

    #[test]
    fn test_parse_line_prefixes() {
        assert_eq!(parse_line("me: hi there"), Some((Channel::Me, "hi there")));
        assert_eq!(parse_line("THEM:ok"), Some((Channel::Them, "ok")));
        assert_eq!(
            parse_line("note: 10am works"),
            Some((Channel::Them, "note: 10am works"))
        );
        assert_eq!(parse_line("me:   "), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn test_channel_serializes_lowercase() {
        let value = serde_json::to_value(TranscriptSegment::me("x")).unwrap();
        assert_eq!(value["channel"], "me");
    }
}
