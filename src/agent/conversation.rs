use crate::llm::types::Message;

/// 跨 run 保留的对话历史
///
/// 超过 `max_history` 时保留开头 `preserved_head` 条与最近的消息，丢弃中间部分。
/// 保留的尾部不会以 `tool` 消息开头（它对应的 assistant 调用已被裁掉）。
#[derive(Debug)]
pub struct Conversation {
    messages: Vec<Message>,
    max_history: usize,
    preserved_head: usize,
}

impl Conversation {
    pub fn new(max_history: usize, preserved_head: usize) -> Self {
        let max_history = max_history.max(1);
        Self {
            messages: Vec::new(),
            max_history,
            preserved_head: preserved_head.min(max_history),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 回滚到先前的快照
    pub fn restore(&mut self, snapshot: Vec<Message>) {
        self.messages = snapshot;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 返回被丢弃的条数
    pub fn trim(&mut self) -> usize {
        let len = self.messages.len();
        if len <= self.max_history {
            return 0;
        }

        let head = self.preserved_head;
        let mut tail_start = len - (self.max_history - head);
        while tail_start < len && self.messages[tail_start].is_role("tool") {
            tail_start += 1;
        }

        let tail = self.messages.split_off(tail_start);
        self.messages.truncate(head);
        self.messages.extend(tail);

        let evicted = len - self.messages.len();
        tracing::debug!(evicted, kept = self.messages.len(), "Conversation: 裁剪历史");
        evicted
    }
}
