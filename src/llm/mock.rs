//! Mock LLM 客户端（用于测试，无需 API）
//!
//! MockChatClient 返回固定文本并计数调用；MockEmbeddingClient 按子串规则
//! 返回预设向量，未命中时返回全零向量（用于余弦退化用例）。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::ConciergeError;
use crate::llm::{ChatClient, EmbeddingClient};
use crate::memory::Message;

/// Mock 聊天客户端：固定回复 + 调用计数
#[derive(Debug, Default)]
pub struct MockChatClient {
    reply: String,
    calls: AtomicUsize,
}

impl MockChatClient {
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, ConciergeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Mock 嵌入客户端：文本含 marker 时返回对应向量，否则全零
#[derive(Debug, Default)]
pub struct MockEmbeddingClient {
    rules: Vec<(String, Vec<f32>)>,
    dim: usize,
    calls: AtomicUsize,
}

impl MockEmbeddingClient {
    pub fn new(dim: usize) -> Self {
        Self {
            rules: Vec::new(),
            dim,
            calls: AtomicUsize::new(0),
        }
    }

    /// 添加子串规则：文本包含 marker 时返回该向量（先注册者优先）
    pub fn with_rule(mut self, marker: impl Into<String>, vector: Vec<f32>) -> Self {
        self.rules.push((marker.into(), vector));
        self
    }

    /// 累计 embed 调用次数（按批次计）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        for (marker, vector) in &self.rules {
            if text.contains(marker.as_str()) {
                return vector.clone();
            }
        }
        vec![0.0; self.dim]
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ConciergeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}
