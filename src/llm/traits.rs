//! LLM 客户端抽象
//!
//! 聊天与嵌入是两个独立的可失败上游调用，各自一个 trait，
//! 实现方（OpenAI 兼容 / Mock）自行处理超时。

use async_trait::async_trait;

use crate::error::ConciergeError;
use crate::memory::Message;

/// 聊天完成客户端
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// 非流式完成，返回首条回复文本
    async fn complete(&self, messages: &[Message]) -> Result<String, ConciergeError>;
}

/// 嵌入客户端：批量文本 → 同长度定维向量序列
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ConciergeError>;
}
