//! 对话消息类型与滚动记忆摘要
//!
//! Message/Role 与 LLM API 对齐；MemorySummarizer 在每个成功应答轮之后
//! 把最近消息压缩成短摘要写回会话（尽力而为，失败不影响已返回的回复）。

use std::sync::Arc;

use crate::error::ConciergeError;
use crate::llm::ChatClient;
use crate::store::Store;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// 从存储的角色字符串恢复；未知值归为 System
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

const SUMMARY_INSTRUCTION: &str = "Aggiorna una memoria sintetica della conversazione in italiano. \
Deve contenere solo fatti utili (preferenze, richieste, dettagli soggiorno) \
senza dati sensibili non necessari. Massimo 6 bullet.";

/// 滚动记忆摘要器：取最近 N 条消息 + 旧摘要，让 LLM 产出更新后的摘要并覆盖写回
pub struct MemorySummarizer {
    store: Store,
    chat: Arc<dyn ChatClient>,
    window: usize,
}

impl MemorySummarizer {
    pub fn new(store: Store, chat: Arc<dyn ChatClient>, window: usize) -> Self {
        Self {
            store,
            chat,
            window,
        }
    }

    /// 重新生成一个会话的记忆摘要。调用方通常在应答轮结束后 spawn 执行。
    pub async fn refresh(&self, phone_e164: &str) -> Result<(), ConciergeError> {
        let Some(session) = self.store.session_by_phone(phone_e164).await? else {
            return Ok(());
        };

        let recent = self.store.recent_messages(session.id, self.window).await?;
        let conv = recent
            .iter()
            .filter(|m| matches!(Role::parse(&m.role), Role::User | Role::Assistant))
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prior = session.memory_summary.unwrap_or_default();

        let prompt = vec![
            Message::system(SUMMARY_INSTRUCTION),
            Message::system(format!("Memoria precedente:\n{}", prior).trim().to_string()),
            Message::user(format!("Conversazione recente:\n{}", conv).trim().to_string()),
        ];

        let updated = self.chat.complete(&prompt).await?.trim().to_string();
        self.store.set_memory_summary(session.id, &updated).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        assert_eq!(Role::parse("user"), Role::User);
        assert_eq!(Role::parse("assistant"), Role::Assistant);
        assert_eq!(Role::parse("tool"), Role::System);
        assert_eq!(Role::User.as_str(), "user");
    }

    #[test]
    fn message_constructors() {
        let m = Message::user("ciao");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, "ciao");
    }
}
