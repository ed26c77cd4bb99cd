//! 会话编排：一轮消息的状态机
//!
//! RECEIVED → (预订解析) → (KB 检索) → 应答或升级。
//! 入站消息无条件先落库；短路路径（无预订 / KB 不足）不调用聊天模型；
//! 只有应答路径在返回后异步刷新记忆摘要。
//! 同一手机号的轮次经每号互斥锁串行，不同手机号并发。

pub mod prompt;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::booking::{BookingContext, BookingResolver};
use crate::config::ConversationSection;
use crate::error::ConciergeError;
use crate::handoff::{HandoffEvent, HandoffNotifier, HandoffReason};
use crate::kb::KbStore;
use crate::llm::ChatClient;
use crate::memory::{Message, MemorySummarizer, Role};
use crate::store::{SessionRow, Store};

/// 一轮的终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Ok,
    Handoff,
}

/// 一轮的结构化结果（HTTP 层原样返回）
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub status: TurnStatus,
    pub assistant_message: String,
    pub booking_found: bool,
    pub kb_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb_best_score: Option<f32>,
}

pub struct ConciergeService {
    store: Store,
    kb: Arc<KbStore>,
    booking: Arc<dyn BookingResolver>,
    chat: Arc<dyn ChatClient>,
    notifier: Arc<HandoffNotifier>,
    summarizer: Arc<MemorySummarizer>,
    history_window: usize,
    operator_name: String,
    /// 每手机号一把锁：同号轮次严格串行
    turn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConciergeService {
    pub fn new(
        store: Store,
        kb: Arc<KbStore>,
        booking: Arc<dyn BookingResolver>,
        chat: Arc<dyn ChatClient>,
        notifier: Arc<HandoffNotifier>,
        conversation: &ConversationSection,
        operator_name: &str,
    ) -> Self {
        let summarizer = Arc::new(MemorySummarizer::new(
            store.clone(),
            chat.clone(),
            conversation.memory_window,
        ));
        Self {
            store,
            kb,
            booking,
            chat,
            notifier,
            summarizer,
            history_window: conversation.history_window,
            operator_name: operator_name.to_string(),
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 处理一条入站消息，跑到终态（应答或升级）
    pub async fn handle_message(&self, phone_e164: &str, text: &str) -> Result<TurnReply, ConciergeError> {
        let phone_lock = {
            let mut locks = self.turn_locks.lock().await;
            // 只剩 map 一个引用的锁是空闲的，顺手清掉，map 不随手机号累积
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(phone_e164.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _turn = phone_lock.lock().await;

        // RECEIVED：入站消息无条件落库，首见手机号建会话
        let session = self.store.get_or_create_session(phone_e164).await?;
        self.store.append_message(session.id, "user", text).await?;

        // 预订解析失败降级为查无预订，不让单轮崩掉
        let booking = match self.booking.lookup(phone_e164).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(phone = phone_e164, "booking lookup failed: {}", e);
                None
            }
        };

        let Some(booking) = booking else {
            // NO_BOOKING：不调模型，直接升级
            return self
                .escalate(session.id, phone_e164, text, None, HandoffReason::NoBooking, false, None)
                .await;
        };

        self.store
            .set_booking(
                session.id,
                &booking.booking_id,
                &booking.property_id,
                booking.guest_last_name.as_deref(),
            )
            .await?;

        // KB 检索失败（嵌入上游不可用等）按检索为空处理，走升级
        let retrieved = match self.kb.retrieve(text, Some(&booking.property_id), None).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(phone = phone_e164, "kb retrieval failed: {}", e);
                Vec::new()
            }
        };
        let best_score = retrieved.first().map(|r| r.score).unwrap_or(0.0);

        if retrieved.is_empty() || best_score < self.kb.min_score() {
            // KB_INSUFFICIENT：不调模型生成答案
            return self
                .escalate(
                    session.id,
                    phone_e164,
                    text,
                    Some(&booking),
                    HandoffReason::NoKbAnswer,
                    false,
                    Some(best_score),
                )
                .await;
        }

        let messages = self.build_prompt(&session, &booking, text, &retrieved).await?;

        let assistant = match self.chat.complete(&messages).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(phone = phone_e164, "chat completion failed: {}", e);
                return self
                    .escalate(
                        session.id,
                        phone_e164,
                        text,
                        Some(&booking),
                        HandoffReason::ModelHandoff,
                        true,
                        Some(best_score),
                    )
                    .await;
            }
        };

        if prompt::contains_sentinel(&assistant) {
            // 模型自报不足：丢弃其文本，换成升级话术
            return self
                .escalate(
                    session.id,
                    phone_e164,
                    text,
                    Some(&booking),
                    HandoffReason::ModelHandoff,
                    true,
                    Some(best_score),
                )
                .await;
        }

        let assistant = assistant.trim().to_string();
        self.store.append_message(session.id, "assistant", &assistant).await?;

        // 应答路径才刷新记忆；发射后不管，失败只记日志
        let summarizer = self.summarizer.clone();
        let phone = phone_e164.to_string();
        tokio::spawn(async move {
            if let Err(e) = summarizer.refresh(&phone).await {
                tracing::warn!(phone = %phone, "memory refresh failed: {}", e);
            }
        });

        Ok(TurnReply {
            status: TurnStatus::Ok,
            assistant_message: assistant,
            booking_found: true,
            kb_used: true,
            kb_best_score: Some(best_score),
        })
    }

    /// 组装提示：人设、护栏、上下文、记忆、历史窗口、KB 块、当前消息
    async fn build_prompt(
        &self,
        session: &SessionRow,
        booking: &BookingContext,
        text: &str,
        retrieved: &[crate::kb::RetrievedKb],
    ) -> Result<Vec<Message>, ConciergeError> {
        let registry = self.kb.registry();

        let mut messages = vec![
            Message::system(prompt::AGENT_SYSTEM_PROMPT),
            Message::system(prompt::guardrails()),
            Message::system(prompt::context_block(booking, &registry)),
        ];

        if let Some(summary) = session.memory_summary.as_deref().filter(|s| !s.is_empty()) {
            messages.push(Message::system(format!("Memoria conversazione: {summary}")));
        }

        let mut history = self.store.recent_messages(session.id, self.history_window).await?;
        // 当前用户消息已落库：从历史尾部去掉，最后再显式追加
        if history
            .last()
            .map(|m| Role::parse(&m.role) == Role::User && m.content == text)
            .unwrap_or(false)
        {
            history.pop();
        }
        for m in history {
            match Role::parse(&m.role) {
                Role::User => messages.push(Message::user(m.content)),
                Role::Assistant => messages.push(Message::assistant(m.content)),
                Role::System => {}
            }
        }

        messages.push(Message::system(prompt::kb_block(retrieved)));
        messages.push(Message::user(text));
        Ok(messages)
    }

    /// 升级终态：落库升级记录、尽力推送、存模板应答
    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &self,
        session_id: i64,
        phone_e164: &str,
        text: &str,
        booking: Option<&BookingContext>,
        reason: HandoffReason,
        kb_used: bool,
        kb_best_score: Option<f32>,
    ) -> Result<TurnReply, ConciergeError> {
        let last_name = booking.and_then(|b| b.guest_last_name.as_deref());

        let event = HandoffEvent {
            phone_e164: phone_e164.to_string(),
            guest_last_name: last_name.map(String::from),
            property_id: booking.map(|b| b.property_id.clone()),
            booking_id: booking.map(|b| b.booking_id.clone()),
            user_message: text.to_string(),
            reason,
        };
        self.store.insert_handoff(&event).await?;

        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.notify(&event).await;
        });

        let assistant = prompt::handoff_message(last_name, &self.operator_name);
        self.store.append_message(session_id, "assistant", &assistant).await?;

        Ok(TurnReply {
            status: TurnStatus::Handoff,
            assistant_message: assistant,
            booking_found: booking.is_some(),
            kb_used,
            kb_best_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::MockBookingResolver;
    use crate::llm::{MockChatClient, MockEmbeddingClient};

    async fn service() -> (ConciergeService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("svc.sqlite3")).await.unwrap();
        let kb = Arc::new(KbStore::new(
            store.clone(),
            Arc::new(MockEmbeddingClient::new(2)),
            6,
            0.80,
        ));
        // fixture 不存在：所有手机号都查无预订，轮次走升级短路
        let booking = Arc::new(MockBookingResolver::new(dir.path().join("none.json")));
        let svc = ConciergeService::new(
            store,
            kb,
            booking,
            Arc::new(MockChatClient::with_reply("ok")),
            Arc::new(HandoffNotifier::disabled()),
            &ConversationSection::default(),
            "Niccolò",
        );
        (svc, dir)
    }

    #[tokio::test]
    async fn idle_turn_locks_are_pruned() {
        let (svc, _dir) = service().await;

        svc.handle_message("+391111111111", "ciao").await.unwrap();
        svc.handle_message("+392222222222", "ciao").await.unwrap();

        // 第二轮获取锁时清掉了第一轮留下的空闲锁
        let locks = svc.turn_locks.lock().await;
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key("+392222222222"));
    }
}
