//! 轮次集成测试：无预订 / KB 不足 / 模型自报升级 / 正常应答

use std::sync::Arc;

use concierge::booking::MockBookingResolver;
use concierge::config::ConversationSection;
use concierge::conversation::{ConciergeService, TurnStatus};
use concierge::handoff::HandoffNotifier;
use concierge::kb::source::{Sheet, StaticWorkbookSource};
use concierge::kb::{KbStore, Workbook};
use concierge::llm::{MockChatClient, MockEmbeddingClient};
use concierge::store::Store;

const PHONE: &str = "+393331112233";

struct Fixture {
    service: ConciergeService,
    store: Store,
    chat: Arc<MockChatClient>,
    _dir: tempfile::TempDir,
}

/// 组一套完整服务：临时 SQLite + mock 预订 / 聊天 / 嵌入
async fn fixture(chat_reply: &str, kb_vector: Vec<f32>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();

    let store = Store::new(dir.path().join("test.sqlite3")).await.unwrap();

    let bookings_path = dir.path().join("bookings.json");
    std::fs::write(
        &bookings_path,
        format!(
            r#"{{"bookings":[{{"phone_e164":"{PHONE}","booking_id":"BK-1042","property_id":"P1","guest_last_name":"Rossi","guest_language":"it"}}]}}"#
        ),
    )
    .unwrap();
    let booking = Arc::new(MockBookingResolver::new(&bookings_path));

    let embedder = Arc::new(
        MockEmbeddingClient::new(2)
            .with_rule("QRY", vec![1.0, 0.0])
            .with_rule("risposta spa", kb_vector),
    );
    let kb = Arc::new(KbStore::new(store.clone(), embedder, 6, 0.80));

    let workbook = StaticWorkbookSource::new(Workbook {
        sheets: vec![
            Sheet {
                name: "KB".to_string(),
                rows: vec![
                    vec!["categoria", "struttura", "ambito", "descrizione", "risposta"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    vec!["spa", "*", "orari", "apertura spa", "risposta spa alle 9"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                ],
            },
            Sheet {
                name: "Anagrafica".to_string(),
                rows: vec![
                    vec!["ID", "Nome struttura", "Indirizzo"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    vec!["P1", "Villa Rosa", "Via Roma 1"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                ],
            },
        ],
    });
    kb.sync(&workbook).await.unwrap();

    let chat = Arc::new(MockChatClient::with_reply(chat_reply));
    let service = ConciergeService::new(
        store.clone(),
        kb,
        booking,
        chat.clone(),
        Arc::new(HandoffNotifier::disabled()),
        &ConversationSection::default(),
        "Niccolò",
    );

    Fixture {
        service,
        store,
        chat,
        _dir: dir,
    }
}

async fn last_assistant_message(store: &Store, phone: &str) -> String {
    let session = store.session_by_phone(phone).await.unwrap().unwrap();
    let messages = store.recent_messages(session.id, 10).await.unwrap();
    messages
        .iter()
        .rev()
        .find(|m| m.role == "assistant")
        .map(|m| m.content.clone())
        .unwrap()
}

#[tokio::test]
async fn unknown_phone_escalates_without_calling_the_model() {
    let f = fixture("non deve essere usato", vec![0.91, 0.41461]).await;

    let reply = f.service.handle_message("+390000000000", "QRY c'è la spa?").await.unwrap();

    assert_eq!(reply.status, TurnStatus::Handoff);
    assert!(!reply.booking_found);
    assert_eq!(f.chat.calls(), 0);

    let handoffs = f.store.recent_handoffs(10).await.unwrap();
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0].reason, "no_booking");
    assert!(handoffs[0].guest_last_name.is_none());

    // 应答是通用升级话术并已入转录
    let stored = last_assistant_message(&f.store, "+390000000000").await;
    assert!(stored.starts_with("Grazie per il messaggio."));
    assert_eq!(stored, reply.assistant_message);
}

#[tokio::test]
async fn low_kb_score_escalates_without_calling_the_model() {
    // 最佳分 0.4 < 阈值 0.80
    let f = fixture("non deve essere usato", vec![0.4, 0.91652]).await;

    let reply = f.service.handle_message(PHONE, "QRY a che ora apre la spa?").await.unwrap();

    assert_eq!(reply.status, TurnStatus::Handoff);
    assert!(reply.booking_found);
    assert!(!reply.kb_used);
    assert!((reply.kb_best_score.unwrap() - 0.4).abs() < 1e-3);
    assert_eq!(f.chat.calls(), 0);

    let handoffs = f.store.recent_handoffs(10).await.unwrap();
    assert_eq!(handoffs[0].reason, "no_kb_answer");
    assert_eq!(handoffs[0].guest_last_name.as_deref(), Some("Rossi"));

    // 预订字段已缓存到会话
    let session = f.store.session_by_phone(PHONE).await.unwrap().unwrap();
    assert_eq!(session.booking_id.as_deref(), Some("BK-1042"));
    assert_eq!(session.property_id.as_deref(), Some("P1"));
}

#[tokio::test]
async fn sentinel_in_model_output_is_replaced_by_handoff_text() {
    let f = fixture(
        "Mi dispiace, [[HANDOFF_OPERATOR]] per questa richiesta.",
        vec![0.91, 0.41461],
    )
    .await;

    let reply = f.service.handle_message(PHONE, "QRY a che ora apre la spa?").await.unwrap();

    assert_eq!(reply.status, TurnStatus::Handoff);
    assert!(reply.kb_used);
    assert_eq!(f.chat.calls(), 1);

    let handoffs = f.store.recent_handoffs(10).await.unwrap();
    assert_eq!(handoffs[0].reason, "model_handoff");

    // 模型原文被丢弃，存的是模板话术
    let stored = last_assistant_message(&f.store, PHONE).await;
    assert!(stored.contains("Sig./Sig.ra/Mx. Rossi"));
    assert!(!stored.contains("HANDOFF_OPERATOR"));
    assert_eq!(stored, reply.assistant_message);
}

#[tokio::test]
async fn answered_turn_stores_reply_and_refreshes_memory() {
    let f = fixture("  La spa apre alle 9:00.  ", vec![0.91, 0.41461]).await;

    let reply = f.service.handle_message(PHONE, "QRY a che ora apre la spa?").await.unwrap();

    assert_eq!(reply.status, TurnStatus::Ok);
    assert!(reply.booking_found);
    assert!(reply.kb_used);
    assert!(reply.kb_best_score.unwrap() >= 0.80);
    assert_eq!(reply.assistant_message, "La spa apre alle 9:00.");

    let stored = last_assistant_message(&f.store, PHONE).await;
    assert_eq!(stored, "La spa apre alle 9:00.");

    // 记忆刷新是 fire-and-forget：等它跑完
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let session = f.store.session_by_phone(PHONE).await.unwrap().unwrap();
    assert_eq!(session.memory_summary.as_deref(), Some("La spa apre alle 9:00."));
    // 应答 1 次 + 摘要 1 次
    assert_eq!(f.chat.calls(), 2);

    let handoffs = f.store.recent_handoffs(10).await.unwrap();
    assert!(handoffs.is_empty());
}

#[tokio::test]
async fn short_circuit_paths_do_not_refresh_memory() {
    let f = fixture("non deve essere usato", vec![0.4, 0.91652]).await;

    f.service.handle_message(PHONE, "QRY qualcosa").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let session = f.store.session_by_phone(PHONE).await.unwrap().unwrap();
    assert!(session.memory_summary.is_none());
    assert_eq!(f.chat.calls(), 0);
}
