//! HTTP 层：chat API、Twilio webhook、管理端点
//!
//! 薄胶水：会话语义都在 ConciergeService 里。对话面从不把原始错误
//! 透给客人；管理面可以返回错误细节，由 X-Admin-Key 保护。

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;

use crate::conversation::ConciergeService;
use crate::kb::{KbSource, KbStore};
use crate::store::Store;

/// 路由共享状态
pub struct AppState {
    pub service: Arc<ConciergeService>,
    pub store: Store,
    pub kb: Arc<KbStore>,
    pub kb_source: Arc<dyn KbSource>,
    pub admin_api_key: String,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/twilio/whatsapp", post(twilio_whatsapp))
        .route("/admin/status", get(admin_status))
        .route("/admin/handoffs", get(admin_handoffs))
        .route("/admin/kb/inspect", get(admin_kb_inspect))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    phone: String,
    message: String,
}

/// POST /api/chat - 开发 / 集成用的直连入口
async fn api_chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Response {
    let phone = payload.phone.trim();
    let message = payload.message.trim();
    if phone.is_empty() || message.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing 'phone' or 'message'.").into_response();
    }

    match state.service.handle_message(phone, message).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            tracing::error!("chat turn failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct TwilioForm {
    #[serde(rename = "From", default)]
    from: String,
    #[serde(rename = "Body", default)]
    body: String,
}

/// POST /twilio/whatsapp - Twilio WhatsApp webhook（form-urlencoded 进，TwiML 出）
async fn twilio_whatsapp(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TwilioForm>,
) -> Response {
    let mut phone = form.from.trim().to_string();
    let body = form.body.trim().to_string();
    if phone.is_empty() || body.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing From/Body").into_response();
    }

    // Twilio 的 From 形如 "whatsapp:+39..."，归一成裸 E.164
    if let Some(stripped) = phone.strip_prefix("whatsapp:") {
        phone = stripped.to_string();
    }

    // 对话面永远回礼貌文案，不透错误
    let reply = match state.service.handle_message(&phone, &body).await {
        Ok(r) => r.assistant_message,
        Err(e) => {
            tracing::error!("twilio turn failed: {}", e);
            "Grazie per il messaggio, La ricontatteremo al più presto.".to_string()
        }
    };

    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Message>{}</Message></Response>"#,
        xml_escape(&reply)
    );
    ([(header::CONTENT_TYPE, "application/xml")], twiml).into_response()
}

fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if state.admin_api_key.is_empty() || provided != state.admin_api_key {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

/// GET /admin/status - 核心状态计数
async fn admin_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    check_admin(&state, &headers)?;

    let counts = state.store.counts().await.map_err(|e| {
        tracing::error!("status query failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "kb_entries": counts.kb_entries,
        "sessions": counts.sessions,
        "handoffs": counts.handoffs,
        "registry_properties": state.kb.registry().len(),
    })))
}

#[derive(Debug, Deserialize)]
struct HandoffsQuery {
    #[serde(default = "default_handoffs_limit")]
    limit: usize,
}

fn default_handoffs_limit() -> usize {
    50
}

/// GET /admin/handoffs - 最近的升级记录
async fn admin_handoffs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HandoffsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    check_admin(&state, &headers)?;

    let limit = query.limit.clamp(1, 200);
    let items = state.store.recent_handoffs(limit).await.map_err(|e| {
        tracing::error!("handoffs query failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(serde_json::json!({ "ok": true, "items": items })))
}

/// GET /admin/kb/inspect - KB 源体检
async fn admin_kb_inspect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<crate::kb::InspectReport>, StatusCode> {
    check_admin(&state, &headers)?;
    Ok(Json(state.kb.inspect(state.kb_source.as_ref())))
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_escape_covers_reserved_chars() {
        assert_eq!(
            xml_escape(r#"a & b < c > "d" 'e'"#),
            "a &amp; b &lt; c &gt; &quot;d&quot; &apos;e&apos;"
        );
    }
}
