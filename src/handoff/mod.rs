//! 人工升级：事件记录与 webhook 通知
//!
//! 通知是尽力而为的副作用：推送失败只留 warn 日志，绝不影响本轮回复。

use std::time::Duration;

use serde::Serialize;

use crate::config::HandoffSection;

/// 升级原因（闭集，落库为字符串）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    NoBooking,
    NoKbAnswer,
    ModelHandoff,
}

impl HandoffReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffReason::NoBooking => "no_booking",
            HandoffReason::NoKbAnswer => "no_kb_answer",
            HandoffReason::ModelHandoff => "model_handoff",
        }
    }
}

/// 升级事件：落库一份，可选推送一份
#[derive(Debug, Clone, Serialize)]
pub struct HandoffEvent {
    pub phone_e164: String,
    pub guest_last_name: Option<String>,
    pub property_id: Option<String>,
    pub booking_id: Option<String>,
    pub user_message: String,
    pub reason: HandoffReason,
}

/// Webhook 通知器；未配置 URL 时为空操作
pub struct HandoffNotifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl HandoffNotifier {
    pub fn from_config(cfg: &HandoffSection) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.notify_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            webhook_url: cfg.notify_webhook_url.clone(),
            client,
        }
    }

    /// 不推送的通知器（测试与未配置 webhook 的部署共用）
    pub fn disabled() -> Self {
        Self {
            webhook_url: None,
            client: reqwest::Client::new(),
        }
    }

    /// 推送升级事件；任何失败都吞掉，只记日志
    pub async fn notify(&self, event: &HandoffEvent) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        match self.client.post(url).json(event).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(status = %resp.status(), "handoff notify rejected");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("handoff notify failed: {}", e);
            }
        }
    }
}
