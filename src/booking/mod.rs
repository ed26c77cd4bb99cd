//! 预订查询集成
//!
//! 从编排层看这是纯只读查询：手机号 -> 预订上下文。
//! 生产走 HTTP API，开发 / 测试走本地 JSON fixture。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::BookingSection;
use crate::error::ConciergeError;

/// 每轮从解析器拿到的预订上下文（瞬态值，会话只缓存字段）
#[derive(Debug, Clone)]
pub struct BookingContext {
    pub booking_id: String,
    pub property_id: String,
    pub guest_last_name: Option<String>,
    pub guest_language: Option<String>,
}

/// 预订解析器：幂等、无副作用的查询
#[async_trait]
pub trait BookingResolver: Send + Sync {
    async fn lookup(&self, phone_e164: &str) -> Result<Option<BookingContext>, ConciergeError>;
}

#[derive(Debug, Deserialize)]
struct MockBookingFile {
    #[serde(default)]
    bookings: Vec<MockBookingRecord>,
}

#[derive(Debug, Deserialize)]
struct MockBookingRecord {
    phone_e164: String,
    booking_id: String,
    property_id: String,
    guest_last_name: Option<String>,
    guest_language: Option<String>,
}

/// 本地 JSON fixture 解析器；文件缺失按查无预订处理
pub struct MockBookingResolver {
    path: PathBuf,
}

impl MockBookingResolver {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl BookingResolver for MockBookingResolver {
    async fn lookup(&self, phone_e164: &str) -> Result<Option<BookingContext>, ConciergeError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| ConciergeError::Booking(e.to_string()))?;
        let file: MockBookingFile =
            serde_json::from_str(&data).map_err(|e| ConciergeError::Booking(e.to_string()))?;

        Ok(file
            .bookings
            .into_iter()
            .find(|b| b.phone_e164.trim() == phone_e164)
            .map(|b| BookingContext {
                booking_id: b.booking_id,
                property_id: b.property_id,
                guest_last_name: b.guest_last_name,
                guest_language: b.guest_language,
            }))
    }
}

#[derive(Debug, Deserialize)]
struct BookingApiResponse {
    booking: Option<BookingApiRecord>,
}

#[derive(Debug, Deserialize)]
struct BookingApiRecord {
    id: serde_json::Value,
    property_id: serde_json::Value,
    guest_last_name: Option<String>,
    language: Option<String>,
}

fn value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// HTTP 预订解析器：GET {base}/api/bookings?phone=...，Bearer 鉴权
pub struct HttpBookingResolver {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBookingResolver {
    pub fn new(cfg: &BookingSection) -> Result<Self, ConciergeError> {
        let base_url = cfg
            .base_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConciergeError::Config("booking.base_url is missing".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| ConciergeError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        })
    }
}

#[async_trait]
impl BookingResolver for HttpBookingResolver {
    async fn lookup(&self, phone_e164: &str) -> Result<Option<BookingContext>, ConciergeError> {
        let url = format!("{}/api/bookings", self.base_url);
        let mut request = self.client.get(&url).query(&[("phone", phone_e164)]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConciergeError::Booking(e.to_string()))?
            .error_for_status()
            .map_err(|e| ConciergeError::Booking(e.to_string()))?;

        let body: BookingApiResponse = response
            .json()
            .await
            .map_err(|e| ConciergeError::Booking(e.to_string()))?;

        Ok(body.booking.map(|b| BookingContext {
            booking_id: value_to_string(&b.id),
            property_id: value_to_string(&b.property_id),
            guest_last_name: b.guest_last_name.filter(|s| !s.is_empty()),
            guest_language: b.language.filter(|s| !s.is_empty()),
        }))
    }
}

/// 按配置创建解析器：mock 走本地 fixture，否则要求 base_url
pub fn create_resolver(cfg: &BookingSection) -> Result<Arc<dyn BookingResolver>, ConciergeError> {
    if cfg.mock {
        Ok(Arc::new(MockBookingResolver::new(&cfg.mock_fixture_path)))
    } else {
        Ok(Arc::new(HttpBookingResolver::new(cfg)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_resolver_finds_booking_by_phone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookings.json");
        std::fs::write(
            &path,
            r#"{"bookings":[{"phone_e164":"+391111","booking_id":"B1","property_id":"P1","guest_last_name":"Rossi","guest_language":"it"}]}"#,
        )
        .unwrap();

        let resolver = MockBookingResolver::new(&path);
        let hit = resolver.lookup("+391111").await.unwrap().unwrap();
        assert_eq!(hit.booking_id, "B1");
        assert_eq!(hit.guest_last_name.as_deref(), Some("Rossi"));
        assert!(resolver.lookup("+399999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_fixture_means_no_booking() {
        let resolver = MockBookingResolver::new("/nonexistent/bookings.json");
        assert!(resolver.lookup("+391111").await.unwrap().is_none());
    }

    #[test]
    fn http_resolver_requires_base_url() {
        let cfg = BookingSection {
            mock: false,
            ..BookingSection::default()
        };
        assert!(HttpBookingResolver::new(&cfg).is_err());
    }
}
