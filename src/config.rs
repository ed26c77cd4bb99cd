//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONCIERGE__*` 覆盖
//! （双下划线表示嵌套，如 `CONCIERGE__KB__MIN_SCORE=0.75`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub kb: KbSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub booking: BookingSection,
    #[serde(default)]
    pub handoff: HandoffSection,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub admin: AdminSection,
}

/// [server] 段：监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// [llm] 段：聊天 / 嵌入模型与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 未设置时取 OPENAI_API_KEY 环境变量
    pub api_key: Option<String>,
    /// OpenAI 兼容端点；未设置时用官方默认
    pub base_url: Option<String>,
    pub chat_model: String,
    pub embed_model: String,
    /// 单次聊天 / 嵌入请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            chat_model: "gpt-4.1-mini".to_string(),
            embed_model: "text-embedding-3-small".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// [kb] 段：知识库数据源与检索参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KbSection {
    /// 两表工作簿（表一 KB 行，表二结构登记）的 JSON 文件路径
    pub source_path: PathBuf,
    pub top_k: usize,
    /// 最佳余弦分数低于该阈值时视为 KB 无法回答
    pub min_score: f32,
}

impl Default for KbSection {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("data/kb.json"),
            top_k: 6,
            min_score: 0.80,
        }
    }
}

/// [storage] 段：SQLite 路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub sqlite_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/concierge.sqlite3"),
        }
    }
}

/// [booking] 段：预订查询集成（mock 或真实 HTTP API）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BookingSection {
    /// true 时从本地 JSON 文件查预订，便于开发与测试
    pub mock: bool,
    pub mock_fixture_path: PathBuf,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BookingSection {
    fn default() -> Self {
        Self {
            mock: true,
            mock_fixture_path: PathBuf::from("data/mock_bookings.json"),
            base_url: None,
            api_key: None,
            timeout_secs: 10,
        }
    }
}

/// [handoff] 段：人工升级通知
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandoffSection {
    /// 升级事件推送的 webhook；未设置则只落库不推送
    pub notify_webhook_url: Option<String>,
    /// 升级话术中引用的人工客服称呼
    pub operator_name: String,
    pub notify_timeout_secs: u64,
}

impl Default for HandoffSection {
    fn default() -> Self {
        Self {
            notify_webhook_url: None,
            operator_name: "Niccolò".to_string(),
            notify_timeout_secs: 8,
        }
    }
}

/// [conversation] 段：上下文与记忆窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    /// 提示中携带的最近消息条数（不含本轮用户消息）
    pub history_window: usize,
    /// 记忆摘要读取的最近消息条数
    pub memory_window: usize,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            history_window: 16,
            memory_window: 20,
        }
    }
}

/// [admin] 段：管理端点共享密钥（空则管理端点一律 401）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminSection {
    pub api_key: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            llm: LlmSection::default(),
            kb: KbSection::default(),
            storage: StorageSection::default(),
            booking: BookingSection::default(),
            handoff: HandoffSection::default(),
            conversation: ConversationSection::default(),
            admin: AdminSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CONCIERGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONCIERGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONCIERGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.kb.top_k, 6);
        assert!((cfg.kb.min_score - 0.80).abs() < f32::EPSILON);
        assert_eq!(cfg.llm.chat_model, "gpt-4.1-mini");
        assert_eq!(cfg.booking.timeout_secs, 10);
        assert!(cfg.booking.mock);
        assert_eq!(cfg.conversation.history_window, 16);
        assert_eq!(cfg.conversation.memory_window, 20);
    }

    #[test]
    fn omitted_sections_keep_documented_defaults() {
        // 配置文件只写 [server]，缺失的段不能退化成零值
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str("[server]\nport = 8080", config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.kb.top_k, 6);
        assert!((cfg.kb.min_score - 0.80).abs() < f32::EPSILON);
        assert_eq!(cfg.llm.chat_model, "gpt-4.1-mini");
        assert_eq!(cfg.llm.embed_model, "text-embedding-3-small");
        assert_eq!(cfg.llm.request_timeout_secs, 30);
    }
}
