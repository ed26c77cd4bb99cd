//! 礼宾服务错误类型
//!
//! 单一错误枚举贯穿全库：存储、LLM、嵌入、预订查询、KB 源等各阶段失败都归到这里，
//! 由编排层决定是升级（handoff）还是向上传播。

use thiserror::Error;

/// 服务运行过程中可能出现的错误（存储、上游调用、配置、数据源）
#[derive(Error, Debug)]
pub enum ConciergeError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Booking lookup failed: {0}")]
    Booking(String),

    #[error("KB source error: {0}")]
    KbSource(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}
