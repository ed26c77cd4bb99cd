//! Concierge - WhatsApp 酒店礼宾智能体（RAG）
//!
//! 模块划分：
//! - **booking**: 预订查询集成（mock JSON / HTTP API）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **conversation**: 单轮编排状态机与提示组装
//! - **handoff**: 人工升级记录与 webhook 通知
//! - **http**: axum 服务（chat API / Twilio webhook / 管理端点）
//! - **kb**: 知识库（表格源解析、嵌入检索、差异同步、结构登记）
//! - **llm**: 聊天与嵌入客户端抽象（OpenAI 兼容 / Mock）
//! - **memory**: 消息类型与滚动记忆摘要
//! - **store**: SQLite 持久化（会话 / 消息 / 升级 / KB 条目）

pub mod booking;
pub mod config;
pub mod conversation;
pub mod error;
pub mod handoff;
pub mod http;
pub mod kb;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod store;

pub use error::ConciergeError;
