//! LLM 层：聊天与嵌入客户端抽象及实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockChatClient, MockEmbeddingClient};
pub use openai::{OpenAiChatClient, OpenAiEmbeddingClient};
pub use traits::{ChatClient, EmbeddingClient};
