//! LLM 客户端抽象
//!
//! 核心只在规划阶段发起一次推理调用（分析记录），因此接口保持最小：
//! complete(messages) → 文本。能力内部的推理在各自 handler 中完成，对核心不可见。

mod mock;
mod traits;

pub use mock::MockLlmClient;
pub use traits::{LlmClient, Message, Role};
